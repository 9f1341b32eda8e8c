//! Rate Limiter Registry
//!
//! One pacer per endpoint class. A pacer enforces a minimum spacing between
//! calls that grows on backoff signals (capped at the class maximum) and
//! decays back toward the minimum on success. Waiters are served FIFO.

pub mod types;

pub use types::{endpoint, known_class, EndpointClass};

use std::cmp;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{PacerClassConfig, PacerConfig};

// ============================================================================
// Pacer
// ============================================================================

struct PacerState {
    /// Earliest instant the next call may start
    next_call: Instant,
    /// Current inter-call spacing
    sleep: Duration,
}

/// Token-paced gate for one endpoint class
pub struct Pacer {
    class: EndpointClass,
    config: PacerClassConfig,
    /// Held while waiting for a slot; tokio's mutex queues waiters fairly
    gate: tokio::sync::Mutex<()>,
    state: Mutex<PacerState>,
}

impl Pacer {
    pub fn new(class: EndpointClass, config: PacerClassConfig) -> Self {
        Self {
            class,
            config,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(PacerState {
                next_call: Instant::now(),
                sleep: config.min_sleep,
            }),
        }
    }

    pub fn class(&self) -> EndpointClass {
        self.class
    }

    /// Current spacing between calls
    pub fn current_sleep(&self) -> Duration {
        self.state.lock().sleep
    }

    /// Wait until this class may issue its next call
    pub async fn acquire(&self) {
        let _gate = self.gate.lock().await;

        // next_call can move forward while we sleep (rate-limit signal)
        loop {
            let next_call = self.state.lock().next_call;
            if Instant::now() >= next_call {
                break;
            }
            tokio::time::sleep_until(next_call).await;
        }

        let mut state = self.state.lock();
        state.next_call = Instant::now() + state.sleep;
    }

    /// Call succeeded: decay the spacing toward the minimum
    pub fn success(&self) {
        let mut state = self.state.lock();
        let shift = self.config.decay_constant.min(31);
        let decayed = state.sleep.saturating_sub(state.sleep / (1u32 << shift));
        state.sleep = cmp::max(decayed, self.config.min_sleep);
    }

    /// Provider signalled overload: double the spacing up to the maximum
    pub fn backoff(&self) {
        let mut state = self.state.lock();
        state.sleep = cmp::min(state.sleep.saturating_mul(2), self.config.max_sleep);

        tracing::debug!(
            class = self.class.as_str(),
            sleep_ms = state.sleep.as_millis() as u64,
            "Pacer backing off"
        );
    }

    /// Provider returned a rate-limit signal: back off and hold every caller
    /// of this class for at least `delay`
    pub fn rate_limited(&self, delay: Duration) {
        self.backoff();

        let mut state = self.state.lock();
        let hold_until = Instant::now() + cmp::max(delay, state.sleep);
        state.next_call = cmp::max(state.next_call, hold_until);

        tracing::debug!(
            class = self.class.as_str(),
            hold_ms = delay.as_millis() as u64,
            "Pacer holding after rate limit"
        );
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All pacers of one engine, indexed by endpoint class
pub struct PacerRegistry {
    pacers: Vec<Pacer>,
    /// Class used for endpoints missing from the static table
    strictest: EndpointClass,
}

impl PacerRegistry {
    pub fn new(config: &PacerConfig) -> Self {
        let pacers: Vec<Pacer> = EndpointClass::ALL
            .iter()
            .map(|class| {
                let class_config = config.classes.get(class).copied().unwrap_or_default();
                Pacer::new(*class, class_config)
            })
            .collect();

        let strictest = pacers
            .iter()
            .max_by_key(|p| p.config.min_sleep)
            .map(|p| p.class)
            .unwrap_or(EndpointClass::Mutation);

        Self { pacers, strictest }
    }

    pub fn pacer(&self, class: EndpointClass) -> &Pacer {
        // pacers are built in EndpointClass::ALL order
        &self.pacers[class as usize]
    }

    /// Class for a named endpoint; unknown names get the strictest class
    pub fn class_for(&self, endpoint: &str) -> EndpointClass {
        known_class(endpoint).unwrap_or(self.strictest)
    }

    pub fn for_endpoint(&self, endpoint: &str) -> &Pacer {
        self.pacer(self.class_for(endpoint))
    }

    /// Block until `endpoint` may be called; returns the pacer to report back to
    pub async fn acquire(&self, endpoint: &str) -> &Pacer {
        let pacer = self.for_endpoint(endpoint);
        pacer.acquire().await;
        pacer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PacerRegistry {
        PacerRegistry::new(&PacerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_between_calls() {
        let registry = registry();
        let start = Instant::now();

        registry.acquire(endpoint::LIST_CHILDREN).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        registry.acquire(endpoint::LIST_CHILDREN).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_classes_are_independent() {
        let registry = registry();
        registry.acquire(endpoint::DELETE).await;

        let start = Instant::now();
        registry.acquire(endpoint::UPLOAD_CHUNK).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_holds_next_call() {
        let registry = registry();
        let pacer = registry.acquire(endpoint::UPLOAD_CHUNK).await;
        pacer.rate_limited(Duration::from_secs(30));

        let start = Instant::now();
        registry.acquire(endpoint::UPLOAD_CHUNK).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_caps_and_success_decays() {
        let pacer = Pacer::new(
            EndpointClass::Listing,
            PacerClassConfig::new(100, 1_000, 1),
        );

        for _ in 0..10 {
            pacer.backoff();
        }
        assert_eq!(pacer.current_sleep(), Duration::from_millis(1_000));

        pacer.success();
        assert_eq!(pacer.current_sleep(), Duration::from_millis(500));

        for _ in 0..10 {
            pacer.success();
        }
        assert_eq!(pacer.current_sleep(), Duration::from_millis(100));
    }

    #[test]
    fn test_unknown_endpoint_uses_strictest_class() {
        let registry = registry();
        assert_eq!(registry.class_for("batch_purge"), EndpointClass::Mutation);
        assert_eq!(registry.class_for(endpoint::UPLOAD_CHUNK), EndpointClass::ChunkUpload);
    }
}
