//! Ferry command line
//!
//! ```text
//! ferry upload <local> <remote>
//! ferry download <remote> <local>
//! ferry ls [remote]
//! ferry mkdir <remote>
//! ferry rm <remote>
//! ferry mv <remote> <remote-dir>
//! ferry rename <remote> <name>
//! ```
//!
//! The provider is reached at `FERRY_BASE_URL` with the bearer token in
//! `FERRY_TOKEN`. Every other knob comes from `FERRY_*` variables.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferry::{EngineConfig, HttpStorageApi, ReqwestTransport, StaticCredentials, TransferEngine};

const USAGE: &str = "usage: ferry <upload|download|ls|mkdir|rm|mv|rename> <args>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let config = EngineConfig::from_env();
    let base_url = env::var("FERRY_BASE_URL").context("FERRY_BASE_URL is not set")?;
    let token = env::var("FERRY_TOKEN").context("FERRY_TOKEN is not set")?;

    let api = HttpStorageApi::new(Arc::new(ReqwestTransport::default()), base_url);
    let engine = TransferEngine::connect(config, Arc::new(api), Arc::new(StaticCredentials::new(token)))
        .await
        .context("failed to start transfer engine")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let arg = |i: usize| -> anyhow::Result<&str> {
        args.get(i).map(String::as_str).with_context(|| USAGE.to_string())
    };

    match command.as_str() {
        "upload" => {
            let object = engine.upload(arg(1)?, arg(2)?, &cancel).await?;
            println!("{}\t{}\t{} bytes", object.remote_path, object.file_id, object.size);
        }
        "download" => {
            let object = engine.download(arg(1)?, arg(2)?, &cancel).await?;
            println!("{}\t{} bytes", arg(2)?, object.size);
        }
        "ls" => {
            let path = args.get(1).map(String::as_str).unwrap_or("/");
            for entry in engine.list(path).await? {
                let kind = if entry.is_dir { "d" } else { "-" };
                println!("{}\t{:>12}\t{}\t{}", kind, entry.size, entry.modified_at.to_rfc3339(), entry.name);
            }
        }
        "mkdir" => {
            let object = engine.mkdir(arg(1)?).await?;
            println!("{}\t{}", object.remote_path, object.file_id);
        }
        "rm" => engine.delete(arg(1)?).await?,
        "mv" => {
            let object = engine.move_to(arg(1)?, arg(2)?).await?;
            println!("{}", object.remote_path);
        }
        "rename" => {
            let object = engine.rename(arg(1)?, arg(2)?).await?;
            println!("{}", object.remote_path);
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }

    Ok(())
}

/// Cancel in-flight work on Ctrl+C or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, cancelling transfers..."),
        _ = terminate => tracing::info!("Received SIGTERM, cancelling transfers..."),
    }
    cancel.cancel();
}
