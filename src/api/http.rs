//! HTTP transport and the JSON REST provider client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    ApiResult, ChunkAck, ChunkList, CompletionStatus, CreateSessionRequest,
    CreateSessionResponse, Credential, ErrorBody, ListPage, RemoteEntry, StorageApi,
};
use crate::error::ApiError;

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, credential: &Credential) -> Self {
        let value = format!("Bearer {}", credential.token);
        self.header("Authorization", value)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json<T: Serialize>(self, value: &T) -> ApiResult<Self> {
        let body = serde_json::to_vec(value).map_err(|e| ApiError::decode(e.to_string()))?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes one HTTP exchange; dropping the future cancels it
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> ApiResult<HttpResponse>;
}

#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> ApiResult<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::timeout(e.to_string())
    } else if e.is_decode() {
        ApiError::decode(e.to_string())
    } else {
        ApiError::network(e.to_string())
    }
}

// ============================================================================
// REST Client
// ============================================================================

/// Provider client speaking the `/api/v1` JSON dialect
pub struct HttpStorageApi {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
}

impl HttpStorageApi {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn send(&self, request: HttpRequest) -> ApiResult<HttpResponse> {
        let response = self.transport.execute(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(error_from_response(&response))
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: HttpRequest) -> ApiResult<T> {
        let response = self.send(request).await?;
        serde_json::from_slice(&response.body).map_err(|e| ApiError::decode(e.to_string()))
    }
}

/// Decode a non-success response into an [`ApiError`]
pub fn error_from_response(response: &HttpResponse) -> ApiError {
    let mut error = match serde_json::from_slice::<ErrorBody>(&response.body) {
        Ok(body) => {
            let error = ApiError::http(response.status, body.error);
            match body.code {
                Some(code) => error.with_code(code),
                None => error,
            }
        }
        Err(_) => ApiError::http(
            response.status,
            String::from_utf8_lossy(&response.body).into_owned(),
        ),
    };

    if let Some(seconds) = response
        .header("Retry-After")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        error = error.with_retry_after(Duration::from_secs(seconds));
    }
    error
}

fn enc(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

#[async_trait]
impl StorageApi for HttpStorageApi {
    async fn get_entry(&self, credential: &Credential, id: &str) -> ApiResult<RemoteEntry> {
        let request = HttpRequest::new(Method::Get, self.url(&format!("/entries/{}", enc(id))))
            .bearer(credential);
        self.send_json(request).await
    }

    async fn list_children(
        &self,
        credential: &Credential,
        parent_id: &str,
        page_token: Option<&str>,
    ) -> ApiResult<ListPage> {
        let mut url = self.url(&format!("/entries/{}/children", enc(parent_id)));
        if let Some(token) = page_token {
            url.push_str(&format!("?pageToken={}", enc(token)));
        }
        let request = HttpRequest::new(Method::Get, url).bearer(credential);
        self.send_json(request).await
    }

    async fn create_dir(
        &self,
        credential: &Credential,
        parent_id: &str,
        name: &str,
    ) -> ApiResult<RemoteEntry> {
        let body = serde_json::json!({ "name": name, "isDir": true });
        let request = HttpRequest::new(
            Method::Post,
            self.url(&format!("/entries/{}/children", enc(parent_id))),
        )
        .bearer(credential)
        .json(&body)?;
        self.send_json(request).await
    }

    async fn delete_entry(&self, credential: &Credential, id: &str) -> ApiResult<()> {
        let request = HttpRequest::new(Method::Delete, self.url(&format!("/entries/{}", enc(id))))
            .bearer(credential);
        self.send(request).await.map(|_| ())
    }

    async fn rename_entry(
        &self,
        credential: &Credential,
        id: &str,
        new_name: &str,
    ) -> ApiResult<RemoteEntry> {
        let body = serde_json::json!({ "name": new_name });
        let request = HttpRequest::new(Method::Patch, self.url(&format!("/entries/{}", enc(id))))
            .bearer(credential)
            .json(&body)?;
        self.send_json(request).await
    }

    async fn move_entry(
        &self,
        credential: &Credential,
        id: &str,
        new_parent_id: &str,
    ) -> ApiResult<RemoteEntry> {
        let body = serde_json::json!({ "parentId": new_parent_id });
        let request = HttpRequest::new(Method::Patch, self.url(&format!("/entries/{}", enc(id))))
            .bearer(credential)
            .json(&body)?;
        self.send_json(request).await
    }

    async fn create_session(
        &self,
        credential: &Credential,
        request: &CreateSessionRequest,
    ) -> ApiResult<CreateSessionResponse> {
        let http = HttpRequest::new(Method::Post, self.url("/upload/handshake"))
            .bearer(credential)
            .json(request)?;
        self.send_json(http).await
    }

    async fn upload_chunk(
        &self,
        credential: &Credential,
        session_id: &str,
        chunk_index: u64,
        offset: u64,
        data: &[u8],
        hash: &str,
    ) -> ApiResult<ChunkAck> {
        let request = HttpRequest::new(
            Method::Put,
            self.url(&format!("/upload/{}/chunks/{}", enc(session_id), chunk_index)),
        )
        .bearer(credential)
        .header("Content-Type", "application/octet-stream")
        .header("X-Chunk-Hash", hash)
        .header("X-Chunk-Offset", offset.to_string())
        .body(data.to_vec());
        self.send_json(request).await
    }

    async fn uploaded_chunks(
        &self,
        credential: &Credential,
        session_id: &str,
    ) -> ApiResult<Vec<ChunkAck>> {
        let request = HttpRequest::new(
            Method::Get,
            self.url(&format!("/upload/{}/chunks", enc(session_id))),
        )
        .bearer(credential);
        let list: ChunkList = self.send_json(request).await?;
        Ok(list.chunks)
    }

    async fn upload_single(
        &self,
        credential: &Credential,
        session_id: &str,
        data: &[u8],
        hash: &str,
    ) -> ApiResult<RemoteEntry> {
        let request = HttpRequest::new(
            Method::Post,
            self.url(&format!("/upload/{}/single", enc(session_id))),
        )
        .bearer(credential)
        .header("Content-Type", "application/octet-stream")
        .header("X-Content-Hash", hash)
        .body(data.to_vec());
        self.send_json(request).await
    }

    async fn complete_session(
        &self,
        credential: &Credential,
        session_id: &str,
    ) -> ApiResult<CompletionStatus> {
        let request = HttpRequest::new(
            Method::Post,
            self.url(&format!("/upload/{}/finalize", enc(session_id))),
        )
        .bearer(credential);
        self.send_json(request).await
    }

    async fn session_status(
        &self,
        credential: &Credential,
        session_id: &str,
    ) -> ApiResult<CompletionStatus> {
        let request = HttpRequest::new(
            Method::Get,
            self.url(&format!("/upload/{}", enc(session_id))),
        )
        .bearer(credential);
        self.send_json(request).await
    }

    async fn abort_session(&self, credential: &Credential, session_id: &str) -> ApiResult<()> {
        let request = HttpRequest::new(
            Method::Delete,
            self.url(&format!("/upload/{}", enc(session_id))),
        )
        .bearer(credential);
        self.send(request).await.map(|_| ())
    }

    async fn read_range(
        &self,
        credential: &Credential,
        id: &str,
        offset: u64,
        length: u64,
    ) -> ApiResult<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let last = offset + length - 1;
        let request = HttpRequest::new(
            Method::Get,
            self.url(&format!("/entries/{}/content", enc(id))),
        )
        .bearer(credential)
        .header("Range", format!("bytes={}-{}", offset, last));
        let response = self.send(request).await?;

        // A 200 carries the whole object
        if response.status == 200 && response.body.len() as u64 > length {
            let start = (offset as usize).min(response.body.len());
            let end = (start + length as usize).min(response.body.len());
            return Ok(response.body[start..end].to_vec());
        }
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_and_retry_after_are_decoded() {
        let response = HttpResponse {
            status: 429,
            headers: vec![("retry-after".to_string(), "42".to_string())],
            body: br#"{"error":"too many requests","code":"RATE_LIMITED"}"#.to_vec(),
        };

        let error = error_from_response(&response);
        assert_eq!(error.status, Some(429));
        assert_eq!(error.code.as_deref(), Some("RATE_LIMITED"));
        assert_eq!(error.retry_after, Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_plain_error_body_kept_as_message() {
        let response = HttpResponse {
            status: 502,
            headers: Vec::new(),
            body: b"bad gateway".to_vec(),
        };

        let error = error_from_response(&response);
        assert_eq!(error.message, "bad gateway");
        assert!(error.code.is_none());
    }

    #[test]
    fn test_urls_are_encoded() {
        let api = HttpStorageApi::new(Arc::new(ReqwestTransport::default()), "http://host/");
        assert_eq!(
            api.url(&format!("/entries/{}", enc("a b/c"))),
            "http://host/api/v1/entries/a%20b%2Fc"
        );
    }
}
