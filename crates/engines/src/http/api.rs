//! REST client for the HTTP+SSE backend.
//!
//! Every call is stateless; the working directory travels as a request
//! header. The client is immutable — switching directory produces a new
//! instance sharing the same connection pool.

use super::wire;
use crate::error::{EngineError, Result};
use futures::stream::BoxStream;
use serde_json::Value;
use std::time::Duration;

/// Header carrying the per-request working directory.
pub const DIRECTORY_HEADER: &str = "x-opencode-directory";

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct HttpApiClient {
    http: reqwest::Client,
    base_url: String,
    directory: Option<String>,
}

impl HttpApiClient {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http,
            base_url,
            directory: None,
        }
    }

    /// New client bound to a directory; `self` stays untouched.
    #[must_use]
    pub fn with_directory(&self, directory: &str) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            directory: Some(directory.to_string()),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(dir) = &self.directory {
            req = req.header(DIRECTORY_HEADER, dir);
        }
        req
    }

    async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(EngineError::Transport(format!(
            "backend returned {status}: {}",
            body.chars().take(200).collect::<String>()
        )))
    }

    /// Liveness probe; also used to recognise an already-running backend
    /// when the preferred port is occupied.
    pub async fn probe(&self) -> Result<wire::WireProviderList> {
        let resp = self
            .request(reqwest::Method::GET, "/provider")
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        Ok(resp.json().await.unwrap_or_default())
    }

    pub async fn list_sessions(&self) -> Result<Vec<wire::WireSession>> {
        let resp = self.request(reqwest::Method::GET, "/session").send().await?;
        Ok(Self::expect_success(resp).await?.json().await?)
    }

    pub async fn create_session(&self) -> Result<wire::WireSession> {
        let resp = self
            .request(reqwest::Method::POST, "/session")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        Ok(Self::expect_success(resp).await?.json().await?)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<wire::WireSession>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/session/{session_id}"))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::expect_success(resp).await?.json().await?))
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/session/{session_id}"))
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<wire::WireMessageWithParts>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/session/{session_id}/message"),
            )
            .send()
            .await?;
        Ok(Self::expect_success(resp).await?.json().await?)
    }

    /// Kick off a prompt turn. The response body is ignored: completion is
    /// observed on the event stream.
    pub async fn post_message(&self, session_id: &str, body: &Value) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/session/{session_id}/message"),
            )
            .json(body)
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    pub async fn abort(&self, session_id: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/session/{session_id}/abort"),
            )
            .json(&serde_json::json!({}))
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    pub async fn reply_permission(&self, permission_id: &str, response: &Value) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/permission/{permission_id}/reply"),
            )
            .json(response)
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    /// Open the long-lived global event stream.
    pub async fn event_stream(
        &self,
    ) -> Result<BoxStream<'static, std::result::Result<sse_stream::Sse, sse_stream::Error>>> {
        use futures::StreamExt as _;
        let resp = self
            .request(reqwest::Method::GET, "/global/event")
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        Ok(sse_stream::SseStream::from_byte_stream(resp.bytes_stream()).boxed())
    }
}
