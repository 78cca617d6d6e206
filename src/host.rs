//! Outbound delivery of informational messages into a session transcript.
//!
//! The host exposes a prompt call that appends a message without asking the
//! assistant to reply. [`SessionHost`] abstracts over how that call is made:
//! a JSON line on a writer (usually stdout) or an HTTP request to the host
//! server.

use crate::config::{HostConfig, HostMode};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A message to inject into a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub session_id: String,
    pub no_reply: bool,
    pub text: String,
}

impl PromptRequest {
    /// A message that is displayed but does not trigger a response.
    pub fn informational(session_id: &str, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            no_reply: true,
            text: text.into(),
        }
    }
}

/// Errors delivering a prompt to the host.
#[derive(Debug)]
pub enum HostError {
    Io { source: std::io::Error },
    Serialize { source: serde_json::Error },
    Http { source: reqwest::Error },
    /// The host answered with a non-success status.
    Status { status: u16, body: String },
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::Io { source } => write!(f, "failed to write prompt: {source}"),
            HostError::Serialize { source } => write!(f, "failed to encode prompt: {source}"),
            HostError::Http { source } => write!(f, "prompt request failed: {source}"),
            HostError::Status { status, body } => {
                write!(f, "host rejected prompt with status {status}: {body}")
            }
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostError::Io { source } => Some(source),
            HostError::Serialize { source } => Some(source),
            HostError::Http { source } => Some(source),
            HostError::Status { .. } => None,
        }
    }
}

/// Capability to inject messages into a session transcript.
pub trait SessionHost {
    fn prompt(&self, request: &PromptRequest) -> impl Future<Output = Result<(), HostError>>;
}

/// Writes each prompt as one JSON line: `{"sessionId":..,"noReply":true,"text":..}`.
pub struct JsonLinesHost<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> JsonLinesHost<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    #[allow(dead_code)]
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesHost<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin> SessionHost for JsonLinesHost<W> {
    async fn prompt(&self, request: &PromptRequest) -> Result<(), HostError> {
        let mut line =
            serde_json::to_vec(request).map_err(|e| HostError::Serialize { source: e })?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| HostError::Io { source: e })?;
        writer
            .flush()
            .await
            .map_err(|e| HostError::Io { source: e })
    }
}

/// Posts prompts to the host server's `/session/{id}/message` endpoint.
pub struct HttpHost {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHost {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HostError::Http { source: e })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn message_url(&self, session_id: &str) -> String {
        format!("{}/session/{}/message", self.base_url, session_id)
    }
}

impl SessionHost for HttpHost {
    async fn prompt(&self, request: &PromptRequest) -> Result<(), HostError> {
        let body = serde_json::json!({
            "noReply": request.no_reply,
            "parts": [{ "type": "text", "text": request.text }],
        });
        let resp = self
            .client
            .post(self.message_url(&request.session_id))
            .json(&body)
            .send()
            .await
            .map_err(|e| HostError::Http { source: e })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HostError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// The host binding selected by configuration.
pub enum ConfiguredHost {
    Stdout(JsonLinesHost<tokio::io::Stdout>),
    Http(HttpHost),
}

impl ConfiguredHost {
    pub fn from_config(config: &HostConfig) -> Result<Self, HostError> {
        Ok(match config.mode {
            HostMode::Stdout => ConfiguredHost::Stdout(JsonLinesHost::stdout()),
            HostMode::Http => ConfiguredHost::Http(HttpHost::new(
                &config.base_url,
                Duration::from_secs(config.request_timeout_secs),
            )?),
        })
    }
}

impl SessionHost for ConfiguredHost {
    async fn prompt(&self, request: &PromptRequest) -> Result<(), HostError> {
        match self {
            ConfiguredHost::Stdout(host) => host.prompt(request).await,
            ConfiguredHost::Http(host) => host.prompt(request).await,
        }
    }
}
