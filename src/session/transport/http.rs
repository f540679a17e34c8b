//! HTTP transport for OpenAI-compatible chat endpoints.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::Result;

use super::super::connection::Mode;
use super::{ByteStream, InferenceRequest, Transport};

/// Default base URL for a local, offline model server.
pub const DEFAULT_OFFLINE_URL: &str = "http://localhost:11434/v1";

/// Non-streaming completion body.
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    backend_url: Option<String>,
    backend_api_key: Option<String>,
    offline_url: String,
}

impl HttpTransport {
    pub fn new(backend_url: Option<String>, offline_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            backend_url: backend_url.filter(|u| !u.trim().is_empty()),
            backend_api_key: None,
            offline_url: offline_url.into(),
        }
    }

    pub fn with_backend_api_key(mut self, key: Option<String>) -> Self {
        self.backend_api_key = key;
        self
    }

    fn chat_url(base: &str) -> String {
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    /// Endpoint URL and bearer key for a mode.
    fn endpoint(&self, mode: &Mode) -> Result<(String, Option<String>)> {
        match mode {
            Mode::Direct(connection) => Ok((Self::chat_url(&connection.url), connection.api_key.clone())),
            Mode::Offline => Ok((Self::chat_url(&self.offline_url), None)),
            Mode::Backend => self
                .backend_url
                .as_deref()
                .map(|url| (Self::chat_url(url), self.backend_api_key.clone()))
                .ok_or(Error::ConnectionUnavailable),
            Mode::Unavailable => Err(Error::ConnectionUnavailable),
        }
    }

    async fn post(&self, mode: &Mode, request: &InferenceRequest) -> Result<Response> {
        let (url, key) = self.endpoint(mode)?;
        debug!("POST {} (stream={})", url, request.stream);

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("{status} from {url}: {error_text}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, mode: &Mode, request: &InferenceRequest) -> Result<ByteStream> {
        let response = self.post(mode, request).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| Error::Transport(e.to_string())));
        Ok(Box::pin(stream))
    }

    async fn complete(&self, mode: &Mode, request: &InferenceRequest) -> Result<String> {
        let response = self.post(mode, request).await?;
        let body: CompletionResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Transport("completion had no content".to_string()))
    }

    fn backend_reachable(&self) -> bool {
        self.backend_url.is_some()
    }
}
