//! HTTP transport for the generation endpoint (reqwest, bearer auth, NDJSON body).

use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

use super::protocol::{EndpointKind, GenerationRequest};
use super::session::{ByteStream, GenerationTransport};
use super::StreamError;
use crate::config::{endpoint_url, resolve_auth_token, Config, GenerationConfig};

/// POSTs requests to the chat-stream or tool-output path and hands back the response body.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    chat_stream_url: String,
    tool_output_url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &GenerationConfig, auth_token: Option<String>) -> Result<Self, StreamError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if config.read_timeout_secs > 0 {
            builder = builder.read_timeout(Duration::from_secs(config.read_timeout_secs));
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            chat_stream_url: endpoint_url(&config.base_url, &config.chat_stream_path),
            tool_output_url: endpoint_url(&config.base_url, &config.tool_output_path),
            auth_token,
        })
    }

    /// Build from the full config, resolving the token from env or file.
    pub fn from_config(config: &Config) -> Result<Self, StreamError> {
        Self::new(&config.generation, resolve_auth_token(config))
    }

    fn url(&self, endpoint: EndpointKind) -> &str {
        match endpoint {
            EndpointKind::Query => &self.chat_stream_url,
            EndpointKind::ToolOutput => &self.tool_output_url,
        }
    }
}

#[async_trait]
impl GenerationTransport for HttpTransport {
    async fn open(
        &self,
        endpoint: EndpointKind,
        request: &GenerationRequest,
    ) -> Result<ByteStream, StreamError> {
        let url = self.url(endpoint);
        log::debug!(
            "stream: POST {} ({} context windows, {} tools)",
            url,
            request.context.window_contents.len(),
            request.tools.len()
        );
        let mut req = self.client.post(url).json(request);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| format!("Failed to process query ({})", status));
            return Err(StreamError::Api(message));
        }
        let body = res
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(StreamError::Request));
        Ok(Box::pin(body))
    }
}
