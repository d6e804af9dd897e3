// HTTP backend implementation over reqwest
use crate::application::console_backend::{BackendError, ConsoleBackend, FrameStream};
use crate::domain::command::{ApiResponse, CommandRequest};
use crate::domain::machine::MachineId;
use crate::infrastructure::config::{machine_path, BackendSettings};
use crate::infrastructure::sse_decoder::SseDecoder;
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HttpConsoleBackend {
    client: reqwest::Client,
    base_url: String,
    stream_path: String,
    context_path: String,
    request_timeout: Duration,
}

impl HttpConsoleBackend {
    pub fn new(settings: &BackendSettings) -> anyhow::Result<Self> {
        // Timeouts are set per request; the update stream has none.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            stream_path: settings.stream_path.clone(),
            context_path: settings.context_path.clone(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        })
    }

    fn machine_url(&self, template: &str, machine_id: MachineId) -> String {
        format!("{}{}", self.base_url, machine_path(template, machine_id))
    }

    async fn read_envelope(response: reqwest::Response) -> Result<ApiResponse, BackendError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if matches!(status.as_u16(), 401 | 403) {
            return Err(BackendError::Unauthorized(status.as_u16()));
        }

        match serde_json::from_str::<ApiResponse>(&body) {
            Ok(envelope) if status.is_success() => Ok(envelope),
            Ok(mut envelope) => {
                envelope.success = false;
                if envelope.error.is_none() {
                    envelope.error = envelope
                        .message
                        .clone()
                        .or_else(|| Some(format!("HTTP {}", status.as_u16())));
                }
                Ok(envelope)
            }
            Err(e) if status.is_success() => Err(BackendError::Decode(e.to_string())),
            Err(_) => {
                let message = body.trim();
                let message = if message.is_empty() {
                    status.canonical_reason().unwrap_or("request failed")
                } else {
                    message
                };
                Err(BackendError::from_status(status.as_u16(), message))
            }
        }
    }
}

fn transport(e: reqwest::Error) -> BackendError {
    BackendError::Transport(e.to_string())
}

/// Turn a streaming response body into decoded event payloads.
fn frames(response: reqwest::Response) -> FrameStream {
    let mut body = response.bytes_stream();
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in decoder.push(&bytes) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(transport(e));
                    return;
                }
            }
        }
        if let Some(frame) = decoder.finish() {
            yield Ok(frame);
        }
    })
}

#[async_trait]
impl ConsoleBackend for HttpConsoleBackend {
    async fn open_stream(&self, machine_id: MachineId) -> Result<FrameStream, BackendError> {
        let url = self.machine_url(&self.stream_path, machine_id);
        tracing::debug!(machine_id = %machine_id, url = %url, "Opening update stream");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body.trim()));
        }
        Ok(frames(response))
    }

    async fn consult_context(&self, machine_id: MachineId) -> Result<ApiResponse, BackendError> {
        let url = self.machine_url(&self.context_path, machine_id);
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport)?;
        Self::read_envelope(response).await
    }

    async fn post_command(&self, request: &CommandRequest) -> Result<ApiResponse, BackendError> {
        let url = format!("{}{}", self.base_url, request.path);
        let response = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .timeout(self.request_timeout)
            .json(&request.body)
            .send()
            .await
            .map_err(transport)?;
        Self::read_envelope(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: &str) -> BackendSettings {
        BackendSettings {
            base_url: base_url.to_string(),
            request_timeout_secs: 10,
            stream_path: "/api/sse/updates/${machine_id}".to_string(),
            context_path: "/api/maquina/${machine_id}/contexto".to_string(),
        }
    }

    #[test]
    fn test_machine_urls() {
        let backend = HttpConsoleBackend::new(&settings("http://10.0.0.5:3000/")).unwrap();
        let machine = MachineId::new(130).unwrap();

        assert_eq!(
            backend.machine_url(&backend.stream_path, machine),
            "http://10.0.0.5:3000/api/sse/updates/130"
        );
        assert_eq!(
            backend.machine_url(&backend.context_path, machine),
            "http://10.0.0.5:3000/api/maquina/130/contexto"
        );
    }
}
