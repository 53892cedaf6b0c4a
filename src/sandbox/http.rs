//! Sandbox control API client.
//!
//! The production [`SandboxProcesses`] implementation: the sandbox exposes
//! its process table over a small HTTP control API and this client wraps
//! it with reqwest. Connection-level failures map to
//! [`SandboxError::Unreachable`]; a 409 on start carries the sandbox's
//! rejection message verbatim so the supervisor can recognize
//! "already running".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

use super::{ProcessLogs, ProcessRecord, SandboxProcesses};

#[derive(Debug, Serialize)]
struct StartProcessRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Deserialize)]
struct ControlApiError {
    error: String,
}

pub struct HttpSandbox {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSandbox {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Pull the error message out of a non-success control API response.
    async fn api_message(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<ControlApiError>().await {
            Ok(body) => body.error,
            Err(_) => format!("control API returned {status}"),
        }
    }
}

fn transport_error(e: reqwest::Error) -> SandboxError {
    SandboxError::Unreachable(e.to_string())
}

#[async_trait]
impl SandboxProcesses for HttpSandbox {
    async fn start_process(&self, command: &str) -> Result<ProcessRecord, SandboxError> {
        let response = self
            .client
            .post(self.url("/processes"))
            .json(&StartProcessRequest { command })
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => {
                response.json().await.map_err(transport_error)
            }
            StatusCode::CONFLICT => Err(SandboxError::StartRejected {
                message: Self::api_message(response).await,
            }),
            _ => Err(SandboxError::Api(Self::api_message(response).await)),
        }
    }

    async fn list_processes(&self) -> Result<Vec<ProcessRecord>, SandboxError> {
        let response = self
            .client
            .get(self.url("/processes"))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(SandboxError::Api(Self::api_message(response).await));
        }
        response.json().await.map_err(transport_error)
    }

    async fn kill_process(&self, id: &str) -> Result<(), SandboxError> {
        let response = self
            .client
            .delete(self.url(&format!("/processes/{id}")))
            .send()
            .await
            .map_err(transport_error)?;
        // Killing an already-gone process is fine.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(SandboxError::Api(Self::api_message(response).await))
        }
    }

    async fn process_logs(&self, id: &str) -> Result<ProcessLogs, SandboxError> {
        let response = self
            .client
            .get(self.url(&format!("/processes/{id}/logs")))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(SandboxError::Api(Self::api_message(response).await));
        }
        response.json().await.map_err(transport_error)
    }

    async fn wait_for_port(&self, port: u16, timeout: Duration) -> Result<(), SandboxError> {
        let timeout_ms = timeout.as_millis() as u64;
        let response = self
            .client
            .post(self.url(&format!("/ports/{port}/wait")))
            .query(&[("timeout_ms", timeout_ms)])
            // Leave headroom over the sandbox-side wait before the HTTP
            // request itself gives up.
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Err(SandboxError::PortTimeout {
                    port,
                    waited_ms: timeout_ms,
                })
            }
            _ => Err(SandboxError::Api(Self::api_message(response).await)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_normalized() {
        let sandbox = HttpSandbox::new("http://127.0.0.1:7070/");
        assert_eq!(sandbox.url("/processes"), "http://127.0.0.1:7070/processes");
    }
}
