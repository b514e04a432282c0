//! Typed Service Client
//!
//! The wrapper a manager hands to the orchestrating process. It owns the
//! child's endpoint (and therefore its own correlation registry), so once
//! obtained it may be used from any task, while the manager itself stays
//! single-owner.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use crate::protocol::methods;

/// What a server reports in its `initialize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

pub struct ServiceClient {
    endpoint: Arc<Endpoint>,
    pid: u32,
    label: String,
}

impl ServiceClient {
    pub(crate) fn new(endpoint: Arc<Endpoint>, pid: u32, label: impl Into<String>) -> Self {
        Self {
            endpoint,
            pid,
            label: label.into(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Raw endpoint access for feature-specific calls.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// The handshake that promotes a spawned child to `Running`. Carries
    /// our own pid so the child can detect parent death and self-terminate.
    pub(crate) async fn initialize(
        &self,
        parent_pid: u32,
        limit: Duration,
    ) -> Result<ServerInfo, EndpointError> {
        let value = self
            .endpoint
            .request_with_timeout(
                methods::INITIALIZE,
                Some(serde_json::json!({ "processId": parent_pid })),
                limit,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| EndpointError::Protocol(e.to_string()))
    }

    pub async fn ping(&self) -> Result<(), EndpointError> {
        self.endpoint.request(methods::PING, None).await.map(|_| ())
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, EndpointError> {
        self.endpoint.request(method, params).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> Result<Value, EndpointError> {
        self.endpoint.request_with_timeout(method, params, limit).await
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), EndpointError> {
        self.endpoint.notify(method, params)
    }

    /// The protocol goodbye: a bounded `shutdown` request followed by the
    /// `exit` notification. Failures are logged, never surfaced — the
    /// manager kills the process tree unconditionally afterwards.
    pub(crate) async fn send_shutdown_sequence(&self, limit: Duration) {
        if let Err(e) = self
            .endpoint
            .request_with_timeout(methods::SHUTDOWN, None, limit)
            .await
        {
            tracing::debug!("{}: shutdown request failed: {}", self.label, e);
        }
        if let Err(e) = self.endpoint.notify(methods::EXIT, None) {
            tracing::debug!("{}: exit notification failed: {}", self.label, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_tolerates_missing_optionals() {
        let info: ServerInfo = serde_json::from_value(serde_json::json!({
            "name": "robot-ls"
        }))
        .unwrap();
        assert_eq!(info.name, "robot-ls");
        assert!(info.version.is_none());
        assert!(info.pid.is_none());

        let full: ServerInfo = serde_json::from_value(serde_json::json!({
            "name": "robot-ls",
            "version": "0.3.0",
            "pid": 4242
        }))
        .unwrap();
        assert_eq!(full.pid, Some(4242));
    }
}
