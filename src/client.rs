//! HTTP client for a running bridge.
//!
//! Transport failures (refused connection, timeout) are reported as
//! `BRIDGE_UNAVAILABLE`; everything else comes back as the bridge's own
//! envelope.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::{major_version, HealthBody, RpcRequest, RpcResponse, PROTOCOL_MAJOR};
use crate::error::AppError;
use crate::orchestrator::RpcTransport;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Extra time the HTTP request gets on top of the call's own timeout.
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BridgeClient {
    base_url: String,
    http: reqwest::Client,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AppError::generic(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One `GET /health`. Any transport problem or non-2xx answer means the
    /// bridge is unavailable.
    pub async fn health(&self, timeout: Duration) -> Result<HealthBody, AppError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        if !response.status().is_success() {
            return Err(AppError::unavailable(format!(
                "bridge health check returned {}",
                response.status()
            )));
        }
        let body: HealthBody = response
            .json()
            .await
            .map_err(|e| AppError::generic(format!("malformed health response: {e}")))?;
        check_major(&body.protocol_version)?;
        Ok(body)
    }

    /// Send one envelope and return the bridge's answer. `Err` means no
    /// usable envelope came back.
    pub async fn send(&self, request: RpcRequest) -> Result<RpcResponse, AppError> {
        let mut builder = self.http.post(format!("{}/rpc", self.base_url)).json(&request);
        if let Some(ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms) + TIMEOUT_SLACK);
        }
        let response = builder.send().await.map_err(|e| self.transport_error(&e))?;
        let status = response.status();
        let envelope: RpcResponse = response.json().await.map_err(|e| {
            AppError::generic(format!("malformed response from bridge (http {status}): {e}"))
        })?;
        check_major(&envelope.protocol_version)?;
        Ok(envelope)
    }

    /// Call a method and unwrap the envelope into its result.
    pub async fn invoke(&self, id: impl Into<Value>, method: &str, params: Value) -> Result<Value, AppError> {
        self.send(RpcRequest::new(id, method, params)).await?.into_result()
    }

    /// Ask the bridge to shut down gracefully.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        self.http
            .post(format!("{}/shutdown", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        Ok(())
    }

    fn transport_error(&self, e: &reqwest::Error) -> AppError {
        if e.is_decode() {
            AppError::generic(format!("unreadable response from {}: {e}", self.base_url))
        } else {
            AppError::unavailable(format!("bridge at {} is unreachable: {e}", self.base_url))
        }
    }
}

fn check_major(version: &str) -> Result<(), AppError> {
    match major_version(version) {
        Some(PROTOCOL_MAJOR) => Ok(()),
        _ => Err(AppError::generic(format!(
            "bridge speaks protocol {version}, this client requires {PROTOCOL_MAJOR}.x"
        ))),
    }
}

#[async_trait]
impl RpcTransport for BridgeClient {
    async fn call(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        match self.send(request).await {
            Ok(response) => response,
            Err(e) => RpcResponse::failure(id, &e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::api;
    use crate::dispatcher::Dispatcher;
    use crate::error::ErrorCode;
    use crate::testing::{setup_test_dir, test_state};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::sync::Notify;

    async fn live_bridge(tag: &str) -> (BridgeClient, Arc<Notify>) {
        let dir = setup_test_dir(tag);
        let listener = api::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(api::serve(listener, Dispatcher::new(test_state(&dir)), Arc::clone(&shutdown)));
        (BridgeClient::new(url).unwrap(), shutdown)
    }

    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn test_invoke_and_health() {
        let (client, shutdown) = live_bridge("client_invoke").await;
        let health = client.health(Duration::from_secs(2)).await.unwrap();
        assert!(health.ok);
        let version = client.invoke("v", "system.version", json!({})).await.unwrap();
        assert_eq!(version["protocolVersion"], "1.0.0");

        let err = client.invoke(1, "job.status", json!({"jobId": "nope"})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        shutdown.notify_one();
    }

    #[tokio::test]
    async fn test_unreachable_is_bridge_unavailable() {
        let client = BridgeClient::new(closed_port_url()).unwrap();
        let err = client.health(Duration::from_millis(500)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BridgeUnavailable);

        let response = RpcTransport::call(&client, RpcRequest::new("x", "system.health", json!({}))).await;
        assert!(!response.ok);
        assert_eq!(response.correlation_id, json!("x"));
        assert_eq!(response.error_code(), Some(ErrorCode::BridgeUnavailable));
    }

    #[tokio::test]
    async fn test_foreign_protocol_major_is_error() {
        let app = Router::new().route(
            "/rpc",
            post(|| async {
                Json(json!({
                    "ok": true,
                    "protocolVersion": "2.0.0",
                    "correlationId": 1,
                    "result": {}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = BridgeClient::new(url).unwrap();
        let err = client.invoke(1, "system.health", json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Error);
    }
}
