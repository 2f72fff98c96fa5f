//! HTTP server for the Prometheus metrics endpoint.
//!
//! `/metrics` serves the registry in text exposition format. `/health`
//! answers 503 until the capture loop has pushed a first snapshot, then
//! reports whether acquisition is running as JSON.

use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors of the metrics server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind metrics listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("metrics server stopped: {0}")]
    Serve(String),
}

/// Where the metrics server listens.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self::with_port(9090)
    }
}

impl MetricsServerConfig {
    /// Listens on all interfaces at `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], port).into(),
        }
    }
}

/// Body of a `/health` answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureHealth {
    /// Whether the acquisition thread was running at the last snapshot.
    pub acquiring: bool,
    /// Frame groups handed to the consumer so far.
    pub groups_delivered: u64,
    /// Frame groups whose delivery panicked.
    pub consumer_failures: u64,
    /// When the capture loop pushed the snapshot.
    pub updated_at: DateTime<Utc>,
}

/// Registry plus the last capture state, shared with the capture loop.
#[derive(Debug)]
pub struct MetricsState {
    registry: MetricsRegistry,
    health: Option<CaptureHealth>,
}

impl MetricsState {
    /// Takes a snapshot from the capture loop.
    pub fn update(&mut self, snapshot: &MetricsSnapshot) {
        self.registry.update(snapshot);
        self.health = Some(CaptureHealth {
            acquiring: snapshot.acquiring,
            groups_delivered: snapshot.groups_delivered,
            consumer_failures: snapshot.consumer_failures,
            updated_at: Utc::now(),
        });
    }

    /// Capture state at the last snapshot, if any arrived.
    pub fn health(&self) -> Option<&CaptureHealth> {
        self.health.as_ref()
    }
}

/// Serves the capture metrics over HTTP.
pub struct MetricsServer {
    config: MetricsServerConfig,
    state: Arc<RwLock<MetricsState>>,
}

impl MetricsServer {
    /// Creates a server around `registry`; nothing listens until
    /// [`MetricsServer::run`].
    pub fn new(config: MetricsServerConfig, registry: MetricsRegistry) -> Self {
        let state = MetricsState { registry, health: None };
        Self {
            config,
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Handle the capture loop pushes snapshots through.
    pub fn state(&self) -> Arc<RwLock<MetricsState>> {
        Arc::clone(&self.state)
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.state))
    }

    /// Binds and serves until the runtime shuts down.
    pub async fn run(self) -> Result<(), ServerError> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "Metrics server listening");

        axum::serve(listener, app)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))
    }
}

async fn metrics_handler(State(state): State<Arc<RwLock<MetricsState>>>) -> Response {
    let encoded = state.read().await.registry.encode();
    match encoded {
        Ok(text) => ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<RwLock<MetricsState>>>) -> Response {
    match state.read().await.health() {
        Some(health) => Json(health.clone()).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no capture snapshot yet").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<RwLock<MetricsState>> {
        MetricsServer::new(MetricsServerConfig::with_port(8080), MetricsRegistry::new().unwrap()).state()
    }

    #[test]
    fn test_config_default() {
        let config = MetricsServerConfig::default();
        assert_eq!(config.bind_addr.port(), 9090);
    }

    #[test]
    fn test_health_follows_acquisition() {
        let state = state();
        let mut guard = state.blocking_write();
        assert!(guard.health().is_none());

        guard.update(&MetricsSnapshot {
            acquiring: true,
            groups_delivered: 12,
            consumer_failures: 1,
            ..Default::default()
        });
        let running = guard.health().cloned().unwrap();
        assert!(running.acquiring);
        assert_eq!(running.groups_delivered, 12);
        assert_eq!(running.consumer_failures, 1);

        guard.update(&MetricsSnapshot {
            groups_delivered: 12,
            ..Default::default()
        });
        let stopped = guard.health().unwrap();
        assert!(!stopped.acquiring);
        assert!(stopped.updated_at >= running.updated_at);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = state();
        let response = health_handler(State(Arc::clone(&state))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.write().await.update(&MetricsSnapshot {
            acquiring: true,
            ..Default::default()
        });
        let response = health_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
