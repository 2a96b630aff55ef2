use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::ToSocketAddrs;

use crate::registry::MetricRegistry;

async fn export_metrics(State(registry): State<Arc<MetricRegistry>>) -> Response {
    match registry.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            log::error!("Failed to export metrics: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to export metrics").into_response()
        }
    }
}

/// Serves the registry contents on `GET /metrics`.
pub struct APIServer {
    router: axum::Router,
}

impl APIServer {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        let router = axum::Router::new()
            .route("/metrics", get(export_metrics))
            .with_state(registry);
        Self { router }
    }

    /// Binds to `addr` and serves until the process exits.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listener cannot be bound or serving fails.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("Serving metrics on http://{}/metrics", listener.local_addr()?);
        axum::serve(listener, self.router.into_make_service()).await
    }
}
