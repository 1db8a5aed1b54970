mod routes;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{config::Config, Result};

/// Health and metrics endpoints for the operator.
pub struct Server {
    addr: String,
}

impl Server {
    pub fn new(config: &Config) -> Self {
        Self {
            addr: config.server.addr.clone(),
        }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Serving health and metrics on {}", self.addr);
        axum::serve(listener, self.build_router()).await?;
        Ok(())
    }
}
