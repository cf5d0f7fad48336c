// Webhook listener built on actix-web

use crate::api::{middleware, routes};
use crate::database_ops::igdb::changes::ChangeManager;
use crate::database_ops::store::AggregateStore;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Shared by every worker of the listener.
pub struct AppState {
    pub manager: Arc<ChangeManager>,
    pub aggregates: Arc<dyn AggregateStore>,
    pub started: Instant,
}

impl AppState {
    pub fn new(manager: Arc<ChangeManager>, aggregates: Arc<dyn AggregateStore>) -> Self {
        Self {
            manager,
            aggregates,
            started: Instant::now(),
        }
    }
}

pub struct WebhookServer {
    pub addr: SocketAddr,
}

impl WebhookServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Serves until the process is stopped.
    pub async fn run(self, state: AppState) -> Result<()> {
        tracing::info!(addr = %self.addr, "starting webhook listener");

        let state = web::Data::new(state);
        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            App::new()
                .app_data(state.clone())
                .wrap(logger)
                .wrap(compress)
                .configure(routes::configure_routes)
        })
        .bind(self.addr)
        .with_context(|| format!("Failed to bind to {}", self.addr))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
