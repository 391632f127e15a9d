use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::config::WebConfig;
use crate::db::DatabaseManager;
use crate::ledger::{Maintenance, QueryEngine, ReconciliationScanner, ScanRegistry};

pub mod handlers;
pub mod metrics;
pub mod middleware;

use self::middleware::auth::create_router;

#[derive(Clone)]
pub struct WebState {
    pub db: Arc<DatabaseManager>,
    pub queries: QueryEngine,
    pub scanner: Arc<ReconciliationScanner>,
    pub registry: Arc<ScanRegistry>,
    pub maintenance: Arc<Maintenance>,
    pub admin_token: Option<SecretString>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

/// `None` only if a request arrives before `WebServer::new` ran.
pub fn web_state() -> Option<&'static WebState> {
    WEB_STATE.get()
}

#[derive(Clone)]
pub struct WebServer {
    config: WebConfig,
}

impl WebServer {
    pub fn new(
        config: WebConfig,
        db: Arc<DatabaseManager>,
        scanner: Arc<ReconciliationScanner>,
        registry: Arc<ScanRegistry>,
        maintenance: Arc<Maintenance>,
    ) -> Self {
        if config.admin_token.is_none() {
            warn!("web.admin_token is not set; mutating operator routes will reject every request");
        }

        let state = WebState {
            queries: QueryEngine::new(db.clone()),
            db,
            scanner,
            registry,
            maintenance,
            admin_token: config.admin_token.clone(),
            started_at: Instant::now(),
        };
        if WEB_STATE.set(state).is_err() {
            warn!("web state was already initialized; keeping the existing one");
        }

        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        info!("starting operator api on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
