use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::blobstore::{HttpImageStore, ImageStore, MemoryImageStore};
use crate::db::{DbHandle, OrdersDb};

/// Configuration for the atelier server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub images_url: Option<String>,
    pub images_token: Option<String>,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: std::path::PathBuf::from("atelier.db"),
            images_url: None,
            images_token: None,
            dev_mode: false,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the atelier server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    // Ensure parent directory exists for DB
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = OrdersDb::new(&config.db_path).context("Failed to initialize orders database")?;

    // Dev mode keeps uploads in memory; production requires a real store.
    let images: Arc<dyn ImageStore> = match (&config.images_url, config.dev_mode) {
        (_, true) => Arc::new(MemoryImageStore::new()),
        (Some(url), false) => Arc::new(HttpImageStore::new(url, config.images_token.clone())),
        (None, false) => {
            anyhow::bail!("an image store URL is required outside dev mode (--images-url)")
        }
    };

    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        images,
    });

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Atelier running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}
