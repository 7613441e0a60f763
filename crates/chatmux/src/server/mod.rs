//! HTTP front end
//!
//! Three routes:
//! - `GET /chat` runs a buffered turn and answers with JSON
//! - `POST /chat-stream` runs a streamed turn as server-sent events
//! - `GET /ping` for liveness checks

mod framer;
mod handlers;
mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{ChatmuxError, Result};
use crate::session::Orchestrator;

pub use framer::{FrameEvent, StreamFramer};
pub use handlers::{ANONYMOUS_USER, ChatQuery, ChatStreamRequest, error_response};
pub use sse::{DONE_SENTINEL, KEEPALIVE_SENTINEL, START_SENTINEL, ServerSentEvent};

/// Shared application state for all handlers
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub framer: StreamFramer,
}

pub struct ChatServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl ChatServer {
    pub fn new(config: ServerConfig, orchestrator: Arc<Orchestrator>, framer: StreamFramer) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                orchestrator,
                framer,
            }),
        }
    }

    /// Bind and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let app = create_router(Arc::clone(&self.state));

        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .map_err(|e| ChatmuxError::Config(format!("Invalid listen address: {e}")))?;

        tracing::info!("Starting chat server on {addr}");
        if self.config.debug {
            tracing::info!("Debug mode: upstream traffic is logged");
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChatmuxError::Server(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ChatmuxError::Server(format!("Server error: {e}")))?;

        tracing::info!("Chat server shut down gracefully");
        Ok(())
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/chat", get(handlers::chat))
        .route("/chat-stream", post(handlers::chat_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
