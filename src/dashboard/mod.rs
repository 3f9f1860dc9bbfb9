//! Dashboard Module
//!
//! Read-only HTTP view of per-symbol trading state and the audit trail.
//! Only compiled when the `dashboard` feature is enabled.

mod api;

pub use api::create_router;

use serde::Serialize;
use std::sync::Arc;

use crate::engine::StateBoard;
use crate::persistence::TradeStore;

/// Uniform JSON envelope for every endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Shared handles the handlers read from
#[derive(Clone)]
pub struct DashboardState {
    pub board: StateBoard,
    pub store: Arc<dyn TradeStore>,
}

/// Start the dashboard server
pub async fn start_server(
    board: StateBoard,
    store: Arc<dyn TradeStore>,
    port: u16,
) -> anyhow::Result<()> {
    let app = create_router(DashboardState { board, store });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("🖥️ Dashboard API starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
