//! HTTP surface: the inbound webhook and a status endpoint.
//!
//! # Endpoints
//!
//! - `POST /` — review-system event deliveries (origin-checked, classified,
//!   merged changes persisted before acknowledgement)
//! - `GET /status` — liveness summary

use std::net::IpAddr;
use std::sync::Arc;

use crate::engine::Core;

pub mod status;
pub mod webhook;

pub use status::status_handler;
pub use webhook::webhook_handler;

/// Shared handler state, passed via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    core: Arc<Core>,

    /// Callers whose deliveries are accepted. Everything else gets a 403.
    allowed_callers: Vec<IpAddr>,
}

impl AppState {
    pub fn new(core: Arc<Core>, allowed_callers: Vec<IpAddr>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                core,
                allowed_callers,
            }),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    pub fn caller_allowed(&self, caller: IpAddr) -> bool {
        self.inner.allowed_callers.contains(&caller)
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/", post(webhook_handler))
        .route("/status", get(status_handler))
        .with_state(app_state)
}
