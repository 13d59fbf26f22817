use axum::{Json, Router, extract::Extension, http::StatusCode, routing::get};
use tokio::sync::watch;

use super::service::{AgreementHandle, NodeStatus};
use crate::topology::types::TopologyEpoch;

// --- API Endpoints ---

/// Engine state, view and last error of this site.
pub const ENDPOINT_STATUS: &str = "/agreement/status";
/// Newest topology epoch this site installed.
pub const ENDPOINT_TOPOLOGY: &str = "/topology";

pub async fn handle_status(Extension(handle): Extension<AgreementHandle>) -> Json<NodeStatus> {
    Json(handle.status())
}

pub async fn handle_topology(
    Extension(topology): Extension<watch::Receiver<Option<TopologyEpoch>>>,
) -> (StatusCode, Json<Option<TopologyEpoch>>) {
    let current = topology.borrow().clone();
    match current {
        Some(epoch) => (StatusCode::OK, Json(Some(epoch))),
        None => (StatusCode::SERVICE_UNAVAILABLE, Json(None)),
    }
}

pub fn status_router(
    handle: AgreementHandle,
    topology: watch::Receiver<Option<TopologyEpoch>>,
) -> Router {
    Router::new()
        .route(ENDPOINT_STATUS, get(handle_status))
        .route(ENDPOINT_TOPOLOGY, get(handle_topology))
        .layer(Extension(handle))
        .layer(Extension(topology))
}
