use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::protocol::{CasRequest, CasResponse, ENDPOINT_CAS, ENDPOINT_READ, ReadResponse};
use super::store::{CoordinationStore, InMemoryStore};

pub async fn handle_read(
    Extension(store): Extension<Arc<InMemoryStore>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<ReadResponse>) {
    match store.read(&key).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(ReadResponse {
                value: Some(record.value),
                version: record.version,
            }),
        ),
        Ok(None) => (
            StatusCode::OK,
            Json(ReadResponse {
                value: None,
                version: 0,
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to read '{}': {}", key, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ReadResponse {
                    value: None,
                    version: 0,
                }),
            )
        }
    }
}

pub async fn handle_cas(
    Extension(store): Extension<Arc<InMemoryStore>>,
    Json(req): Json<CasRequest>,
) -> (StatusCode, Json<CasResponse>) {
    match store
        .compare_and_set(&req.key, req.expected_version, req.value)
        .await
    {
        Ok(applied) => {
            if !applied {
                tracing::debug!(
                    "CAS on '{}' rejected (expected version {})",
                    req.key,
                    req.expected_version
                );
            }
            (StatusCode::OK, Json(CasResponse { applied }))
        }
        Err(e) => {
            tracing::error!("CAS on '{}' failed: {}", req.key, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CasResponse { applied: false }),
            )
        }
    }
}

/// Routes serving `store` to the other sites.
pub fn store_router(store: Arc<InMemoryStore>) -> Router {
    Router::new()
        .route(&format!("{}/:key", ENDPOINT_READ), get(handle_read))
        .route(ENDPOINT_CAS, post(handle_cas))
        .layer(Extension(store))
}
