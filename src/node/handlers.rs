use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post, put},
};
use std::sync::Arc;

use super::ReplicationNode;
use super::protocol::{
    BootstrapQuery, BootstrapResponse, CacheStatus, ENDPOINT_BOOTSTRAP, ENDPOINT_CACHE,
    ENDPOINT_CACHE_ENTRY, ENDPOINT_STATUS, GetResponse, PutRequest, PutResponse, RemoveResponse,
    StatusResponse,
};
use crate::bootstrap::BootstrapOutcome;
use crate::cache::{Element, ReplicatedCache};

pub fn router(node: Arc<ReplicationNode>) -> Router {
    Router::new()
        .route(
            ENDPOINT_CACHE_ENTRY,
            put(handle_put).get(handle_get).delete(handle_remove),
        )
        .route(ENDPOINT_CACHE, axum::routing::delete(handle_clear))
        .route(ENDPOINT_BOOTSTRAP, post(handle_bootstrap))
        .route(ENDPOINT_STATUS, get(handle_status))
        .layer(Extension(node))
}

pub async fn handle_put(
    Extension(node): Extension<Arc<ReplicationNode>>,
    Path((name, key)): Path<(String, String)>,
    Json(req): Json<PutRequest>,
) -> (StatusCode, Json<PutResponse>) {
    let Some(cache) = node.cache(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(PutResponse { success: false }),
        );
    };

    let result = match req.time_to_live_ms {
        Some(ttl) => cache.put(
            Element::new(key, req.value.into_bytes()).with_time_to_live(Some(ttl)),
            false,
        ),
        None => cache.insert(key, req.value.into_bytes()),
    };

    match result {
        Ok(_) => (StatusCode::OK, Json(PutResponse { success: true })),
        Err(e) => {
            tracing::error!("Failed to put into {}: {}", name, e);
            (
                StatusCode::BAD_REQUEST,
                Json(PutResponse { success: false }),
            )
        }
    }
}

pub async fn handle_get(
    Extension(node): Extension<Arc<ReplicationNode>>,
    Path((name, key)): Path<(String, String)>,
) -> (StatusCode, Json<GetResponse>) {
    let Some(cache) = node.cache(&name) else {
        return (StatusCode::NOT_FOUND, Json(GetResponse { value: None }));
    };

    match cache.get(&key) {
        Some(element) => (
            StatusCode::OK,
            Json(GetResponse {
                value: Some(String::from_utf8_lossy(&element.value).into_owned()),
            }),
        ),
        None => (StatusCode::NOT_FOUND, Json(GetResponse { value: None })),
    }
}

pub async fn handle_remove(
    Extension(node): Extension<Arc<ReplicationNode>>,
    Path((name, key)): Path<(String, String)>,
) -> (StatusCode, Json<RemoveResponse>) {
    let Some(cache) = node.cache(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(RemoveResponse { removed: false }),
        );
    };

    match cache.remove(&key, false) {
        Ok(removed) => (StatusCode::OK, Json(RemoveResponse { removed })),
        Err(e) => {
            tracing::error!("Failed to remove {} from {}: {}", key, name, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RemoveResponse { removed: false }),
            )
        }
    }
}

pub async fn handle_clear(
    Extension(node): Extension<Arc<ReplicationNode>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<RemoveResponse>) {
    let Some(cache) = node.cache(&name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(RemoveResponse { removed: false }),
        );
    };

    let removed = !cache.is_empty();
    match cache.remove_all(false) {
        Ok(_) => (StatusCode::OK, Json(RemoveResponse { removed })),
        Err(e) => {
            tracing::error!("Failed to clear {}: {}", name, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RemoveResponse { removed: false }),
            )
        }
    }
}

pub async fn handle_bootstrap(
    Extension(node): Extension<Arc<ReplicationNode>>,
    Path(name): Path<String>,
    Query(query): Query<BootstrapQuery>,
) -> (StatusCode, Json<BootstrapResponse>) {
    match node.bootstrap(&name, query.asynchronous).await {
        Ok(outcome) => {
            let status = match outcome {
                BootstrapOutcome::Rejected => StatusCode::SERVICE_UNAVAILABLE,
                BootstrapOutcome::Submitted => StatusCode::ACCEPTED,
                _ => StatusCode::OK,
            };
            (status, Json(outcome_response(outcome)))
        }
        Err(e) => {
            tracing::warn!("Bootstrap request rejected: {}", e);
            (
                StatusCode::NOT_FOUND,
                Json(BootstrapResponse {
                    outcome: "unknown_cache".to_string(),
                    replicated: None,
                }),
            )
        }
    }
}

pub async fn handle_status(
    Extension(node): Extension<Arc<ReplicationNode>>,
) -> (StatusCode, Json<StatusResponse>) {
    let caches = node
        .cache_names()
        .into_iter()
        .map(|name| {
            let entries = node.cache(&name).map(|cache| cache.len()).unwrap_or(0);
            CacheStatus { name, entries }
        })
        .collect();

    let response = StatusResponse {
        node: node.local_address().to_string(),
        members: node
            .group()
            .current_members()
            .into_iter()
            .map(|member| member.to_string())
            .collect(),
        caches,
        pending_bootstraps: node.coordinator().registry().keys(),
        queued_events: node.transport().pending_events(),
    };
    (StatusCode::OK, Json(response))
}

fn outcome_response(outcome: BootstrapOutcome) -> BootstrapResponse {
    let (label, replicated) = match outcome {
        BootstrapOutcome::Complete { replicated } => ("complete", Some(replicated)),
        BootstrapOutcome::Incomplete { replicated } => ("incomplete", Some(replicated)),
        BootstrapOutcome::NoPeers => ("no_peers", None),
        BootstrapOutcome::Submitted => ("submitted", None),
        BootstrapOutcome::TimedOut => ("timed_out", None),
        BootstrapOutcome::Failed => ("failed", None),
        BootstrapOutcome::Rejected => ("rejected", None),
    };
    BootstrapResponse {
        outcome: label.to_string(),
        replicated,
    }
}
