use crate::proxy::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

/// One-shot view of the disk cache and route table.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size_bytes: u64,
    pub max_size_bytes: u64,
    pub entry_count: usize,
    pub fill_ratio: f64,
    pub codec: &'static str,
    pub routes: usize,
}

impl CacheStats {
    fn collect(state: &AppState) -> Self {
        let cache = state.engine.cache();
        let size_bytes = cache.size();
        let max_size_bytes = cache.max_size();
        CacheStats {
            size_bytes,
            max_size_bytes,
            entry_count: cache.entry_count(),
            fill_ratio: if max_size_bytes > 0 {
                size_bytes as f64 / max_size_bytes as f64
            } else {
                0.0
            },
            codec: cache.codec_name(),
            routes: state.policies.load().routes().len(),
        }
    }
}

/// GET /api/stats
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = tokio::task::spawn_blocking(move || CacheStats::collect(&state)).await;
    match stats {
        Ok(stats) => (StatusCode::OK, Json(serde_json::json!(stats))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

/// POST /api/purge: evict every stored response.
pub async fn purge_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking(move || {
        let cache = state.engine.cache();
        let before = cache.entry_count();
        cache.evict_all().map(|()| before)
    })
    .await;

    match result {
        Ok(Ok(purged)) => {
            tracing::info!(purged, "cache purged");
            (StatusCode::OK, Json(serde_json::json!({"purged": purged})))
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "cache purge failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
