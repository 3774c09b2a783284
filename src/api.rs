use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::security::event::{EventType, SecurityEvent, Severity};
use crate::security::response::ThreatResponseSystem;

#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    pub event_type: EventType,
    pub severity: Severity,
    pub source_ip: Option<String>,
    pub user_id: Option<String>,
    pub station_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UnblockParams {
    pub reason: Option<String>,
}

pub fn create_router(engine: Arc<ThreatResponseSystem>) -> Router {
    Router::new()
        .route("/v1/events", post(ingest_event))
        .route("/v1/blocks", get(list_blocks))
        .route("/v1/blocks/:ip", delete(unblock_ip))
        .route("/v1/threats/:ip", get(threat_standing))
        .route("/v1/stats", get(system_stats))
        .route("/v1/cleanup", post(run_cleanup))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn ingest_event(
    State(engine): State<Arc<ThreatResponseSystem>>,
    Json(payload): Json<IngestEvent>,
) -> Json<Value> {
    let mut event = SecurityEvent::new(payload.event_type, payload.severity);
    event.source_ip = payload.source_ip;
    event.user_id = payload.user_id;
    event.station_id = payload.station_id;
    if let Some(timestamp) = payload.timestamp {
        event.timestamp = timestamp;
    }

    let response = engine.process_security_event(event).await;
    Json(json!(response))
}

async fn list_blocks(State(engine): State<Arc<ThreatResponseSystem>>) -> Json<Value> {
    let blocks = engine.list_active_blocks(Utc::now()).await;
    Json(json!({ "blocks": blocks }))
}

async fn unblock_ip(
    State(engine): State<Arc<ThreatResponseSystem>>,
    Path(ip): Path<String>,
    Query(params): Query<UnblockParams>,
) -> Result<Json<Value>, StatusCode> {
    let reason = params.reason.unwrap_or_else(|| "manual".to_string());
    match engine.unblock_ip(&ip, &reason).await {
        Some(record) => Ok(Json(json!({ "unblocked": record }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn threat_standing(
    State(engine): State<Arc<ThreatResponseSystem>>,
    Path(ip): Path<String>,
) -> Json<Value> {
    let now = Utc::now();
    Json(json!({
        "ip": ip,
        "historical_threat_level": engine.historical_threat_level(&ip, now).await,
        "blocked": engine.is_ip_blocked_at(&ip, now).await,
        "rate_limited": engine.is_ip_rate_limited_at(&ip, now).await,
    }))
}

async fn system_stats(State(engine): State<Arc<ThreatResponseSystem>>) -> Json<Value> {
    Json(json!(engine.get_system_stats().await))
}

async fn run_cleanup(State(engine): State<Arc<ThreatResponseSystem>>) -> Json<Value> {
    Json(json!(engine.cleanup().await))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
