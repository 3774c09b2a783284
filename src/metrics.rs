use axum::{http::StatusCode, response::Response, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

// Global metrics
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();

    registry.register(Box::new(EVENTS_TOTAL.clone())).unwrap();
    registry.register(Box::new(BLOCKS_TOTAL.clone())).unwrap();
    registry.register(Box::new(RATE_LIMITS_TOTAL.clone())).unwrap();
    registry.register(Box::new(ACTIVE_BLOCKS.clone())).unwrap();

    registry
});

pub static EVENTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "threatwatch_events_total",
        "Total number of security events processed",
    )
    .expect("metric can be created")
});

pub static BLOCKS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "threatwatch_blocks_total",
        "Total number of source blocks issued",
    )
    .expect("metric can be created")
});

pub static RATE_LIMITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "threatwatch_rate_limits_total",
        "Total number of sources rate-limited",
    )
    .expect("metric can be created")
});

pub static ACTIVE_BLOCKS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "threatwatch_active_blocks",
        "Number of currently blocked sources",
    )
    .expect("metric can be created")
});

pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> Result<Response<String>, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(output) => {
            let response = Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4")
                .body(output)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Ok(response)
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
