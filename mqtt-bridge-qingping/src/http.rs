//! HTTP endpoint serving the device gauges to Prometheus.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::collector::SharedCollector;
use crate::tracker::SharedTracker;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Device state the endpoints read from.
#[derive(Clone)]
pub struct DeviceView {
    pub collector: SharedCollector,
    pub tracker: SharedTracker,
}

/// Build the router: metrics at `metrics_path`, plus `/health` and `/ready`.
pub fn build_router(view: DeviceView, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(view)
}

async fn metrics_handler(State(view): State<DeviceView>) -> Response {
    let body = view.collector.render();
    debug!(bytes = body.len(), "Serving metrics scrape");

    (StatusCode::OK, [("content-type", CONTENT_TYPE)], body).into_response()
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Ready once the device has published at least one message.
///
/// The body lists the devices currently reporting, which is empty again
/// after a device goes stale.
async fn ready_handler(State(view): State<DeviceView>) -> Response {
    if view.collector.stats().messages_received == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no device message received yet\n",
        )
            .into_response();
    }

    let devices = view.tracker.devices();
    let body = if devices.is_empty() {
        "ready - no device reporting\n".to_string()
    } else {
        format!("ready - reporting: {}\n", devices.join(", "))
    };
    (StatusCode::OK, body).into_response()
}

/// Metrics HTTP server.
pub struct HttpServer {
    view: DeviceView,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    pub fn new(view: DeviceView, listen_addr: SocketAddr, metrics_path: String) -> Self {
        Self {
            view,
            listen_addr,
            metrics_path,
        }
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = build_router(self.view, &self.metrics_path);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %self.listen_addr,
            path = %self.metrics_path,
            "Metrics endpoint listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MetricCollector;
    use crate::mapping::SensorMetric;
    use crate::tracker::UpdateTracker;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::Utc;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn make_view() -> DeviceView {
        DeviceView {
            collector: Arc::new(MetricCollector::new("qingping")),
            tracker: Arc::new(UpdateTracker::new()),
        }
    }

    async fn get_body(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let view = make_view();
        view.collector.set(SensorMetric::Co2, "living_room", 650.0);
        let router = build_router(view, "/metrics");

        let response = router
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));

        let (_, body) = get_body(router, "/metrics").await;
        assert!(body.contains("qingping_co2_ppm{device=\"living_room\"} 650\n"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get_body(build_router(make_view(), "/metrics"), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "healthy\n");
    }

    #[tokio::test]
    async fn test_ready_before_first_message() {
        let (status, _) = get_body(build_router(make_view(), "/metrics"), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ready_lists_reporting_devices() {
        let view = make_view();
        view.collector.record_received();
        view.tracker.record("living_room", Utc::now());

        let (status, body) = get_body(build_router(view, "/metrics"), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready - reporting: living_room\n");
    }

    #[tokio::test]
    async fn test_ready_after_device_went_stale() {
        let view = make_view();
        view.collector.record_received();

        let (status, body) = get_body(build_router(view, "/metrics"), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready - no device reporting\n");
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let router = build_router(make_view(), "/prometheus/metrics");

        let (status, _) = get_body(router.clone(), "/prometheus/metrics").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get_body(router, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
