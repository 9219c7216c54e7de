//! HTTP query surface
//!
//! Read-only views over the tracker and event store, plus an administrative
//! reset. Never touches the sensor, so it keeps answering while the radar
//! is disconnected.
//!
//! Routes:
//! - GET  /status          current snapshot and link state
//! - GET  /events?limit=N  most recent events first (default 50)
//! - GET  /events/latest   latest event, 404 when none recorded
//! - POST /presence/reset  force the area to absent
//! - GET  /health          liveness
//! - GET  /metrics         Prometheus text format

use crate::domain::types::PresenceSnapshot;
use crate::infra::metrics::{Metrics, MetricsSummary, READ_BUCKET_BOUNDS_MS, READ_NUM_BUCKETS};
use crate::services::poller::PresenceService;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const DEFAULT_EVENT_LIMIT: usize = 50;
pub const MAX_EVENT_LIMIT: usize = 1000;

/// Shared state for request handlers
pub struct ApiState {
    service: Arc<PresenceService>,
    metrics: Arc<Metrics>,
}

impl ApiState {
    pub fn new(service: Arc<PresenceService>, metrics: Arc<Metrics>) -> Self {
        Self { service, metrics }
    }
}

#[derive(Serialize)]
struct StatusBody {
    #[serde(flatten)]
    snapshot: PresenceSnapshot,
    link: &'static str,
}

#[derive(Serialize)]
struct DetailBody<'a> {
    detail: &'a str,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response should not fail"),
        Err(e) => {
            error!(error = %e, "api_encode_failed");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode error")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn detail(status: StatusCode, detail: &str) -> Response<Full<Bytes>> {
    json_response(status, &DetailBody { detail })
}

/// Extract `limit` from a query string. `Err` carries the rejected value.
fn parse_limit(query: Option<&str>) -> Result<usize, String> {
    let raw = query
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "limit")
        .map(|(_, value)| value);

    match raw {
        None => Ok(DEFAULT_EVENT_LIMIT),
        Some(value) => value
            .parse::<usize>()
            .map(|limit| limit.min(MAX_EVENT_LIMIT))
            .map_err(|_| value.to_string()),
    }
}

/// Write a simple metric (counter or gauge)
fn write_metric(output: &mut String, name: &str, help: &str, typ: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {typ}");
    let _ = writeln!(output, "{name} {val}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary, snapshot: &PresenceSnapshot) -> String {
    let mut output = String::with_capacity(2048);

    write_metric(&mut output, "presence_present", "1 while the area is occupied", "gauge", snapshot.present as u64);
    write_metric(
        &mut output,
        "presence_persistence_degraded",
        "1 while the latest event could not be persisted",
        "gauge",
        snapshot.persistence_degraded as u64,
    );
    write_metric(&mut output, "presence_frames_total", "Lines read from the sensor", "counter", summary.frames_total);
    write_metric(
        &mut output,
        "presence_frames_rejected_total",
        "Lines that did not parse to a detection",
        "counter",
        summary.frames_rejected,
    );
    write_metric(
        &mut output,
        "presence_detections_total",
        "Lines that parsed to a detection",
        "counter",
        summary.detections_total,
    );
    write_metric(&mut output, "presence_events_total", "Presence events persisted", "counter", summary.events_appended);
    write_metric(
        &mut output,
        "presence_store_failures_total",
        "Presence events dropped after append retries",
        "counter",
        summary.store_failures,
    );
    write_metric(
        &mut output,
        "presence_connect_failures_total",
        "Failed sensor open attempts",
        "counter",
        summary.connect_failures,
    );
    write_metric(&mut output, "presence_connects_total", "Successful sensor opens", "counter", summary.connects_total);
    write_metric(
        &mut output,
        "presence_read_deadline_overruns_total",
        "Reads abandoned after the read deadline",
        "counter",
        summary.read_deadline_overruns,
    );
    write_metric(&mut output, "presence_loop_errors_total", "Poll cycles ending in error backoff", "counter", summary.loop_errors);
    write_metric(&mut output, "presence_poll_cycles_total", "Poll cycles completed", "counter", summary.poll_cycles);

    let name = "presence_read_latency_ms";
    let _ = writeln!(output, "# HELP {name} Sensor line read latency in milliseconds");
    let _ = writeln!(output, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (i, bound) in READ_BUCKET_BOUNDS_MS.iter().enumerate() {
        cumulative += summary.read_buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += summary.read_buckets[READ_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum {}", summary.read_latency_sum_ms);
    let _ = writeln!(output, "{name}_count {cumulative}");

    output
}

/// Route one request. Request bodies are never read.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let tracker = state.service.tracker();
    debug!(method = %req.method(), path = %req.uri().path(), "api_request");

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/status") => json_response(
            StatusCode::OK,
            &StatusBody { snapshot: tracker.snapshot(), link: state.service.link_state().as_str() },
        ),
        (&Method::GET, "/events") => match parse_limit(req.uri().query()) {
            Ok(limit) => match tracker.recent_events(limit) {
                Ok(events) => json_response(StatusCode::OK, &events),
                Err(e) => {
                    error!(error = %e, "api_events_query_failed");
                    detail(StatusCode::INTERNAL_SERVER_ERROR, "Event store unavailable")
                }
            },
            Err(value) => detail(StatusCode::BAD_REQUEST, &format!("Invalid limit: {value}")),
        },
        (&Method::GET, "/events/latest") => match tracker.latest_event() {
            Ok(Some(event)) => json_response(StatusCode::OK, &event),
            Ok(None) => detail(StatusCode::NOT_FOUND, "No events recorded"),
            Err(e) => {
                error!(error = %e, "api_latest_query_failed");
                detail(StatusCode::INTERNAL_SERVER_ERROR, "Event store unavailable")
            }
        },
        (&Method::POST, "/presence/reset") => match tracker.force_absent(Utc::now()) {
            Ok(event) => {
                info!(id = %event.id, "manual_presence_reset");
                json_response(StatusCode::OK, &tracker.snapshot())
            }
            Err(e) => {
                error!(error = %e, "manual_presence_reset_failed");
                json_response(StatusCode::SERVICE_UNAVAILABLE, &tracker.snapshot())
            }
        },
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.metrics.report(), &tracker.snapshot());
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

/// Serve the query API on an already bound listener until shutdown
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(addr = %listener.local_addr()?, "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind and serve the query API
pub async fn start_api_server(
    addr: SocketAddr,
    state: Arc<ApiState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::Config;
    use crate::io::event_store::MemoryEventStore;
    use crate::io::radar::{SensorConnector, SensorLink};
    use crate::services::poller::PollSettings;
    use crate::services::presence::PresenceTracker;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::io;

    struct NoSensor;

    #[async_trait]
    impl SensorConnector for NoSensor {
        async fn connect(&self) -> io::Result<Box<dyn SensorLink>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no sensor"))
        }

        fn describe(&self) -> String {
            "none".to_string()
        }
    }

    fn create_state() -> Arc<ApiState> {
        let config = Config::default().with_event_note(Some("desk"));
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(MemoryEventStore::new());
        let tracker = Arc::new(PresenceTracker::new(&config, store, metrics.clone()));
        let service = Arc::new(PresenceService::new(
            tracker,
            Arc::new(NoSensor),
            metrics.clone(),
            PollSettings::from_config(&config),
        ));
        Arc::new(ApiState::new(service, metrics))
    }

    async fn call(state: &Arc<ApiState>, method: Method, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().method(method).uri(uri).body(()).unwrap();
        let resp = handle_request(req, state.clone()).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None), Ok(DEFAULT_EVENT_LIMIT));
        assert_eq!(parse_limit(Some("limit=5")), Ok(5));
        assert_eq!(parse_limit(Some("foo=1&limit=7")), Ok(7));
        assert_eq!(parse_limit(Some("limit=999999")), Ok(MAX_EVENT_LIMIT));
        assert_eq!(parse_limit(Some("limit=-1")), Err("-1".to_string()));
    }

    #[tokio::test]
    async fn test_status_without_sensor() {
        let state = create_state();
        let (status, body) = call(&state, Method::GET, "/status").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["present"], false);
        assert!(json["last_seen"].is_null());
        assert!(json["last_distance_m"].is_null());
        assert_eq!(json["note"], "desk");
        assert_eq!(json["persistence_degraded"], false);
        assert_eq!(json["link"], "disconnected");
    }

    #[tokio::test]
    async fn test_latest_empty_is_404() {
        let state = create_state();
        let (status, body) = call(&state, Method::GET, "/events/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("No events recorded"));
    }

    #[tokio::test]
    async fn test_events_newest_first() {
        let state = create_state();
        let tracker = state.service.tracker();
        tracker.on_detection(1.0, Utc::now()).unwrap();
        tracker.on_detection(2.0, Utc::now()).unwrap();
        tracker.on_detection(3.0, Utc::now()).unwrap();

        let (status, body) = call(&state, Method::GET, "/events?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let events = json.as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["distance_m"], 3.0);
        assert_eq!(events[1]["distance_m"], 2.0);

        let (_, body) = call(&state, Method::GET, "/events/latest").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["distance_m"], 3.0);
        assert_eq!(json["present"], true);
    }

    #[tokio::test]
    async fn test_invalid_limit() {
        let state = create_state();
        let (status, _) = call(&state, Method::GET, "/events?limit=lots").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reset_forces_absent() {
        let state = create_state();
        state.service.tracker().on_detection(1.5, Utc::now()).unwrap();

        let (status, body) = call(&state, Method::POST, "/presence/reset").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["present"], false);
        assert_eq!(json["last_distance_m"], 1.5);

        let (_, body) = call(&state, Method::GET, "/events/latest").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["present"], false);
    }

    #[test]
    fn test_histogram_sum_and_counts() {
        let metrics = Metrics::new();
        metrics.record_read_latency(3);
        metrics.record_read_latency(40);
        metrics.record_frame(true);
        metrics.record_connect(true);

        let snapshot = PresenceSnapshot {
            present: true,
            last_seen: None,
            last_distance_m: Some(1.0),
            note: None,
            persistence_degraded: false,
        };
        let body = format_prometheus_metrics(&metrics.report(), &snapshot);
        assert!(body.contains("presence_read_latency_ms_bucket{le=\"5\"} 1"));
        assert!(body.contains("presence_read_latency_ms_bucket{le=\"50\"} 2"));
        assert!(body.contains("presence_read_latency_ms_sum 43"));
        assert!(body.contains("presence_read_latency_ms_count 2"));
        assert!(body.contains("presence_detections_total 1"));
        assert!(body.contains("presence_connects_total 1"));
        assert!(body.contains("presence_present 1"));
    }

    #[tokio::test]
    async fn test_metrics_and_unknown_route() {
        let state = create_state();
        let (status, body) = call(&state, Method::GET, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("presence_present 0"));
        assert!(body.contains("presence_read_latency_ms_bucket{le=\"+Inf\"} 0"));
        assert!(body.contains("presence_read_latency_ms_sum 0"));
        assert!(body.contains("presence_detections_total 0"));
        assert!(body.contains("presence_connects_total 0"));

        let (status, _) = call(&state, Method::GET, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, Method::DELETE, "/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
