//! Prometheus metrics and health HTTP endpoint
//!
//! - `GET /metrics` renders the counters in Prometheus text format
//! - `GET /health` runs every carrier health check; 200 when all pass, 503 otherwise

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::io::carrier_client::{CarrierClients, CarrierErrorKind};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with service label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, service: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{service=\"{service}\"}} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    service: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{service=\"{service}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{service=\"{service}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{service=\"{service}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, service: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_reconcile_metrics(&mut output, service, &summary);
    write_publish_metrics(&mut output, service, &summary);
    write_carrier_metrics(&mut output, service, &summary);

    output
}

fn write_reconcile_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(output, "tracking_ticks_total", "Scheduler ticks", MetricType::Counter, service, summary.ticks_total);
    write_metric(
        output,
        "tracking_reconciled_total",
        "Successful reconciliations",
        MetricType::Counter,
        service,
        summary.reconciled_total,
    );
    write_metric(
        output,
        "tracking_reconcile_failed_total",
        "Reconciliations that ended in an error",
        MetricType::Counter,
        service,
        summary.reconcile_failed_total,
    );
    write_metric(
        output,
        "tracking_events_merged_total",
        "New carrier events merged into aggregates",
        MetricType::Counter,
        service,
        summary.events_merged_total,
    );
    write_metric(
        output,
        "tracking_events_pruned_total",
        "Events removed by retention",
        MetricType::Counter,
        service,
        summary.events_pruned_total,
    );
    write_metric(
        output,
        "tracking_codes_registered_total",
        "Tracking codes registered",
        MetricType::Counter,
        service,
        summary.codes_registered_total,
    );
    write_metric(
        output,
        "tracking_codes_reactivated_total",
        "Inactive tracking codes reactivated",
        MetricType::Counter,
        service,
        summary.codes_reactivated_total,
    );
    write_metric(
        output,
        "tracking_in_flight",
        "Reconciliations currently running",
        MetricType::Gauge,
        service,
        summary.in_flight,
    );
    write_metric(
        output,
        "tracking_in_flight_max",
        "Highest concurrent reconciliations observed",
        MetricType::Gauge,
        service,
        summary.in_flight_max,
    );
}

fn write_publish_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "tracking_events_published_total",
        "Domain events handed to the publisher",
        MetricType::Counter,
        service,
        summary.events_published_total,
    );
    write_metric(
        output,
        "tracking_publish_failures_total",
        "Domain events the publisher rejected",
        MetricType::Counter,
        service,
        summary.publish_failures_total,
    );
}

fn write_carrier_metrics(output: &mut String, service: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "tracking_carrier_calls_total",
        "Carrier calls that reached the transport",
        MetricType::Counter,
        service,
        summary.carrier_calls_total,
    );

    let _ = writeln!(output, "# HELP tracking_carrier_errors_total Carrier call failures by kind");
    let _ = writeln!(output, "# TYPE tracking_carrier_errors_total counter");
    for kind in CarrierErrorKind::ALL {
        let _ = writeln!(
            output,
            "tracking_carrier_errors_total{{service=\"{service}\",kind=\"{}\"}} {}",
            kind.as_str(),
            summary.carrier_errors[kind.index()]
        );
    }

    write_histogram(
        output,
        "tracking_carrier_latency_ms",
        "Carrier call latency in milliseconds",
        service,
        &summary.latency_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.latency_sum_ms,
    );
    write_metric(
        output,
        "tracking_carrier_latency_p99_ms",
        "99th percentile carrier latency",
        MetricType::Gauge,
        service,
        summary.latency_p99_ms,
    );
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// JSON body and status for `/health`
async fn health_report(clients: &CarrierClients) -> (StatusCode, String) {
    let results = clients.health().await;
    let healthy = results.iter().all(|(_, ok)| *ok);
    let carriers: serde_json::Map<String, serde_json::Value> =
        results.iter().map(|(carrier, ok)| (carrier.as_str().to_string(), json!(ok))).collect();

    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("GIT_HASH"),
        "carriers": carriers,
    });
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, body.to_string())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    clients: CarrierClients,
    service: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &service);
            Ok(respond(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body))
        }
        (&Method::GET, "/health") => {
            let (status, body) = health_report(&clients).await;
            Ok(respond(status, "application/json", body))
        }
        _ => Ok(respond(StatusCode::NOT_FOUND, "text/plain", "Not Found")),
    }
}

/// Serve `/metrics` and `/health` until shutdown
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    clients: CarrierClients,
    service_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let service_id = Arc::new(service_id);

    info!(port = %port, service = %service_id, "metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let clients = clients.clone();
                        let service_id = service_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let clients = clients.clone();
                                let service_id = service_id.clone();
                                async move { handle_request(req, metrics, clients, service_id).await }
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "metrics_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "metrics_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
