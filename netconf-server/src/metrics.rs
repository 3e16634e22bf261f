//! Prometheus metrics for netconfd.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// RPC duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Prometheus metrics for the NETCONF server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total sessions accepted.
    pub sessions_total: Counter,
    /// Currently open sessions.
    pub sessions_active: Gauge,
    /// Total RPCs by operation.
    pub rpcs_total: CounterVec,
    /// Total rpc-errors by error tag.
    pub rpc_errors_total: CounterVec,
    /// RPC duration histogram by operation.
    pub rpc_duration: HistogramVec,
    /// Notifications written to sessions.
    pub notifications_sent_total: Counter,
    /// Currently held datastore locks.
    pub locks_held: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sessions_total = Counter::with_opts(Opts::new(
            "netconfd_sessions_total",
            "Total number of sessions accepted",
        ))?;
        registry.register(Box::new(sessions_total.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "netconfd_sessions_active",
            "Number of currently open sessions",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let rpcs_total = CounterVec::new(
            Opts::new("netconfd_rpcs_total", "Total RPCs by operation"),
            &["operation"],
        )?;
        registry.register(Box::new(rpcs_total.clone()))?;

        let rpc_errors_total = CounterVec::new(
            Opts::new("netconfd_rpc_errors_total", "Total rpc-errors by error tag"),
            &["tag"],
        )?;
        registry.register(Box::new(rpc_errors_total.clone()))?;

        let rpc_duration = HistogramVec::new(
            HistogramOpts::new(
                "netconfd_rpc_duration_seconds",
                "RPC duration in seconds by operation",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(rpc_duration.clone()))?;

        let notifications_sent_total = Counter::with_opts(Opts::new(
            "netconfd_notifications_sent_total",
            "Total notifications written to sessions",
        ))?;
        registry.register(Box::new(notifications_sent_total.clone()))?;

        let locks_held = Gauge::with_opts(Opts::new(
            "netconfd_locks_held",
            "Number of currently held datastore locks",
        ))?;
        registry.register(Box::new(locks_held.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            sessions_active,
            rpcs_total,
            rpc_errors_total,
            rpc_duration,
            notifications_sent_total,
            locks_held,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut response = text_response(StatusCode::OK, metrics.encode());
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.sessions_total.inc();
        metrics.sessions_active.inc();
        metrics.rpcs_total.with_label_values(&["get-config"]).inc();
        metrics.rpc_errors_total.with_label_values(&["lock-denied"]).inc();
        metrics
            .rpc_duration
            .with_label_values(&["get-config"])
            .observe(0.001);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("netconfd_sessions_total 1"));
        assert!(encoded.contains("netconfd_sessions_active 1"));
        assert!(encoded.contains("netconfd_rpcs_total{operation=\"get-config\"} 1"));
        assert!(encoded.contains("netconfd_rpc_errors_total{tag=\"lock-denied\"} 1"));
        assert!(encoded.contains("netconfd_rpc_duration_seconds"));
    }

    #[test]
    fn test_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.locks_held.set(2.0);
        metrics.notifications_sent_total.inc_by(3.0);

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("netconfd_locks_held 2"));
        assert!(encoded.contains("netconfd_notifications_sent_total 3"));
    }
}
