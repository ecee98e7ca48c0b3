//! Prometheus metrics and the HTTP endpoint serving them.
//!
//! Codec failures are counted per [`highway_protocol::ErrorKind`], so schema
//! skew between peers shows up apart from ordinary serialization failures.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Latency buckets in seconds; codec work is expected well under 1ms.
const LATENCY_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Server-side metric handles, all registered in one private [`Registry`].
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub connections_total: Counter,
    pub connections_active: Gauge,
    /// Labelled by operation (`microservice/schema/operation`).
    pub requests_total: CounterVec,
    /// Labelled by response status code.
    pub responses_total: CounterVec,
    /// Labelled by codec error kind.
    pub codec_errors_total: CounterVec,
    /// Labelled by operation.
    pub request_duration: HistogramVec,
}

fn registered<M>(registry: &Registry, metric: M) -> Result<M, prometheus::Error>
where
    M: Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = registered(
            &registry,
            Counter::new("highway_connections_total", "Connections accepted")?,
        )?;
        let connections_active = registered(
            &registry,
            Gauge::new("highway_connections_active", "Connections currently open")?,
        )?;
        let requests_total = registered(
            &registry,
            CounterVec::new(
                Opts::new("highway_requests_total", "Requests received per operation"),
                &["operation"],
            )?,
        )?;
        let responses_total = registered(
            &registry,
            CounterVec::new(
                Opts::new("highway_responses_total", "Responses sent per status code"),
                &["status"],
            )?,
        )?;
        let codec_errors_total = registered(
            &registry,
            CounterVec::new(
                Opts::new("highway_codec_errors_total", "Codec errors per error kind"),
                &["kind"],
            )?,
        )?;
        let request_duration = registered(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "highway_request_duration_seconds",
                    "Time from request decode to response encode",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["operation"],
            )?,
        )?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            responses_total,
            codec_errors_total,
            request_duration,
        })
    }

    /// Renders every metric in the Prometheus text exposition format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut out) {
            tracing::warn!("failed to encode metrics: {}", e);
        }
        out
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Serves `/metrics` and `/health` on `addr` until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics endpoint on http://{}/metrics", listener.local_addr()?);

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::error!("metrics accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };
        tokio::spawn(serve_scrape(TokioIo::new(stream), metrics.clone()));
    }

    tracing::info!("metrics endpoint stopped");
    Ok(())
}

async fn serve_scrape(io: TokioIo<tokio::net::TcpStream>, metrics: Arc<Metrics>) {
    let service = service_fn(move |req| route(req, metrics.clone()));
    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        tracing::debug!("metrics connection error: {}", e);
    }
}

async fn route(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut response = plain(StatusCode::OK, metrics.encode());
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        "/health" => plain(StatusCode::OK, "OK"),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labelled_series_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.connections_total.inc();
        metrics.responses_total.with_label_values(&["590"]).inc();
        metrics
            .codec_errors_total
            .with_label_values(&["STATUS_SCHEMA_NOT_FOUND"])
            .inc_by(2.0);
        metrics
            .request_duration
            .with_label_values(&["pojo/codeFirst/sayHi"])
            .observe(0.0002);

        let text = String::from_utf8(metrics.encode()).unwrap();
        assert!(text.contains("highway_connections_total 1"));
        assert!(text.contains("highway_responses_total{status=\"590\"} 1"));
        assert!(text.contains("highway_codec_errors_total{kind=\"STATUS_SCHEMA_NOT_FOUND\"} 2"));
        assert!(text.contains(
            "highway_request_duration_seconds_count{operation=\"pojo/codeFirst/sayHi\"} 1"
        ));
    }

    #[test]
    fn test_instances_do_not_share_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.connections_active.inc();
        assert_eq!(b.connections_active.get(), 0.0);
    }

    #[tokio::test]
    async fn test_metrics_server_shutdown() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(run_metrics_server(
            "127.0.0.1:0".parse().unwrap(),
            metrics,
            rx,
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }
}
