//! Prometheus metrics HTTP server.
//!
//! Serves metrics on a configurable HTTP endpoint. Per-target gauges are
//! refreshed from the target registry on every scrape.

use crate::backend::TargetRegistry;
use crate::metrics::MetricsCollector;
use crate::util::ShutdownListener;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    /// Path for metrics endpoint.
    path: String,
    /// Metrics collector.
    collector: MetricsCollector,
    /// Source of the per-target gauges.
    targets: Arc<TargetRegistry>,
    listener: TcpListener,
}

impl MetricsServer {
    /// Bind the metrics server.
    pub async fn bind(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
        targets: Arc<TargetRegistry>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            path,
            collector,
            targets,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the metrics server.
    pub async fn run(self, mut shutdown: ShutdownListener) {
        info!(address = ?self.listener.local_addr().ok(), path = %self.path, "metrics server started");

        let state = Arc::new(ScrapeState {
            collector: self.collector,
            targets: self.targets,
            path: self.path,
        });

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&state);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(req, &state).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

struct ScrapeState {
    collector: MetricsCollector,
    targets: Arc<TargetRegistry>,
    path: String,
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Handle an incoming metrics request.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: &ScrapeState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let method = req.method();

    debug!(path = %path, method = %method, "metrics request");

    // Only handle GET requests to the metrics path
    if method != Method::GET {
        return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n"));
    }

    if path == state.path {
        let snapshots: Vec<_> = state.targets.targets().iter().map(|t| t.snapshot()).collect();
        state.collector.refresh_targets(&snapshots);

        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, state.collector.registry()) {
            error!(error = %e, "failed to encode metrics");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics\n",
            ));
        }

        let mut response = text_response(StatusCode::OK, buffer);
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        );
        Ok(response)
    } else if path == "/health" || path == "/healthz" {
        Ok(text_response(StatusCode::OK, "OK\n"))
    } else if path == "/" {
        let body = format!(
            "tcplb metrics server\n\nEndpoints:\n  {} - Prometheus metrics\n  /health - Health check\n",
            state.path
        );
        Ok(text_response(StatusCode::OK, body))
    } else {
        Ok(text_response(StatusCode::NOT_FOUND, "Not found\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::AlgorithmChain;
    use crate::config::TargetSettings;
    use crate::util::ShutdownSignal;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, addr);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_scrape_reports_targets() {
        let registry = TargetRegistry::new(TargetSettings::default(), AlgorithmChain::default());
        registry.add_group(0).unwrap();
        registry.add_target(0, "127.0.0.1:9001".parse().unwrap()).unwrap();

        let server = MetricsServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "/metrics".to_string(),
            MetricsCollector::new(),
            Arc::new(registry),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        let shutdown = ShutdownSignal::new();
        tokio::spawn(server.run(shutdown.subscribe()));

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("tcplb_target_enabled{target=\"127.0.0.1:9001\"} 1"));

        let response = get(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let response = get(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        shutdown.shutdown();
    }
}
