//! HTTP listener and top-level request dispatch

use crate::admin::AdminApi;
use crate::error::{empty_body, json_error_response, BoxError, ErrorCode, GatewayBody};
use crate::proxy::{ClusterRouter, ExternalProxy};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

const CLUSTERS_PREFIX: &str = "/clusters/";
const CORS_ALLOW_HEADERS: &str = "X-Requested-With, Content-Type, Authorization";
const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, HEAD, DELETE, PATCH, OPTIONS";

/// Everything a request can be dispatched to
pub struct Gateway {
    router: ClusterRouter,
    admin: AdminApi,
    external: ExternalProxy,
    base_url: String,
    dev_mode: bool,
}

impl Gateway {
    pub fn new(
        router: ClusterRouter,
        admin: AdminApi,
        external: ExternalProxy,
        base_url: &str,
        dev_mode: bool,
    ) -> Self {
        Self {
            router,
            admin,
            external,
            base_url: base_url.trim_end_matches('/').to_string(),
            dev_mode,
        }
    }

    /// Route one request
    pub async fn handle<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        debug!(method = %req.method(), uri = %req.uri(), "Incoming request");

        let mut response = self.dispatch(req).await;
        if self.dev_mode {
            response.headers_mut().insert(
                "access-control-allow-origin",
                HeaderValue::from_static("*"),
            );
        }
        response
    }

    async fn dispatch<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let Some(path) = strip_base_url(req.uri().path(), &self.base_url).map(str::to_string) else {
            return json_error_response(ErrorCode::UnknownRoute, "not found");
        };

        if self.dev_mode && req.method() == Method::OPTIONS {
            return preflight();
        }

        if let Some((cluster, rest)) = path
            .strip_prefix(CLUSTERS_PREFIX)
            .and_then(|tail| tail.split_once('/'))
            .filter(|(cluster, _)| !cluster.is_empty())
        {
            return self.router.route(req, cluster, rest).await;
        }

        if path == "/externalproxy" {
            return self.external.handle(req).await;
        }

        self.admin.handle(req, &path).await
    }
}

/// Remove the configured prefix; `None` when the path lies outside it
fn strip_base_url<'a>(path: &'a str, base_url: &str) -> Option<&'a str> {
    if base_url.is_empty() {
        return Some(path);
    }
    match path.strip_prefix(base_url)? {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

/// Answer a CORS preflight in development mode
fn preflight() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("access-control-allow-headers", CORS_ALLOW_HEADERS)
        .header("access-control-allow-methods", CORS_ALLOW_METHODS)
        .body(empty_body())
        .expect("valid response with StatusCode enum and static headers")
}

/// The gateway's HTTP server
pub struct GatewayServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            gateway,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(gateway.handle(req).await) }
    });

    // HTTP/1.1 connections keep upgrade support for websocket streams
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_base_url() {
        assert_eq!(strip_base_url("/config", ""), Some("/config"));
        assert_eq!(strip_base_url("/gw/config", "/gw"), Some("/config"));
        assert_eq!(strip_base_url("/gw", "/gw"), Some("/"));
        assert_eq!(strip_base_url("/gwx/config", "/gw"), None);
        assert_eq!(strip_base_url("/config", "/gw"), None);
    }

    #[test]
    fn test_preflight_headers() {
        let response = preflight();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-methods"],
            CORS_ALLOW_METHODS
        );
        assert!(response.headers()["access-control-allow-headers"]
            .to_str()
            .unwrap()
            .contains("Authorization"));
    }
}
