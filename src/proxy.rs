//! Request routing to registered clusters and the allow-listed external proxy

use crate::credentials::CredentialMaterial;
use crate::error::{
    empty_body, full_body, json_error_response, BoxError, ConfigError, ErrorCode, GatewayBody,
};
use crate::factory::{build_tls_config, relay};
use crate::plugins::PluginSignal;
use crate::registry::{ProxyRegistry, RegistryEntry};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, AUTHORIZATION, HOST};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

/// Response header telling the browser to reload its plugins
pub const X_RELOAD: &str = "x-reload";
/// Request header naming the external proxy destination
pub const PROXY_TO: &str = "proxy-to";

const MAX_UPGRADE_HEAD: usize = 16 * 1024;
const MAX_REJECTION_BODY: usize = 1024 * 1024;

/// Routes `/clusters/<name>/<rest>` to the matching cluster handler
pub struct ClusterRouter {
    registry: Arc<ProxyRegistry>,
    plugins: Arc<PluginSignal>,
}

impl ClusterRouter {
    pub fn new(registry: Arc<ProxyRegistry>, plugins: Arc<PluginSignal>) -> Self {
        Self { registry, plugins }
    }

    pub async fn route<B>(
        &self,
        mut req: Request<B>,
        cluster: &str,
        rest: &str,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let Some(entry) = self.registry.lookup(cluster) else {
            debug!(cluster, "Request for unknown cluster");
            return json_error_response(
                ErrorCode::UnknownCluster,
                format!("cluster {} not found", cluster),
            );
        };

        inject_bearer_token(&mut req, &entry);

        let reload = self.plugins.take();

        let mut response = if is_upgrade_request(&req) {
            upgrade(entry, req, rest).await
        } else {
            match entry.handler().forward(req, rest).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(cluster, error = %e, "Upstream request failed");
                    json_error_response(
                        ErrorCode::UpstreamFailed,
                        format!("cluster {}: {}", cluster, e),
                    )
                }
            }
        };

        if reload {
            debug!(cluster, "Asking client to reload plugins");
            let headers = response.headers_mut();
            headers.insert(X_RELOAD, HeaderValue::from_static("reload"));
            headers.insert(
                "access-control-expose-headers",
                HeaderValue::from_static("X-Reload"),
            );
        }

        response
    }
}

/// Add the cluster's static token unless the caller sent credentials
fn inject_bearer_token<B>(req: &mut Request<B>, entry: &RegistryEntry) {
    if req.headers().contains_key(AUTHORIZATION) {
        return;
    }
    let Some(token) = entry.target().credentials().bearer_token() else {
        return;
    };
    match HeaderValue::from_str(&format!("Bearer {}", token)) {
        Ok(mut value) => {
            value.set_sensitive(true);
            req.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(_) => warn!(
            cluster = entry.target().name(),
            "Static token is not a valid header value, not injecting"
        ),
    }
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Open a raw connection to the cluster, wrapped in TLS for https targets
async fn connect_upstream(
    url: &Url,
    tls: Arc<ClientConfig>,
) -> std::io::Result<Box<dyn UpstreamIo>> {
    let host = url
        .host_str()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "target has no host")
        })?;
    let port = url.port_or_known_default().unwrap_or(443);
    let tcp = TcpStream::connect(format!("{}:{}", host, port)).await?;
    tcp.set_nodelay(true)?;

    if url.scheme() != "https" {
        return Ok(Box::new(tcp));
    }

    let name = ServerName::try_from(host.trim_matches(['[', ']']).to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let stream = TlsConnector::from(tls).connect(name, tcp).await?;
    Ok(Box::new(stream))
}

/// Build the raw HTTP/1.1 upgrade request sent to the cluster
fn build_upgrade_request<B>(req: &Request<B>, url: &Url) -> Vec<u8> {
    let target = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let authority = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    };

    let mut raw = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        req.method(),
        target,
        authority
    )
    .into_bytes();
    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        raw.extend_from_slice(name.as_str().as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw
}

/// Status line and headers of the cluster's answer, plus any bytes read past them
struct UpgradeHead {
    status: StatusCode,
    headers: Vec<(String, String)>,
    rest: Vec<u8>,
}

async fn read_upgrade_head<S>(stream: &mut S) -> Result<UpgradeHead, String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err("upgrade response head too large".to_string());
        }
        let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("connection closed before upgrade response".to_string());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..end]).map_err(|e| e.to_string())?;
    let mut lines = head.split("\r\n");

    // HTTP/1.1 101 Switching Protocols
    let status = lines
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| "malformed upgrade status line".to_string())?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(UpgradeHead {
        status,
        headers,
        rest: buf[end + 4..].to_vec(),
    })
}

impl UpgradeHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Read the full body of a non-101 answer, starting from the bytes already buffered
async fn read_rejection_body<S>(stream: &mut S, head: &UpgradeHead) -> Result<Vec<u8>, String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut raw = head.rest.clone();

    if let Some(length) = head.header("content-length") {
        let length: usize = length
            .parse()
            .map_err(|_| format!("invalid content-length {}", length))?;
        if length > MAX_REJECTION_BODY {
            return Err("upgrade rejection body too large".to_string());
        }
        if raw.len() < length {
            let start = raw.len();
            raw.resize(length, 0);
            stream
                .read_exact(&mut raw[start..])
                .await
                .map_err(|e| e.to_string())?;
        }
        raw.truncate(length);
        return Ok(raw);
    }

    let chunked = head
        .header("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return read_chunked(stream, raw).await;
    }

    let mut limited = stream.take((MAX_REJECTION_BODY - raw.len().min(MAX_REJECTION_BODY)) as u64);
    limited.read_to_end(&mut raw).await.map_err(|e| e.to_string())?;
    Ok(raw)
}

/// Decode a chunked body; `buf` holds the bytes read so far
async fn read_chunked<S>(stream: &mut S, mut buf: Vec<u8>) -> Result<Vec<u8>, String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut body = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        // size line
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            fill(stream, &mut buf, &mut chunk).await?;
        };
        let line = std::str::from_utf8(&buf[..line_end]).map_err(|e| e.to_string())?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| format!("invalid chunk size {}", size_text))?;
        buf.drain(..line_end + 2);

        if size == 0 {
            return Ok(body);
        }
        if body.len() + size > MAX_REJECTION_BODY {
            return Err("upgrade rejection body too large".to_string());
        }
        while buf.len() < size + 2 {
            fill(stream, &mut buf, &mut chunk).await?;
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
}

async fn fill<S>(stream: &mut S, buf: &mut Vec<u8>, chunk: &mut [u8]) -> Result<(), String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let n = stream.read(chunk).await.map_err(|e| e.to_string())?;
    if n == 0 {
        return Err("connection closed inside chunked body".to_string());
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

/// Relay an upgrade request to the cluster and splice the two connections
async fn upgrade<B>(entry: Arc<RegistryEntry>, req: Request<B>, rest: &str) -> Response<GatewayBody>
where
    B: Body + Send + 'static,
{
    let cluster = entry.target().name().to_string();
    let handler = entry.handler();
    let url = handler.upstream_url(rest, req.uri().query());
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_lowercase();

    debug!(cluster = %cluster, upgrade_type = %upgrade_type, url = %url, "Handling upgrade request");

    let failed = |reason: String| {
        warn!(cluster = %cluster, error = %reason, "Upgrade request failed");
        json_error_response(ErrorCode::UpstreamFailed, format!("cluster {}: {}", cluster, reason))
    };

    let mut upstream = match connect_upstream(&url, handler.tls_config()).await {
        Ok(stream) => stream,
        Err(e) => return failed(e.to_string()),
    };
    if let Err(e) = upstream.write_all(&build_upgrade_request(&req, &url)).await {
        return failed(e.to_string());
    }
    let head = match read_upgrade_head(&mut upstream).await {
        Ok(head) => head,
        Err(e) => return failed(e),
    };

    let mut builder = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(cluster = %cluster, status = %head.status, "Cluster rejected upgrade request");
        let body = match read_rejection_body(&mut upstream, &head).await {
            Ok(body) => body,
            Err(e) => return failed(e),
        };
        return builder
            .body(full_body(body))
            .unwrap_or_else(|e| failed(e.to_string()));
    }

    let response = match builder.body(empty_body()) {
        Ok(response) => response,
        Err(e) => return failed(e.to_string()),
    };

    info!(cluster = %cluster, upgrade_type = %upgrade_type, "Upgrade accepted by cluster");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !head.rest.is_empty() {
                    if let Err(e) = client.write_all(&head.rest).await {
                        debug!(cluster = %cluster, error = %e, "Client went away during upgrade");
                        return;
                    }
                }
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((to_cluster, to_client)) => {
                        debug!(
                            cluster = %cluster,
                            to_cluster,
                            to_client,
                            "Upgraded connection closed"
                        )
                    }
                    Err(e) => debug!(
                        cluster = %cluster,
                        error = %e,
                        "Upgraded connection closed with error"
                    ),
                }
            }
            Err(e) => warn!(cluster = %cluster, error = %e, "Failed to upgrade client connection"),
        }
    });

    response
}

/// Glob patterns external proxy destinations must match
#[derive(Debug, Clone)]
pub struct ProxyAllowList {
    patterns: Vec<String>,
    set: GlobSet,
}

impl ProxyAllowList {
    /// Compile the patterns; `*` also matches across `/`
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(GlobBuilder::new(pattern).literal_separator(false).build()?);
        }
        Ok(Self {
            patterns: patterns.to_vec(),
            set: builder.build()?,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, url: &str) -> bool {
        !url.is_empty() && self.set.is_match(url)
    }
}

/// Relays requests to arbitrary URLs that pass the allow-list
pub struct ExternalProxy {
    allow: ProxyAllowList,
    client: reqwest::Client,
}

impl ExternalProxy {
    pub fn new(
        allow: ProxyAllowList,
        insecure: bool,
        connect_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let name = "externalproxy";
        let credentials = CredentialMaterial::new().with_insecure_skip_verify(insecure);
        let tls = build_tls_config(name, &credentials)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls((*tls).clone())
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConfigError::Tls {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        debug!(patterns = ?allow.patterns(), "External proxy allow-list compiled");
        Ok(Self { allow, client })
    }

    pub async fn handle<B>(&self, mut req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let destination = req
            .headers_mut()
            .remove(PROXY_TO)
            .and_then(|v| v.to_str().ok().map(str::to_string))
            .unwrap_or_default();

        if !self.allow.matches(&destination) {
            warn!(destination = %destination, "External proxy destination not allowed");
            return json_error_response(
                ErrorCode::ProxyDenied,
                "no allowed proxy url match, request denied",
            );
        }

        let url = match Url::parse(&destination) {
            Ok(url) => url,
            Err(e) => {
                return json_error_response(
                    ErrorCode::InvalidRequest,
                    format!("invalid proxy-to url: {}", e),
                )
            }
        };

        debug!(destination = %destination, "Relaying external proxy request");
        match relay(&self.client, req, url).await {
            Ok(response) => response,
            Err(e) => {
                warn!(destination = %destination, error = %e, "External proxy request failed");
                json_error_response(ErrorCode::UpstreamFailed, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ProxyFactory;
    use crate::target::{Provenance, ProxyTarget};
    use http_body_util::{BodyExt, Empty};

    fn registry_with(token: Option<&str>) -> Arc<ProxyRegistry> {
        registry_for("http://127.0.0.1:1", token)
    }

    fn registry_for(server: &str, token: Option<&str>) -> Arc<ProxyRegistry> {
        let registry = ProxyRegistry::new(ProxyFactory::default());
        let creds = CredentialMaterial::new().with_bearer_token(token.map(str::to_string));
        let target = ProxyTarget::new("c1", server, creds, Provenance::RuntimeAdded).unwrap();
        registry.add(target).unwrap();
        registry
    }

    fn head_with(headers: &[(&str, &str)], rest: &[u8]) -> UpgradeHead {
        UpgradeHead {
            status: StatusCode::FORBIDDEN,
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            rest: rest.to_vec(),
        }
    }

    #[test]
    fn test_allow_list_glob_matching() {
        let allow = ProxyAllowList::new(&[
            "https://artifacthub.io/*".to_string(),
            "https://*.example.com/charts/*".to_string(),
        ])
        .unwrap();

        assert!(allow.matches("https://artifacthub.io/api/v1/packages/search"));
        assert!(allow.matches("https://charts.example.com/charts/index.yaml"));
        assert!(!allow.matches("https://evil.io/artifacthub.io/"));
        assert!(!allow.matches("http://artifacthub.io/api"));
        assert!(!allow.matches(""));
    }

    #[test]
    fn test_empty_allow_list_denies_everything() {
        let allow = ProxyAllowList::new(&[]).unwrap();
        assert!(!allow.matches("https://artifacthub.io/"));
    }

    #[test]
    fn test_invalid_glob_rejected() {
        assert!(ProxyAllowList::new(&["https://[".to_string()]).is_err());
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().header("Upgrade", "websocket").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_token_injected_only_without_authorization() {
        let registry = registry_with(Some("static-token"));
        let entry = registry.lookup("c1").unwrap();

        let mut req = Request::builder().body(()).unwrap();
        inject_bearer_token(&mut req, &entry);
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer static-token");

        let mut req = Request::builder()
            .header(AUTHORIZATION, "Bearer caller")
            .body(())
            .unwrap();
        inject_bearer_token(&mut req, &entry);
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer caller");
    }

    #[test]
    fn test_upgrade_request_targets_cluster() {
        let url = Url::parse("https://10.0.0.1:6443/api/v1/pods?watch=1").unwrap();
        let req = Request::builder()
            .method("GET")
            .header(HOST, "localhost:4466")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();

        let raw = String::from_utf8(build_upgrade_request(&req, &url)).unwrap();
        assert!(raw.starts_with("GET /api/v1/pods?watch=1 HTTP/1.1\r\nHost: 10.0.0.1:6443\r\n"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(!raw.contains("localhost:4466"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_read_upgrade_head_keeps_trailing_bytes() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi".to_vec();
        let head = read_upgrade_head(&mut &data[..]).await.unwrap();
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(head.headers, vec![("Upgrade".to_string(), "websocket".to_string())]);
        assert_eq!(head.rest, b"\x81\x02hi");

        let truncated = b"HTTP/1.1 101 Switching".to_vec();
        assert!(read_upgrade_head(&mut &truncated[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_404() {
        let router = ClusterRouter::new(registry_with(None), PluginSignal::new());
        let req = Request::builder().body(Empty::<Bytes>::new()).unwrap();

        let response = router.route(req, "missing", "api").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["X-Gateway-Error"], "UNKNOWN_CLUSTER");
    }

    #[tokio::test]
    async fn test_transport_failure_is_502_and_still_signals_reload() {
        let signal = PluginSignal::new();
        signal.mark();
        let router = ClusterRouter::new(registry_with(None), Arc::clone(&signal));
        let req = Request::builder().body(Empty::<Bytes>::new()).unwrap();

        let response = router.route(req, "c1", "version").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[X_RELOAD], "reload");
        assert!(!signal.is_set());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("UPSTREAM_FAILED"));
    }

    #[tokio::test]
    async fn test_external_proxy_denies_unlisted_url() {
        let allow = ProxyAllowList::new(&["https://artifacthub.io/*".to_string()]).unwrap();
        let proxy = ExternalProxy::new(allow, false, Duration::from_secs(1)).unwrap();

        let req = Request::builder()
            .header(PROXY_TO, "https://example.com/")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy.handle(req).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("no allowed proxy url match, request denied"));

        let req = Request::builder().body(Empty::<Bytes>::new()).unwrap();
        assert_eq!(proxy.handle(req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rejection_body_completed_from_stream() {
        let head = head_with(&[("Content-Length", "7")], br#"{"a""#);
        let mut remaining: &[u8] = b":1}";
        let body = read_rejection_body(&mut remaining, &head).await.unwrap();
        assert_eq!(body, br#"{"a":1}"#);

        let head = head_with(&[("Content-Length", "7")], b"");
        let mut short: &[u8] = b"{}";
        assert!(read_rejection_body(&mut short, &head).await.is_err());
    }

    #[tokio::test]
    async fn test_rejection_body_chunked_and_unframed() {
        let head = head_with(&[("Transfer-Encoding", "chunked")], b"4\r\nWiki\r\n");
        let mut remaining: &[u8] = b"5\r\npedia\r\n0\r\n\r\n";
        let body = read_rejection_body(&mut remaining, &head).await.unwrap();
        assert_eq!(body, b"Wikipedia");

        let head = head_with(&[], b"forbid");
        let mut remaining: &[u8] = b"den";
        let body = read_rejection_body(&mut remaining, &head).await.unwrap();
        assert_eq!(body, b"forbidden");
    }

    #[tokio::test]
    async fn test_rejected_upgrade_keeps_late_body_and_signals_reload() {
        let status = r#"{"kind":"Status","status":"Failure","reason":"Forbidden","code":403}"#;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 403 Forbidden\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                status.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream.write_all(status.as_bytes()).await.unwrap();
        });

        let signal = PluginSignal::new();
        signal.mark();
        let registry = registry_for(&format!("http://127.0.0.1:{}", port), None);
        let router = ClusterRouter::new(registry, Arc::clone(&signal));
        let req = Request::builder()
            .uri("/api/v1/namespaces/ns1/pods/pod1/exec?command=sh")
            .header("Connection", "Upgrade")
            .header("Upgrade", "SPDY/3.1")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = router.route(req, "c1", "api/v1/namespaces/ns1/pods/pod1/exec").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[X_RELOAD], "reload");
        assert!(!signal.is_set());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], status.as_bytes());
    }
}
