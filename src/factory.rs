//! Builds per-cluster reverse-proxy handlers
//!
//! Every cluster gets its own HTTP client carrying that cluster's trust
//! store, client certificate and (optionally) forward proxy. Handlers are
//! immutable once built; replacing a cluster means building a new handler.

use crate::credentials::{ClientIdentity, CredentialMaterial};
use crate::error::{BoxError, ConfigError, GatewayBody};
use crate::target::ProxyTarget;
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{HeaderMap, Request, Response};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Headers that apply to a single hop and are never relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for forwarding a single request
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The inbound body could not be read
    #[error("failed to read request body: {0}")]
    RequestBody(String),
    /// The upstream request failed before a response arrived
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    /// The upstream response could not be converted
    #[error("invalid upstream response: {0}")]
    Response(String),
}

/// Settings shared by all handlers the factory builds
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// TCP connect timeout for upstream connections
    pub connect_timeout: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Builds [`ProxyHandler`]s from cluster definitions
#[derive(Debug, Clone, Default)]
pub struct ProxyFactory {
    config: FactoryConfig,
}

impl ProxyFactory {
    pub fn new(config: FactoryConfig) -> Self {
        Self { config }
    }

    /// Build a handler bound to the target's TLS configuration
    pub fn build(&self, target: &ProxyTarget) -> Result<ProxyHandler, ConfigError> {
        let name = target.name();
        let tls = build_tls_config(name, target.credentials())?;

        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls((*tls).clone())
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.config.connect_timeout)
            .tcp_nodelay(true);

        builder = match target.proxy_url() {
            Some(proxy_url) => {
                let invalid = |reason: String| ConfigError::InvalidProxyUrl {
                    name: name.to_string(),
                    url: proxy_url.to_string(),
                    reason,
                };
                Url::parse(proxy_url).map_err(|e| invalid(e.to_string()))?;
                let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| invalid(e.to_string()))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        let client = builder.build().map_err(|e| ConfigError::Tls {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        debug!(
            cluster = name,
            server = %target.server(),
            proxy = ?target.proxy_url(),
            insecure = target.credentials().insecure_skip_verify(),
            "Proxy handler built"
        );

        Ok(ProxyHandler {
            server: target.server().clone(),
            client,
            tls,
        })
    }
}

/// Reverse-proxy handler for one cluster
#[derive(Debug, Clone)]
pub struct ProxyHandler {
    server: Url,
    client: reqwest::Client,
    tls: Arc<ClientConfig>,
}

impl ProxyHandler {
    /// Base URL requests are rewritten to
    pub fn server(&self) -> &Url {
        &self.server
    }

    /// Host requests are sent to
    pub fn outbound_host(&self) -> Option<&str> {
        self.server.host_str()
    }

    /// The HTTP client carrying this cluster's TLS setup
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// The TLS configuration, for transports other than plain HTTP
    pub fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls)
    }

    /// Join the routing suffix onto the base URL, keeping the query string
    pub fn upstream_url(&self, rest: &str, query: Option<&str>) -> Url {
        let mut url = self.server.clone();
        let base = self.server.path().trim_end_matches('/');
        url.set_path(&format!("{}/{}", base, rest.trim_start_matches('/')));
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }

    /// Forward a request to `rest` under the cluster's base URL
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        rest: &str,
    ) -> Result<Response<GatewayBody>, ForwardError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let url = self.upstream_url(rest, req.uri().query());
        relay(&self.client, req, url).await
    }
}

/// Send a request to `url` and stream the response back
pub async fn relay<B>(
    client: &reqwest::Client,
    req: Request<B>,
    url: Url,
) -> Result<Response<GatewayBody>, ForwardError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| ForwardError::RequestBody(Into::<BoxError>::into(e).to_string()))?
        .to_bytes();

    let mut headers = outbound_headers(&parts.headers);
    if let Some(host) = parts.headers.get(HOST) {
        headers.insert(HeaderName::from_static(X_FORWARDED_HOST), host.clone());
    }

    debug!(method = %parts.method, url = %url, "Requesting");

    let upstream = client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let mut builder = Response::builder().status(upstream.status());
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name) {
                response_headers.append(name.clone(), value.clone());
            }
        }
    }

    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|e| Box::new(e) as BoxError);

    builder
        .body(StreamBody::new(stream).boxed_unsync())
        .map_err(|e| ForwardError::Response(e.to_string()))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy end-to-end headers; Host and Content-Length are set by the client
fn outbound_headers(inbound: &HeaderMap<HeaderValue>) -> HeaderMap<HeaderValue> {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name) || name == HOST || name == hyper::header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Assemble the rustls client configuration for a cluster
pub fn build_tls_config(
    cluster: &str,
    credentials: &CredentialMaterial,
) -> Result<Arc<ClientConfig>, ConfigError> {
    let tls_error = |reason: String| ConfigError::Tls {
        name: cluster.to_string(),
        reason,
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(e.to_string()))?;

    let builder = if credentials.insecure_skip_verify() {
        warn!(cluster, "TLS verification disabled for cluster");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
    } else {
        builder.with_root_certificates(root_store(cluster, credentials)?)
    };

    let mut identities = credentials
        .client_identities()
        .iter()
        .map(|identity| load_identity(cluster, identity))
        .collect::<Result<Vec<_>, _>>()?;

    if identities.len() > 1 {
        warn!(
            cluster,
            count = identities.len(),
            "Multiple client certificates configured, presenting the first"
        );
    }

    let config = if identities.is_empty() {
        builder.with_no_client_auth()
    } else {
        let (chain, key) = identities.swap_remove(0);
        builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| tls_error(e.to_string()))?
    };

    Ok(Arc::new(config))
}

fn root_store(
    cluster: &str,
    credentials: &CredentialMaterial,
) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();

    match credentials.certificate_authority() {
        Some(source) => {
            let pem = source.read(cluster)?;
            let certs = parse_certificates(cluster, "certificate authority", &pem)?;
            for cert in certs {
                roots.add(cert).map_err(|e| ConfigError::InvalidPem {
                    name: cluster.to_string(),
                    what: "certificate authority",
                    reason: e.to_string(),
                })?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                debug!(cluster, error = %error, "Skipping unreadable system certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(cluster, added, ignored, "Using system trust roots");
        }
    }

    Ok(roots)
}

fn parse_certificates(
    cluster: &str,
    what: &'static str,
    pem: &[u8],
) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPem {
        name: cluster.to_string(),
        what,
        reason,
    };

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;

    if certs.is_empty() {
        return Err(invalid("no PEM certificates found".to_string()));
    }

    Ok(certs)
}

fn load_identity(
    cluster: &str,
    identity: &ClientIdentity,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ConfigError> {
    let chain = parse_certificates(
        cluster,
        "client certificate",
        &identity.certificate.read(cluster)?,
    )?;

    let key_pem = identity.key.read(cluster)?;
    let invalid_key = |reason: String| ConfigError::InvalidPem {
        name: cluster.to_string(),
        what: "client key",
        reason,
    };
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| invalid_key(e.to_string()))?
        .ok_or_else(|| invalid_key("no private key found".to_string()))?;

    Ok((chain, key))
}

/// Accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
