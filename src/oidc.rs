//! OpenID Connect login on behalf of a cluster
//!
//! `begin` sends the browser to the identity provider with the cluster name
//! (base64) as `state`. `callback` consumes that state, exchanges the code for
//! an ID token and verifies it against the provider's published keys. The
//! verified token is handed back to the browser, which then uses it as the
//! bearer token for that cluster.

use crate::credentials::CredentialMaterial;
use crate::error::{AuthFlowError, ConfigError};
use crate::factory::build_tls_config;
use crate::registry::ProxyRegistry;
use crate::target::OidcSettings;
use base64::Engine;
use dashmap::DashMap;
use hyper::HeaderMap;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const DEV_CLIENT_ROOT: &str = "http://localhost:3000/";

/// Endpoints from the provider's discovery document
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

/// A login waiting for the provider to redirect back
#[derive(Debug, Clone)]
pub struct AuthFlowState {
    pub cluster: String,
    pub settings: OidcSettings,
    pub provider: ProviderMetadata,
    pub redirect_url: String,
}

/// Result of a successful callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCompletion {
    pub cluster: String,
    pub id_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

pub struct AuthFlowBroker {
    registry: Arc<ProxyRegistry>,
    default_provider: Option<OidcSettings>,
    http: reqwest::Client,
    pending: DashMap<String, AuthFlowState>,
    dev_mode: bool,
    base_url: String,
}

impl AuthFlowBroker {
    /// `insecure` disables certificate checks when talking to providers
    pub fn new(
        registry: Arc<ProxyRegistry>,
        default_provider: Option<OidcSettings>,
        insecure: bool,
        dev_mode: bool,
        base_url: &str,
    ) -> Result<Arc<Self>, ConfigError> {
        let credentials = CredentialMaterial::new().with_insecure_skip_verify(insecure);
        let tls = build_tls_config("oidc", &credentials)?;
        let http = reqwest::Client::builder()
            .use_preconfigured_tls((*tls).clone())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConfigError::Tls {
                name: "oidc".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Arc::new(Self {
            registry,
            default_provider,
            http,
            pending: DashMap::new(),
            dev_mode,
            base_url: base_url.trim_end_matches('/').to_string(),
        }))
    }

    /// Start a login for `cluster`, returning the provider URL to redirect to
    pub async fn begin(&self, cluster: &str, redirect_url: String) -> Result<Url, AuthFlowError> {
        if cluster.is_empty() {
            return Err(AuthFlowError::MissingCluster);
        }

        let entry = self
            .registry
            .lookup(cluster)
            .ok_or_else(|| AuthFlowError::UnknownCluster(cluster.to_string()))?;

        let settings = entry
            .target()
            .oidc()
            .or(self.default_provider.as_ref())
            .cloned()
            .ok_or_else(|| AuthFlowError::NoProvider(cluster.to_string()))?;

        let provider = self.discover(&settings.issuer_url).await?;
        let state = encode_state(cluster);
        let url = authorization_url(&provider, &settings, &redirect_url, &state)?;

        self.pending.insert(
            state,
            AuthFlowState {
                cluster: cluster.to_string(),
                settings,
                provider,
                redirect_url,
            },
        );

        info!(cluster, issuer = %url.host_str().unwrap_or_default(), "Started OIDC login");
        Ok(url)
    }

    /// Finish a login. The state is consumed even when a later step fails.
    pub async fn callback(&self, state: &str, code: &str) -> Result<AuthCompletion, AuthFlowError> {
        if state.is_empty() {
            return Err(AuthFlowError::MissingState);
        }
        decode_state(state)?;

        let (_, flow) = self
            .pending
            .remove(state)
            .ok_or(AuthFlowError::UnknownState)?;

        let id_token = self.exchange(&flow, code).await?;
        let jwks = self.fetch_jwks(&flow.provider).await?;
        verify_id_token(&id_token, &jwks, &flow.provider.issuer, &flow.settings.client_id)?;

        info!(cluster = %flow.cluster, "OIDC login completed");
        Ok(AuthCompletion {
            cluster: flow.cluster,
            id_token,
        })
    }

    /// Where the browser goes once the login is done
    pub fn completion_redirect(&self, completion: &AuthCompletion) -> String {
        let root = if self.dev_mode {
            DEV_CLIENT_ROOT.to_string()
        } else {
            format!("{}/", self.base_url)
        };
        format!(
            "{}auth?cluster={}&token={}",
            root,
            urlencoding::encode(&completion.cluster),
            completion.id_token
        )
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn discover(&self, issuer: &str) -> Result<ProviderMetadata, AuthFlowError> {
        let failed = |reason: String| AuthFlowError::Discovery {
            issuer: issuer.to_string(),
            reason,
        };

        let url = format!("{}{}", issuer.trim_end_matches('/'), DISCOVERY_PATH);
        debug!(url = %url, "Fetching provider configuration");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("discovery returned {}", response.status())));
        }

        let metadata: ProviderMetadata = response.json().await.map_err(|e| failed(e.to_string()))?;
        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(failed(format!(
                "issuer did not match the issuer returned by provider, expected {} got {}",
                issuer, metadata.issuer
            )));
        }
        Ok(metadata)
    }

    async fn exchange(&self, flow: &AuthFlowState, code: &str) -> Result<String, AuthFlowError> {
        let settings = &flow.settings;
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", flow.redirect_url.as_str()),
        ];

        let mut request = self.http.post(&flow.provider.token_endpoint);
        if settings.client_secret.is_empty() {
            form.push(("client_id", settings.client_id.as_str()));
        } else {
            request = request.basic_auth(
                urlencoding::encode(&settings.client_id),
                Some(urlencoding::encode(&settings.client_secret)),
            );
        }

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthFlowError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(cluster = %flow.cluster, %status, "Token endpoint rejected code");
            return Err(AuthFlowError::Exchange(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthFlowError::Exchange(e.to_string()))?;
        token
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthFlowError::MissingIdToken)
    }

    async fn fetch_jwks(&self, provider: &ProviderMetadata) -> Result<JwkSet, AuthFlowError> {
        let response = self
            .http
            .get(&provider.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthFlowError::Verification(format!("fetching keys: {}", e)))?;
        response
            .json()
            .await
            .map_err(|e| AuthFlowError::Verification(format!("parsing keys: {}", e)))
    }
}

pub fn encode_state(cluster: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(cluster)
}

fn decode_state(state: &str) -> Result<String, AuthFlowError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(state)
        .map_err(|e| AuthFlowError::MalformedState(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AuthFlowError::MalformedState(e.to_string()))
}

fn authorization_url(
    provider: &ProviderMetadata,
    settings: &OidcSettings,
    redirect_url: &str,
    state: &str,
) -> Result<Url, AuthFlowError> {
    let mut url = Url::parse(&provider.authorization_endpoint).map_err(|e| AuthFlowError::Discovery {
        issuer: provider.issuer.clone(),
        reason: format!("invalid authorization endpoint: {}", e),
    })?;

    let mut scopes = vec!["openid"];
    scopes.extend(
        settings
            .scopes
            .iter()
            .map(String::as_str)
            .filter(|s| *s != "openid"),
    );

    url.query_pairs_mut()
        .append_pair("client_id", &settings.client_id)
        .append_pair("redirect_uri", redirect_url)
        .append_pair("response_type", "code")
        .append_pair("scope", &scopes.join(" "))
        .append_pair("state", state);
    Ok(url)
}

/// Check signature, issuer, audience and expiry of an ID token
pub fn verify_id_token(
    raw: &str,
    jwks: &JwkSet,
    issuer: &str,
    client_id: &str,
) -> Result<serde_json::Value, AuthFlowError> {
    let header = decode_header(raw).map_err(|e| AuthFlowError::Verification(e.to_string()))?;
    let jwk = match &header.kid {
        Some(kid) => jwks.find(kid),
        None => jwks.keys.first(),
    }
    .ok_or_else(|| AuthFlowError::Verification("no matching key in provider key set".to_string()))?;

    let algorithm = key_algorithm(jwk)?;
    if header.alg != algorithm {
        return Err(AuthFlowError::Verification(format!(
            "token signed with {:?} but provider key is {:?}",
            header.alg, algorithm
        )));
    }

    let key = DecodingKey::from_jwk(jwk).map_err(|e| AuthFlowError::Verification(e.to_string()))?;
    let mut validation = Validation::new(algorithm);
    validation.set_audience(&[client_id]);
    validation.set_issuer(&[issuer]);

    let token = decode::<serde_json::Value>(raw, &key, &validation).map_err(|e| AuthFlowError::Verification(e.to_string()))?;
    Ok(token.claims)
}

/// The signing algorithm a provider key is published for; symmetric keys are refused
fn key_algorithm(jwk: &Jwk) -> Result<Algorithm, AuthFlowError> {
    let algorithm = match (jwk.common.key_algorithm, &jwk.algorithm) {
        (Some(declared), _) => Algorithm::from_str(&declared.to_string())
            .map_err(|_| AuthFlowError::Verification(format!("unsupported key algorithm {}", declared)))?,
        (None, AlgorithmParameters::EllipticCurve(params)) => match params.curve {
            EllipticCurve::P256 => Algorithm::ES256,
            EllipticCurve::P384 => Algorithm::ES384,
            ref curve => {
                return Err(AuthFlowError::Verification(format!("unsupported curve {:?}", curve)))
            }
        },
        (None, AlgorithmParameters::RSA(_)) => Algorithm::RS256,
        (None, AlgorithmParameters::OctetKeyPair(_)) => Algorithm::EdDSA,
        (None, AlgorithmParameters::OctetKey(_)) => Algorithm::HS256,
    };

    if matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
        return Err(AuthFlowError::Verification(
            "provider key uses a shared secret".to_string(),
        ));
    }
    Ok(algorithm)
}

/// Build the provider callback URL from how the browser reached us
pub fn callback_url(headers: &HeaderMap, base_url: &str) -> String {
    let host = headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|h| h.to_str().ok())
        .filter(|p| !p.is_empty())
        .unwrap_or("http");

    let mut host_with_base = host.trim_matches('/').to_string();
    let base_url = base_url.trim_matches('/');
    if !base_url.is_empty() {
        host_with_base = format!("{}/{}", host_with_base, base_url);
    }

    format!("{}://{}/oidc-callback", scheme, host_with_base)
}
