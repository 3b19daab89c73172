//! Routable cluster identities

use crate::credentials::CredentialMaterial;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// How a cluster entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
    /// Listed in the configuration file
    StaticConfig,
    /// Added through `POST /cluster`
    RuntimeAdded,
    /// The cluster the gateway itself runs in
    SelfDiscovered,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provenance::StaticConfig => "static",
            Provenance::RuntimeAdded => "runtime",
            Provenance::SelfDiscovered => "in-cluster",
        };
        f.write_str(s)
    }
}

/// Identity provider settings used for the OIDC login flow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcSettings {
    pub issuer_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Scopes requested in addition to `openid`
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Free-form metadata attached to a cluster and echoed by `/config`
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// One backend cluster reachable through the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyTarget {
    name: String,
    server: Url,
    credentials: CredentialMaterial,
    proxy_url: Option<String>,
    metadata: Metadata,
    oidc: Option<OidcSettings>,
    provenance: Provenance,
}

/// The view of a cluster returned by `/config`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClusterSummary {
    pub name: String,
    pub server: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl ProxyTarget {
    /// Create a target, validating the server URL
    pub fn new(
        name: &str,
        server: &str,
        credentials: CredentialMaterial,
        provenance: Provenance,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidServerUrl {
            name: name.to_string(),
            server: server.to_string(),
            reason,
        };

        let url = Url::parse(server).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            server: url,
            credentials,
            proxy_url: None,
            metadata: Metadata::new(),
            oidc: None,
            provenance,
        })
    }

    /// Route outbound traffic through a forward proxy
    pub fn with_proxy_url(mut self, proxy_url: Option<String>) -> Self {
        self.proxy_url = proxy_url.filter(|u| !u.is_empty());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_oidc(mut self, oidc: Option<OidcSettings>) -> Self {
        self.oidc = oidc;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    pub fn credentials(&self) -> &CredentialMaterial {
        &self.credentials
    }

    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn oidc(&self) -> Option<&OidcSettings> {
        self.oidc.as_ref()
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            name: self.name.clone(),
            server: self.server.as_str().trim_end_matches('/').to_string(),
            metadata: self.metadata.clone(),
        }
    }
}
