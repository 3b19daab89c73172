use crate::credentials::{CredentialMaterial, PemSource};
use crate::error::ConfigError;
use crate::target::{Metadata, OidcSettings, Provenance, ProxyTarget};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Port-forward settings
    #[serde(default)]
    pub tunnels: TunnelConfig,

    /// Identity provider used by clusters without their own `oidc` section
    pub oidc: Option<OidcSettings>,

    /// Statically configured clusters, keyed by name
    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 4466)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path prefix every route is served under, e.g. "/gateway"
    #[serde(default)]
    pub base_url: String,

    /// Development mode: permissive CORS, login completes on localhost:3000
    #[serde(default)]
    pub dev_mode: bool,

    /// Skip TLS verification for every cluster
    #[serde(default)]
    pub insecure: bool,

    /// Register the cluster this process runs in as `main`
    #[serde(default)]
    pub in_cluster: bool,

    /// Allow clusters to be added and removed through the API
    #[serde(default)]
    pub enable_dynamic_clusters: bool,

    /// Directory watched for plugin changes
    pub plugin_dir: Option<PathBuf>,

    /// How often the plugin directory is checked, in milliseconds
    #[serde(default = "default_plugin_poll_interval")]
    pub plugin_poll_interval_ms: u64,

    /// Glob patterns `/externalproxy` may relay to
    #[serde(default)]
    pub external_proxy_urls: Vec<String>,

    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ServerConfig {
    pub fn plugin_poll_interval(&self) -> Duration {
        Duration::from_millis(self.plugin_poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Whether `POST /cluster` and `DELETE /cluster` are served
    pub fn dynamic_clusters_allowed(&self) -> bool {
        self.enable_dynamic_clusters && !self.in_cluster
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            base_url: String::new(),
            dev_mode: false,
            insecure: false,
            in_cluster: false,
            enable_dynamic_clusters: false,
            plugin_dir: None,
            plugin_poll_interval_ms: default_plugin_poll_interval(),
            external_proxy_urls: Vec::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Seconds between workload liveness checks
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    /// Seconds to wait for a new tunnel to become ready
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

impl TunnelConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_secs: default_watchdog_interval(),
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

/// Configuration for a single cluster
///
/// File paths and inline `*_data` fields are mutually exclusive. Inline data
/// is base64-encoded PEM, as found in kubeconfig files.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClusterConfig {
    /// API server base URL
    pub server: String,

    pub certificate_authority: Option<PathBuf>,
    pub certificate_authority_data: Option<String>,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    pub client_certificate: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub client_certificate_data: Option<String>,
    pub client_key_data: Option<String>,

    /// Static bearer token injected when the caller sends none
    pub token: Option<String>,

    /// Forward proxy for traffic to this cluster
    pub proxy_url: Option<String>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Cluster-specific identity provider
    pub oidc: Option<OidcSettings>,
}

impl ClusterConfig {
    /// Resolve file and inline material into a routable target
    pub fn to_target(
        &self,
        name: &str,
        provenance: Provenance,
        insecure: bool,
    ) -> Result<ProxyTarget, ConfigError> {
        let inline = |field: &'static str, data: &Option<String>| {
            data.as_deref()
                .filter(|d| !d.is_empty())
                .map(|d| decode_base64(name, field, d))
                .transpose()
        };

        let certificate_authority = PemSource::from_parts(
            name,
            "certificate authority",
            self.certificate_authority.clone(),
            inline("certificate_authority_data", &self.certificate_authority_data)?,
        )?;
        let client_certificate = PemSource::from_parts(
            name,
            "client certificate",
            self.client_certificate.clone(),
            inline("client_certificate_data", &self.client_certificate_data)?,
        )?;
        let client_key = PemSource::from_parts(
            name,
            "client key",
            self.client_key.clone(),
            inline("client_key_data", &self.client_key_data)?,
        )?;

        let credentials = CredentialMaterial::new()
            .with_certificate_authority(certificate_authority)
            .with_insecure_skip_verify(insecure || self.insecure_skip_tls_verify)
            .with_bearer_token(self.token.clone())
            .with_client_identity(name, client_certificate, client_key)?;

        Ok(ProxyTarget::new(name, &self.server, credentials, provenance)?
            .with_proxy_url(self.proxy_url.clone())
            .with_metadata(self.metadata.clone())
            .with_oidc(self.oidc.clone()))
    }

    /// Validate the cluster configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if name.is_empty() || name.contains('/') {
            return Err(format!("Cluster '{}': invalid cluster name", name));
        }

        if self.server.is_empty() {
            return Err(format!("Cluster '{}': 'server' is required", name));
        }

        if let Some(oidc) = &self.oidc {
            if oidc.issuer_url.is_empty() || oidc.client_id.is_empty() {
                return Err(format!(
                    "Cluster '{}': oidc requires 'issuer_url' and 'client_id'",
                    name
                ));
            }
        }

        Ok(())
    }
}

/// Decode a base64 field into raw bytes
pub fn decode_base64(cluster: &str, field: &'static str, data: &str) -> Result<Vec<u8>, ConfigError> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| ConfigError::InvalidBase64 {
            name: cluster.to_string(),
            field,
            reason: e.to_string(),
        })
}

// Default value functions
fn default_listen_port() -> u16 {
    4466
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_plugin_poll_interval() -> u64 {
    1000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_watchdog_interval() -> u64 {
    5
}

fn default_ready_timeout() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let base_url = &self.server.base_url;
        if !base_url.is_empty() && (!base_url.starts_with('/') || base_url.ends_with('/')) {
            errors.push(format!(
                "server.base_url '{}' must start with '/' and not end with '/'",
                base_url
            ));
        }

        if self.server.plugin_poll_interval_ms == 0 {
            errors.push("server.plugin_poll_interval_ms must be greater than 0".to_string());
        }

        for pattern in &self.server.external_proxy_urls {
            if let Err(e) = globset::Glob::new(pattern) {
                errors.push(format!("server.external_proxy_urls: '{}': {}", pattern, e));
            }
        }

        if self.tunnels.watchdog_interval_secs == 0 {
            errors.push("tunnels.watchdog_interval_secs must be greater than 0".to_string());
        }

        if self.tunnels.ready_timeout_secs == 0 {
            errors.push("tunnels.ready_timeout_secs must be greater than 0".to_string());
        }

        if let Some(oidc) = &self.oidc {
            if oidc.issuer_url.is_empty() || oidc.client_id.is_empty() {
                errors.push("oidc requires 'issuer_url' and 'client_id'".to_string());
            }
        }

        for (name, cluster) in &self.clusters {
            if let Err(e) = cluster.validate(name) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Build every static cluster, sorted by name
    pub fn static_targets(&self) -> Vec<(String, Result<ProxyTarget, ConfigError>)> {
        let mut names: Vec<&String> = self.clusters.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let target = self.clusters[name].to_target(
                    name,
                    Provenance::StaticConfig,
                    self.server.insecure,
                );
                (name.clone(), target)
            })
            .collect()
    }
}
