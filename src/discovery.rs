//! Self-discovery of the cluster the gateway runs in

use crate::credentials::{CredentialMaterial, PemSource};
use crate::error::ConfigError;
use crate::target::{Metadata, OidcSettings, Provenance, ProxyTarget};
use std::path::{Path, PathBuf};
use tracing::info;

/// Name the discovered cluster is registered under
pub const IN_CLUSTER_NAME: &str = "main";

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Where to find the service-account material and API server address
#[derive(Debug, Clone)]
pub struct InClusterSource {
    pub host: Option<String>,
    pub port: Option<String>,
    pub token_path: PathBuf,
    pub ca_path: PathBuf,
}

impl InClusterSource {
    /// Read the standard environment variables and mount paths
    pub fn from_env() -> Self {
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        Self {
            host: std::env::var(SERVICE_HOST_ENV).ok(),
            port: std::env::var(SERVICE_PORT_ENV).ok(),
            token_path: dir.join("token"),
            ca_path: dir.join("ca.crt"),
        }
    }

    /// Build the `main` target
    pub fn discover(&self, oidc: Option<OidcSettings>) -> Result<ProxyTarget, ConfigError> {
        let (host, port) = match (self.host.as_deref(), self.port.as_deref()) {
            (Some(host), Some(port)) if !host.is_empty() && !port.is_empty() => (host, port),
            _ => {
                return Err(ConfigError::InvalidServerUrl {
                    name: IN_CLUSTER_NAME.to_string(),
                    server: String::new(),
                    reason: format!(
                        "unable to load in-cluster configuration, {} and {} must be defined",
                        SERVICE_HOST_ENV, SERVICE_PORT_ENV
                    ),
                })
            }
        };

        // IPv6 service hosts need brackets in the URL
        let server = if host.contains(':') {
            format!("https://[{}]:{}", host, port)
        } else {
            format!("https://{}:{}", host, port)
        };

        let token = std::fs::read_to_string(&self.token_path).map_err(|source| {
            ConfigError::ReadFile {
                name: IN_CLUSTER_NAME.to_string(),
                path: self.token_path.display().to_string(),
                source,
            }
        })?;

        let credentials = CredentialMaterial::new()
            .with_certificate_authority(Some(PemSource::File(self.ca_path.clone())))
            .with_bearer_token(Some(token.trim().to_string()));

        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), serde_json::json!("incluster"));

        let target = ProxyTarget::new(IN_CLUSTER_NAME, &server, credentials, Provenance::SelfDiscovered)?
            .with_metadata(metadata)
            .with_oidc(oidc);

        info!(cluster = IN_CLUSTER_NAME, server = %server, "Discovered in-cluster API server");
        Ok(target)
    }
}
