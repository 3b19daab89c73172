//! Per-cluster trust and credential material

use crate::error::ConfigError;
use std::fmt;
use std::path::PathBuf;

/// Where a PEM blob comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PemSource {
    /// Read from disk when the proxy is built
    File(PathBuf),
    /// Supplied inline (already decoded PEM bytes)
    Inline(Vec<u8>),
}

impl PemSource {
    /// Pick a source from an optional path and optional inline data.
    ///
    /// Supplying both is rejected so a stale file can't silently win over
    /// data the caller meant to use.
    pub fn from_parts(
        cluster: &str,
        what: &'static str,
        path: Option<PathBuf>,
        data: Option<Vec<u8>>,
    ) -> Result<Option<Self>, ConfigError> {
        match (path, data) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingSources {
                name: cluster.to_string(),
                what,
            }),
            (Some(path), None) => Ok(Some(PemSource::File(path))),
            (None, Some(data)) => Ok(Some(PemSource::Inline(data))),
            (None, None) => Ok(None),
        }
    }

    /// Load the PEM bytes
    pub fn read(&self, cluster: &str) -> Result<Vec<u8>, ConfigError> {
        match self {
            PemSource::Inline(data) => Ok(data.clone()),
            PemSource::File(path) => std::fs::read(path).map_err(|source| ConfigError::ReadFile {
                name: cluster.to_string(),
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

/// A client certificate with its matching private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub certificate: PemSource,
    pub key: PemSource,
}

/// Trust bundle, client identities and bearer token for one cluster
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialMaterial {
    certificate_authority: Option<PemSource>,
    insecure_skip_verify: bool,
    client_identities: Vec<ClientIdentity>,
    bearer_token: Option<String>,
}

impl CredentialMaterial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CA bundle used to verify the cluster's server certificate
    pub fn with_certificate_authority(mut self, source: Option<PemSource>) -> Self {
        self.certificate_authority = source;
        self
    }

    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Add a client identity; a certificate without a key (or the reverse)
    /// is a configuration error.
    pub fn with_client_identity(
        mut self,
        cluster: &str,
        certificate: Option<PemSource>,
        key: Option<PemSource>,
    ) -> Result<Self, ConfigError> {
        match (certificate, key) {
            (Some(certificate), Some(key)) => {
                self.client_identities.push(ClientIdentity { certificate, key });
                Ok(self)
            }
            (Some(_), None) => Err(ConfigError::MissingClientKey {
                name: cluster.to_string(),
            }),
            (None, Some(_)) => Err(ConfigError::MissingClientCertificate {
                name: cluster.to_string(),
            }),
            (None, None) => Ok(self),
        }
    }

    pub fn certificate_authority(&self) -> Option<&PemSource> {
        self.certificate_authority.as_ref()
    }

    pub fn insecure_skip_verify(&self) -> bool {
        self.insecure_skip_verify
    }

    pub fn client_identities(&self) -> &[ClientIdentity] {
        &self.client_identities
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("certificate_authority", &self.certificate_authority.is_some())
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("client_identities", &self.client_identities.len())
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
