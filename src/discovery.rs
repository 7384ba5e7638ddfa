//! The control-plane boundary: resolving a connection target from either the
//! hostname a client dialed or an explicit project/endpoint name. A real
//! deployment backs this with an HTTP call to a control plane; this crate
//! ships only the trait and a static in-memory implementation for tests and
//! examples.

use std::collections::HashMap;

/// Where a resolved connection should actually go, and enough about it for
/// a credential interceptor to fill in `Credentials` without a second
/// round-trip to the control plane. Named `Target` in the spec this crate
/// implements; called `Endpoint` here to avoid colliding with
/// [`crate::config::ProxyConfig`]'s unrelated notion of a listen target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Cloud region the instance lives in, passed through to the auth-token
    /// provider alongside host and username.
    pub region: String,
    pub ssl_mode: crate::pg::ssl::SslMode,
    pub default_database: String,
    /// Whether this target is a managed RDS-style instance as opposed to a
    /// self-hosted one discovery also happens to know about.
    pub is_rds: bool,
    /// Local port a client-side proxy should listen on to reach this target
    /// through a cluster port-forward tunnel, when one is configured.
    pub local_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no endpoint registered for {0:?}")]
    NotFound(String),
}

/// The control-plane lookup boundary used by a [`crate::creds::CredentialInterceptor`]
/// to translate what the client asked for into where the proxy should
/// actually dial.
#[async_trait::async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Resolves an endpoint from the host the client's TCP connection
    /// arrived on (SNI, or a host header encoded in the startup parameters).
    async fn lookup_by_host(&self, host: &str) -> Result<Endpoint, DiscoveryError>;

    /// Resolves an endpoint from an explicit project/endpoint name, as
    /// carried in a startup parameter such as `options` or a dedicated
    /// `endpoint` key.
    async fn lookup_by_name(&self, name: &str) -> Result<Endpoint, DiscoveryError>;
}

/// A fixed, in-memory [`DiscoveryClient`] keyed by host and by name. Useful
/// for tests and for embedders who already know their full routing table
/// ahead of time and don't need a live control plane.
pub struct StaticDiscoveryClient {
    by_host: HashMap<String, Endpoint>,
    by_name: HashMap<String, Endpoint>,
}

impl StaticDiscoveryClient {
    pub fn new() -> Self {
        StaticDiscoveryClient {
            by_host: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, endpoint: Endpoint) -> Self {
        self.by_host.insert(host.into(), endpoint);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>, endpoint: Endpoint) -> Self {
        self.by_name.insert(name.into(), endpoint);
        self
    }
}

impl Default for StaticDiscoveryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DiscoveryClient for StaticDiscoveryClient {
    async fn lookup_by_host(&self, host: &str) -> Result<Endpoint, DiscoveryError> {
        self.by_host
            .get(host)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(host.to_string()))
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Endpoint, DiscoveryError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_endpoint(host: &str, port: u16) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port,
            region: "us-east-1".into(),
            ssl_mode: crate::pg::ssl::SslMode::VerifyFull,
            default_database: "postgres".into(),
            is_rds: true,
            local_port: None,
        }
    }

    #[tokio::test]
    async fn resolves_registered_host() {
        let client = StaticDiscoveryClient::new()
            .with_host("db.example.com", test_endpoint("10.0.0.1", 5432));
        let resolved = client.lookup_by_host("db.example.com").await.unwrap();
        assert_eq!(resolved.port, 5432);
        assert_eq!(resolved.region, "us-east-1");
    }

    #[tokio::test]
    async fn missing_host_is_not_found() {
        let client = StaticDiscoveryClient::new();
        assert!(matches!(
            client.lookup_by_host("nope").await,
            Err(DiscoveryError::NotFound(_))
        ));
    }
}
