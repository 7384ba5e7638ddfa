//! Proxy-wide configuration: the listen address, SSL posture on each leg,
//! the operating mode, and the interception hooks. Built through
//! [`ProxyConfigBuilder`] so invalid combinations (e.g. `require` without a
//! server certificate) are caught once, at startup, rather than per session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::auth_token::AuthTokenProvider;
use crate::cert::CertifiedKey;
use crate::creds::{CredentialInterceptor, NoopCredentialInterceptor, NoopQueryInterceptor, QueryInterceptor};
use crate::error::ProxyError;
use crate::pg::ssl::SslMode;

/// Whether the proxy relays the client's own password exchange to the
/// upstream unchanged (`ClientSide`), or completes authentication with the
/// upstream itself using a password it already holds and synthesizes a
/// single `AuthenticationOk` back to the client (`ServerSide`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    ClientSide,
    ServerSide,
}

/// Immutable, validated configuration shared by every session the
/// [`crate::manager::Manager`] spawns.
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub mode: ProxyMode,
    pub client_ssl_mode: SslMode,
    pub server_certificate: Option<Arc<CertifiedKey>>,
    pub default_client_certificate: Option<Arc<CertifiedKey>>,
    pub idle_timeout: Duration,
    pub aws_auth_only: bool,
    pub credential_interceptor: Arc<dyn CredentialInterceptor>,
    pub query_interceptor: Arc<dyn QueryInterceptor>,
    pub auth_token_provider: Option<Arc<dyn AuthTokenProvider>>,
}

impl ProxyConfig {
    /// Whether this session should have its authentication brokered by the
    /// proxy rather than relayed: either the proxy is explicitly configured
    /// for server-side auth, or it is restricted to AWS IAM token auth and
    /// therefore must supply the upstream password itself.
    pub fn brokers_auth(&self, has_password: bool) -> bool {
        (self.mode == ProxyMode::ServerSide || self.aws_auth_only) && has_password
    }
}

#[derive(Default)]
pub struct ProxyConfigBuilder {
    listen_addr: Option<SocketAddr>,
    mode: ProxyMode_,
    client_ssl_mode: Option<SslMode>,
    server_certificate: Option<Arc<CertifiedKey>>,
    default_client_certificate: Option<Arc<CertifiedKey>>,
    idle_timeout: Option<Duration>,
    aws_auth_only: bool,
    credential_interceptor: Option<Arc<dyn CredentialInterceptor>>,
    query_interceptor: Option<Arc<dyn QueryInterceptor>>,
    auth_token_provider: Option<Arc<dyn AuthTokenProvider>>,
}

/// Wrapper so `ProxyConfigBuilder` can `#[derive(Default)]` even though
/// `ProxyMode` itself has no natural default.
#[derive(Clone, Copy)]
struct ProxyMode_(ProxyMode);

impl Default for ProxyMode_ {
    fn default() -> Self {
        ProxyMode_(ProxyMode::ClientSide)
    }
}

impl ProxyConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    pub fn mode(mut self, mode: ProxyMode) -> Self {
        self.mode = ProxyMode_(mode);
        self
    }

    pub fn client_ssl_mode(mut self, mode: SslMode) -> Self {
        self.client_ssl_mode = Some(mode);
        self
    }

    pub fn server_certificate(mut self, cert: CertifiedKey) -> Self {
        self.server_certificate = Some(Arc::new(cert));
        self
    }

    pub fn default_client_certificate(mut self, cert: CertifiedKey) -> Self {
        self.default_client_certificate = Some(Arc::new(cert));
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn aws_auth_only(mut self, enabled: bool) -> Self {
        self.aws_auth_only = enabled;
        self
    }

    pub fn credential_interceptor(mut self, interceptor: Arc<dyn CredentialInterceptor>) -> Self {
        self.credential_interceptor = Some(interceptor);
        self
    }

    pub fn query_interceptor(mut self, interceptor: Arc<dyn QueryInterceptor>) -> Self {
        self.query_interceptor = Some(interceptor);
        self
    }

    pub fn auth_token_provider(mut self, provider: Arc<dyn AuthTokenProvider>) -> Self {
        self.auth_token_provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<ProxyConfig, ProxyError> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| ProxyError::Config("listen_addr is required".into()))?;

        let client_ssl_mode = self.client_ssl_mode.unwrap_or(SslMode::Preferred);

        if client_ssl_mode.requires_certificate() && self.server_certificate.is_none() {
            return Err(ProxyError::Config(
                "client_ssl_mode requires TLS but no server_certificate was configured".into(),
            ));
        }

        let aws_auth_only = self.aws_auth_only;
        if aws_auth_only && self.auth_token_provider.is_none() {
            return Err(ProxyError::Config(
                "aws_auth_only requires an auth_token_provider".into(),
            ));
        }

        Ok(ProxyConfig {
            listen_addr,
            mode: self.mode.0,
            client_ssl_mode,
            server_certificate: self.server_certificate,
            default_client_certificate: self.default_client_certificate,
            idle_timeout: self.idle_timeout.unwrap_or(Duration::from_secs(3)),
            aws_auth_only,
            credential_interceptor: self
                .credential_interceptor
                .unwrap_or_else(|| Arc::new(NoopCredentialInterceptor)),
            query_interceptor: self
                .query_interceptor
                .unwrap_or_else(|| Arc::new(NoopQueryInterceptor)),
            auth_token_provider: self.auth_token_provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_listen_addr() {
        let err = ProxyConfigBuilder::new().build().unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn build_rejects_tls_mode_without_certificate() {
        let err = ProxyConfigBuilder::new()
            .listen_addr("127.0.0.1:5432".parse().unwrap())
            .client_ssl_mode(SslMode::Require)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn build_rejects_aws_auth_only_without_provider() {
        let err = ProxyConfigBuilder::new()
            .listen_addr("127.0.0.1:5432".parse().unwrap())
            .aws_auth_only(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn build_succeeds_with_defaults() {
        let config = ProxyConfigBuilder::new()
            .listen_addr("127.0.0.1:5432".parse().unwrap())
            .build()
            .unwrap();
        assert_eq!(config.mode, ProxyMode::ClientSide);
        assert_eq!(config.client_ssl_mode, SslMode::Preferred);
    }
}
