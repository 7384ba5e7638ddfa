//! The IAM-style auth token boundary, used when the proxy is restricted to
//! AWS IAM token authentication (`aws_auth_only`) rather than a static
//! password. The proxy itself never talks to AWS; it only calls this trait
//! and uses the returned token as the upstream password during brokered
//! authentication.

/// Mints a short-lived authentication token for a given `(host, region,
/// user)` triple, in place of a static password. `region` lets a single
/// provider mint tokens scoped correctly across multiple cloud regions
/// without the core needing to know how that scoping works.
#[async_trait::async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn new_auth_token(
        &self,
        host: &str,
        region: &str,
        username: &str,
    ) -> Result<String, AuthTokenError>;
}

#[derive(Debug, thiserror::Error)]
#[error("failed to mint auth token: {0}")]
pub struct AuthTokenError(pub String);
