//! Credentials passed from the client's startup message through to the
//! upstream dial, and the two interception seams that let an embedder
//! rewrite them or inspect query traffic in flight.

use std::collections::HashMap;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;

use crate::cert::CertifiedKey;
use crate::error::ProxyError;
use crate::pg::ssl::SslMode;

/// Startup parameter keys that are promoted to first-class `Credentials`
/// fields and must therefore never also appear in `options`.
pub const RESERVED_PARAM_KEYS: [&str; 4] = ["user", "database", "password", "host"];

/// Everything the proxy knows about where to connect and as whom, after the
/// client's `StartupMessage` has been parsed and before the upstream is
/// dialed. A [`CredentialInterceptor`] may rewrite any field here — that is
/// the only point in the pipeline where routing/auth policy is applied.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// `"addr:port"`, as handed straight to the upstream dialer.
    pub host: String,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Residual startup parameters, with `user`/`database`/`password`/`host`
    /// already extracted into the fields above.
    pub options: HashMap<String, String>,
    pub ssl_mode: SslMode,
    pub client_certificate: Option<CertifiedKeyDescriptor>,
    pub root_certificate: Option<CertificateDer<'static>>,
}

/// A lightweight, clonable description of a client certificate an
/// interceptor wants the upstream dial to present. Kept distinct from
/// [`CertifiedKey`] in [`crate::cert`] mainly so `Credentials` stays `Clone`
/// without requiring `rustls::pki_types::PrivateKeyDer` (which is not
/// `Clone`) to be cloned implicitly on every credential copy; the key is
/// wrapped in an `Arc` instead.
#[derive(Debug, Clone)]
pub struct CertifiedKeyDescriptor(pub Arc<CertifiedKey>);

impl Credentials {
    /// The hostname portion of `host`, used for TLS server name indication
    /// and for `verify-full`'s hostname check.
    pub fn hostname(&self) -> &str {
        self.host.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.host)
    }

    /// Validates the §3 invariant that `options` never shadows a first-class
    /// field, after a [`CredentialInterceptor`] has had a chance to mutate
    /// everything.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.host.is_empty() {
            return Err(ProxyError::Config("credentials host must not be empty".into()));
        }
        if let Some(key) = RESERVED_PARAM_KEYS
            .iter()
            .find(|key| self.options.contains_key(**key))
        {
            return Err(ProxyError::Config(format!(
                "options must not contain reserved key {key:?}"
            )));
        }
        Ok(())
    }
}

/// The error an interceptor returns to refuse a connection outright, before
/// any upstream dial is attempted.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InterceptorError(pub String);

impl From<InterceptorError> for ProxyError {
    fn from(e: InterceptorError) -> Self {
        ProxyError::Interceptor(e.0)
    }
}

/// The policy hook between parsing the client's startup message and dialing
/// the upstream. Implementations typically look up routing information from
/// a control plane, rewrite `username`/`database` based on a host header
/// encoded in the connection string, or inject a short-lived IAM auth token
/// as the password.
#[async_trait::async_trait]
pub trait CredentialInterceptor: Send + Sync {
    async fn intercept(&self, creds: &mut Credentials) -> Result<(), InterceptorError>;
}

/// A [`CredentialInterceptor`] that does nothing, used when no interception
/// policy is configured and the client's own startup parameters are taken at
/// face value.
pub struct NoopCredentialInterceptor;

#[async_trait::async_trait]
impl CredentialInterceptor for NoopCredentialInterceptor {
    async fn intercept(&self, _creds: &mut Credentials) -> Result<(), InterceptorError> {
        Ok(())
    }
}

/// What a [`QueryInterceptor`] wants done with a query the client just sent.
/// `WillSendManually` is the Rust-idiomatic replacement for a Go sentinel
/// error: the interceptor has already written its own response (or its own
/// rewritten query) to the upstream connection, so the relay loop must
/// suppress its own forward of the original message.
pub enum QueryInterceptOutcome {
    Forward,
    WillSendManually,
}

/// A write-only handle onto the upstream-facing codec, handed to a
/// [`QueryInterceptor`] so it can reply or rewrite traffic itself without
/// being able to steal reads away from the server→client relay task, which
/// is the sole reader of the frontend codec.
pub struct FrontendSender<'a>(pub(crate) &'a crate::pg::frontend::Frontend);

impl FrontendSender<'_> {
    pub async fn send(&self, msg: crate::pg::message::FrontendMessage) -> Result<(), ProxyError> {
        self.0.send(msg).await
    }
}

/// The client-facing analogue of [`FrontendSender`].
pub struct BackendSender<'a>(pub(crate) &'a crate::pg::backend::Backend);

impl BackendSender<'_> {
    pub async fn send(&self, msg: crate::pg::message::BackendMessage) -> Result<(), ProxyError> {
        self.0.send(msg).await
    }
}

/// The policy hook on every `Query` message the client sends, invoked after
/// the message is parsed but before it is forwarded. Implementations can
/// inspect, log, block, or rewrite-and-resend traffic using the send-only
/// handles; returning [`QueryInterceptOutcome::WillSendManually`] tells the
/// relay the interceptor already did whatever forwarding or replying was
/// needed, so it must not also forward the original message.
#[async_trait::async_trait]
pub trait QueryInterceptor: Send + Sync {
    async fn intercept(
        &self,
        frontend: FrontendSender<'_>,
        backend: BackendSender<'_>,
        query: &str,
    ) -> Result<QueryInterceptOutcome, ProxyError>;
}

/// A [`QueryInterceptor`] that forwards every query unmodified.
pub struct NoopQueryInterceptor;

#[async_trait::async_trait]
impl QueryInterceptor for NoopQueryInterceptor {
    async fn intercept(
        &self,
        _frontend: FrontendSender<'_>,
        _backend: BackendSender<'_>,
        _query: &str,
    ) -> Result<QueryInterceptOutcome, ProxyError> {
        Ok(QueryInterceptOutcome::Forward)
    }
}
