//! The per-connection proxy: the state machine described in the design as
//! `AwaitingStartup -> CredentialInterception -> Dialing -> StartupForward
//! -> AuthBrokering? -> Relaying -> Terminated`. [`run`] drives one accepted
//! TCP connection through every state and returns a [`SessionReport`] for
//! the manager's error collector.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ProxyConfig, ProxyMode};
use crate::creds::{BackendSender, CertifiedKeyDescriptor, Credentials, FrontendSender, QueryInterceptOutcome, QueryInterceptor};
use crate::error::ProxyError;
use crate::pg::backend::{self, Backend};
use crate::pg::frontend::{self, BrokeredAuth, Frontend};
use crate::pg::message::{BackendMessage, FrontendMessage, StartupMessage, PROTOCOL_VERSION_3};
use crate::pg::ssl::{self, SslMode};

/// What a finished session reports back to the manager. A clean peer
/// disconnect is still reported, as [`ProxyError::ConnectionClosed`], so the
/// manager never has to distinguish "no report" from "still running" — it
/// always gets exactly one terminal record per session (§8).
pub struct SessionReport {
    pub session_id: u64,
    pub error: ProxyError,
}

/// Runs one accepted connection to completion. Never panics on a peer or
/// protocol error; every failure path is converted into a [`SessionReport`]
/// instead, since the manager's accept loop must survive per-session
/// failures unconditionally.
pub async fn run(
    session_id: u64,
    tcp: TcpStream,
    config: Arc<ProxyConfig>,
    shutdown: CancellationToken,
) -> SessionReport {
    let error = match run_inner(tcp, &config, shutdown).await {
        Ok(()) => ProxyError::ConnectionClosed,
        Err(e) => e,
    };
    SessionReport { session_id, error }
}

async fn run_inner(
    tcp: TcpStream,
    config: &ProxyConfig,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    let server_cert = config.server_certificate.as_deref();
    let (client_stream, startup) = backend::negotiate_client_tls(tcp, server_cert).await?;
    let backend = Backend::new(client_stream, config.idle_timeout);

    let mut creds = build_initial_credentials(startup, config);

    if let Err(e) = config.credential_interceptor.intercept(&mut creds).await {
        return fail(&backend, ProxyError::from(e)).await;
    }
    if let Err(e) = creds.validate() {
        return fail(&backend, e).await;
    }

    let client_cert = creds.client_certificate.as_ref().map(|d| d.0.as_ref());
    let upstream_stream = match ssl::dial(
        &creds.host,
        creds.ssl_mode,
        creds.hostname(),
        client_cert,
        creds.root_certificate.as_ref(),
    )
    .await
    {
        Ok(stream) => stream,
        Err(e) => return fail(&backend, e).await,
    };
    let frontend = Frontend::new(upstream_stream, config.idle_timeout);

    let startup_params = build_startup_parameters(&creds, config.mode, config.aws_auth_only);
    let startup_msg = StartupMessage {
        protocol_version: PROTOCOL_VERSION_3,
        parameters: startup_params,
    };
    if let Err(e) = frontend.send_startup(&startup_msg).await {
        return fail(&backend, e).await;
    }

    if config.brokers_auth(!creds.password.is_empty()) {
        match frontend::broker_authentication(&frontend, &creds.username, &creds.password).await {
            Ok(BrokeredAuth::Ok) => {
                backend.send(BackendMessage::AuthenticationOk).await?;
            }
            Ok(BrokeredAuth::OkAndReady) => {
                backend.send(BackendMessage::AuthenticationOk).await?;
                backend.send(BackendMessage::ReadyForQuery).await?;
            }
            Ok(BrokeredAuth::Rejected(resp)) => {
                return fail(&backend, ProxyError::AuthFailed(resp)).await;
            }
            Err(e) => return fail(&backend, e).await,
        }
    }

    relay(backend, frontend, config, shutdown).await
}

/// Sends a single `FATAL` `ErrorResponse` built from `error` to the client,
/// then returns the same error so the caller can propagate it to the
/// manager unchanged. Used at every state before `Relaying` — once a state
/// fails, there is no partial recovery, only a clean, visible refusal.
async fn fail(backend: &Backend, error: ProxyError) -> Result<(), ProxyError> {
    let resp = error.to_client_error_response();
    let _ = backend.send(BackendMessage::ErrorResponse(resp)).await;
    Err(error)
}

/// Builds the initial [`Credentials`] from the client's startup parameters:
/// `user`/`database`/`password`/`host` are promoted to first-class fields,
/// everything else becomes `options`. Per §4.5 the initial SSL mode is
/// always `require` and the client certificate defaults to whatever the
/// proxy is configured to present, pending whatever the credential
/// interceptor decides to do with either.
fn build_initial_credentials(startup: StartupMessage, config: &ProxyConfig) -> Credentials {
    let mut params = startup.parameters;
    let username = params.remove("user").unwrap_or_default();
    let database = params.remove("database").unwrap_or_default();
    let password = params.remove("password").unwrap_or_default();
    let host = params.remove("host").unwrap_or_default();

    Credentials {
        host,
        database,
        username,
        password,
        options: params,
        ssl_mode: SslMode::Require,
        client_certificate: config
            .default_client_certificate
            .clone()
            .map(CertifiedKeyDescriptor),
        root_certificate: None,
    }
}

/// Builds the startup parameters sent upstream: `user`/`database` plus the
/// residual `options`, with the password injected into the startup frame
/// only in the `ClientSide`, non-AWS-only case (§9's "AwsAuthOnly in
/// ClientSide startup" open question) — otherwise the password is either
/// relayed client-to-server unintercepted, or delivered through the
/// brokered `PasswordMessage` flow instead of ever touching the startup
/// parameters.
fn build_startup_parameters(
    creds: &Credentials,
    mode: ProxyMode,
    aws_auth_only: bool,
) -> HashMap<String, String> {
    let mut params = creds.options.clone();
    params.insert("user".to_string(), creds.username.clone());
    params.insert("database".to_string(), creds.database.clone());
    if mode == ProxyMode::ClientSide && !aws_auth_only && !creds.password.is_empty() {
        params.insert("password".to_string(), creds.password.clone());
    }
    params
}

/// Runs the full-duplex relay: one task forwards client messages upstream
/// (with the query-interception hook), the other forwards upstream
/// messages to the client. Whichever direction ends first determines the
/// session's outcome; the other task is given the session's idle timeout to
/// notice cancellation and wind down before it's abandoned.
async fn relay(
    backend: Backend,
    frontend: Frontend,
    config: &ProxyConfig,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    let backend = Arc::new(backend);
    let frontend = Arc::new(frontend);
    let idle_timeout = config.idle_timeout;

    let mut tasks = JoinSet::new();
    tasks.spawn(client_to_server(
        Arc::clone(&backend),
        Arc::clone(&frontend),
        Arc::clone(&config.query_interceptor),
        shutdown.clone(),
    ));
    tasks.spawn(server_to_client(
        Arc::clone(&backend),
        Arc::clone(&frontend),
        shutdown.clone(),
    ));

    let first = tasks.join_next().await;
    shutdown.cancel();

    let _ = tokio::time::timeout(idle_timeout, tasks.join_next()).await;
    tasks.abort_all();

    let _ = backend.shutdown().await;

    match first {
        Some(Ok(result)) => result,
        _ => Err(ProxyError::ConnectionClosed),
    }
}

/// Forwards messages from the client to the upstream. `Terminate` is
/// forwarded before the clean stop is reported, so the upstream observes
/// graceful shutdown (§5); `Query` goes through the configured query
/// interceptor first; everything else is forwarded unchanged.
async fn client_to_server(
    backend: Arc<Backend>,
    frontend: Arc<Frontend>,
    query_interceptor: Arc<dyn QueryInterceptor>,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Err(ProxyError::ConnectionClosed),
            msg = backend.receive() => msg,
        }?;

        match msg {
            FrontendMessage::Terminate => {
                frontend.send(FrontendMessage::Terminate).await?;
                return Err(ProxyError::ConnectionClosed);
            }
            FrontendMessage::Query(query) => {
                let outcome = query_interceptor
                    .intercept(FrontendSender(&frontend), BackendSender(&backend), &query)
                    .await?;
                if matches!(outcome, QueryInterceptOutcome::Forward) {
                    frontend.send(FrontendMessage::Query(query)).await?;
                }
            }
            other => frontend.send(other).await?,
        }
    }
}

/// Forwards messages from the upstream to the client unchanged. This path
/// is not used while `AuthBrokering` owns the frontend codec; by the time
/// `Relaying` starts, any brokered auth dialogue has already completed.
async fn server_to_client(
    backend: Arc<Backend>,
    frontend: Arc<Frontend>,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Err(ProxyError::ConnectionClosed),
            msg = frontend.receive() => msg,
        }?;
        backend.send(msg).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn creds_with(options: &[(&str, &str)], password: &str) -> Credentials {
        Credentials {
            host: "db:5432".into(),
            database: "app".into(),
            username: "alice".into(),
            password: password.into(),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ssl_mode: SslMode::Require,
            client_certificate: None,
            root_certificate: None,
        }
    }

    #[test]
    fn startup_parameters_inject_password_only_for_client_side_non_aws() {
        let creds = creds_with(&[], "s3cret");
        let params = build_startup_parameters(&creds, ProxyMode::ClientSide, false);
        assert_eq!(params.get("password"), Some(&"s3cret".to_string()));

        let params = build_startup_parameters(&creds, ProxyMode::ClientSide, true);
        assert_eq!(params.get("password"), None);

        let params = build_startup_parameters(&creds, ProxyMode::ServerSide, false);
        assert_eq!(params.get("password"), None);
    }

    #[test]
    fn startup_parameters_never_inject_empty_password() {
        let creds = creds_with(&[], "");
        let params = build_startup_parameters(&creds, ProxyMode::ClientSide, false);
        assert_eq!(params.get("password"), None);
    }

    #[test]
    fn startup_parameters_merge_residual_options() {
        let creds = creds_with(&[("application_name", "psql")], "");
        let params = build_startup_parameters(&creds, ProxyMode::ClientSide, false);
        assert_eq!(params.get("application_name"), Some(&"psql".to_string()));
        assert_eq!(params.get("user"), Some(&"alice".to_string()));
        assert_eq!(params.get("database"), Some(&"app".to_string()));
    }

    #[test]
    fn initial_credentials_extract_reserved_keys_into_fields() {
        let mut parameters = HashMap::new();
        parameters.insert("user".to_string(), "bob".to_string());
        parameters.insert("database".to_string(), "widgets".to_string());
        parameters.insert("host".to_string(), "inbound-host".to_string());
        parameters.insert("application_name".to_string(), "psql".to_string());
        let startup = StartupMessage {
            protocol_version: PROTOCOL_VERSION_3,
            parameters,
        };

        let config = crate::config::ProxyConfigBuilder::new()
            .listen_addr("127.0.0.1:5432".parse().unwrap())
            .build()
            .unwrap();

        let creds = build_initial_credentials(startup, &config);
        assert_eq!(creds.username, "bob");
        assert_eq!(creds.database, "widgets");
        assert_eq!(creds.host, "inbound-host");
        assert_eq!(creds.ssl_mode, SslMode::Require);
        assert!(!creds.options.contains_key("user"));
        assert!(!creds.options.contains_key("host"));
        assert_eq!(creds.options.get("application_name"), Some(&"psql".to_string()));
    }
}
