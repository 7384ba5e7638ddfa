//! CLI entry point. Peripheral to the core (§1): argument parsing, log
//! setup, and a minimal static credential interceptor so the binary is
//! runnable standalone, without pulling in a real discovery/control-plane
//! implementation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use proxy::cert::{self, CertifiedKey};
use proxy::config::{ProxyConfigBuilder, ProxyMode};
use proxy::creds::{Credentials, CredentialInterceptor, InterceptorError};
use proxy::pg::ssl::SslMode;
use proxy::Manager;

#[derive(Parser)]
#[command(name = "proxy", version, about = "SSL-capable PostgreSQL wire protocol proxy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a self-signed certificate/key pair for local testing.
    GenCerts {
        /// Comma-separated list of subject alternative names.
        #[arg(long, default_value = "localhost")]
        names: String,
        /// Output path prefix; writes `<prefix>.crt` and `<prefix>.key`.
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args, Clone)]
struct ServeArgs {
    /// Address to accept client connections on.
    #[arg(long, env = "PROXY_LISTEN_ADDR", default_value = "127.0.0.1:5432")]
    listen_addr: SocketAddr,

    /// `client-side` attaches credentials and forwards; `server-side`
    /// enforces ACL policy and completes authentication itself.
    #[arg(long, env = "PROXY_MODE", value_enum, default_value = "client-side")]
    mode: CliProxyMode,

    /// SSL mode for the client-facing leg.
    #[arg(long, env = "PROXY_CLIENT_SSL_MODE", default_value = "preferred")]
    client_ssl_mode: String,

    /// Path to the server certificate (PEM) presented to clients during the
    /// in-band TLS upgrade. Required if `client_ssl_mode` is not `disable`.
    #[arg(long, env = "PROXY_SERVER_CERT")]
    server_cert: Option<PathBuf>,
    #[arg(long, env = "PROXY_SERVER_KEY")]
    server_key: Option<PathBuf>,

    /// Path to a default client certificate (PEM) presented to the
    /// upstream for mutual TLS, absent an interceptor-supplied one.
    #[arg(long, env = "PROXY_CLIENT_CERT")]
    client_cert: Option<PathBuf>,
    #[arg(long, env = "PROXY_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Per-read idle deadline before a relay read is retried.
    #[arg(long, env = "PROXY_IDLE_TIMEOUT", value_parser = humantime::parse_duration, default_value = "3s")]
    idle_timeout: Duration,

    /// Restrict authentication to an injected IAM-style token; the proxy
    /// brokers auth itself even in client-side mode.
    #[arg(long, env = "PROXY_AWS_AUTH_ONLY", default_value_t = false)]
    aws_auth_only: bool,

    /// Fixed upstream host:port to dial for every connection, bypassing
    /// target discovery. Peripheral convenience for running this binary
    /// without a real discovery/control-plane implementation wired in.
    #[arg(long, env = "PROXY_TARGET_HOST")]
    target_host: Option<String>,

    /// Static password to attach to every connection when `target_host` is
    /// set. In a real deployment this would instead come from a cloud
    /// auth-token provider or be relayed from the client unmodified.
    #[arg(long, env = "PROXY_TARGET_PASSWORD")]
    target_password: Option<String>,

    /// Log filter passed to `tracing_subscriber::EnvFilter`, overridable by
    /// `RUST_LOG`.
    #[arg(long, env = "PROXY_LOG", default_value = "info")]
    log_filter: String,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliProxyMode {
    ClientSide,
    ServerSide,
}

impl From<CliProxyMode> for ProxyMode {
    fn from(mode: CliProxyMode) -> Self {
        match mode {
            CliProxyMode::ClientSide => ProxyMode::ClientSide,
            CliProxyMode::ServerSide => ProxyMode::ServerSide,
        }
    }
}

/// Attaches a fixed host and password to every connection. Stands in for a
/// real credential interceptor (target discovery + cloud auth tokens) when
/// running this binary standalone; see `--target-host`/`--target-password`.
struct StaticCredentialInterceptor {
    host: String,
    password: Option<String>,
}

#[async_trait::async_trait]
impl CredentialInterceptor for StaticCredentialInterceptor {
    async fn intercept(&self, creds: &mut Credentials) -> Result<(), InterceptorError> {
        creds.host = self.host.clone();
        if let Some(password) = &self.password {
            creds.password = password.clone();
        }
        Ok(())
    }
}

fn load_cert(cert: &Option<PathBuf>, key: &Option<PathBuf>) -> anyhow::Result<Option<CertifiedKey>> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some(cert::load_certified_key(cert, key)?)),
        (None, None) => Ok(None),
        _ => anyhow::bail!("certificate and key paths must be given together"),
    }
}

fn build_config(args: &ServeArgs) -> anyhow::Result<proxy::ProxyConfig> {
    let client_ssl_mode: SslMode = args.client_ssl_mode.parse()?;

    let mut builder = ProxyConfigBuilder::new()
        .listen_addr(args.listen_addr)
        .mode(args.mode.into())
        .client_ssl_mode(client_ssl_mode)
        .idle_timeout(args.idle_timeout)
        .aws_auth_only(args.aws_auth_only);

    if let Some(server_cert) = load_cert(&args.server_cert, &args.server_key)? {
        builder = builder.server_certificate(server_cert);
    }
    if let Some(client_cert) = load_cert(&args.client_cert, &args.client_key)? {
        builder = builder.default_client_certificate(client_cert);
    }
    if let Some(host) = &args.target_host {
        builder = builder.credential_interceptor(Arc::new(StaticCredentialInterceptor {
            host: host.clone(),
            password: args.target_password.clone(),
        }));
    }

    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::GenCerts { names, out }) => {
            proxy::logging::init("info");
            let key = cert::generate_self_signed(&names)?;
            cert::write_pem_pair(&out, &key)?;
            tracing::info!(path = %out.display(), "wrote self-signed certificate and key");
            Ok(())
        }
        None => serve(cli.serve).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    proxy::logging::init(&args.log_filter);

    let config = build_config(&args)?;
    let manager = Manager::new(config);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        signal_shutdown.cancel();
    });

    manager.start(shutdown).await?;
    Ok(())
}
