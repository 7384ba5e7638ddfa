//! In-band TLS negotiation: the `SSLRequest`/`'S'`/`'N'` dance that precedes
//! the startup message on both the client-facing and upstream-facing side of
//! the proxy, and the six SSL modes that govern it.

use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::prelude::*;

use crate::cert::CertifiedKey;
use crate::error::ProxyError;
use crate::pg::message::{GSS_ENC_REQUEST_CODE, SSL_NOT_ALLOWED, SSL_REQUEST_CODE};
use crate::pg::DynStream;

/// The SSL negotiation posture for one leg of the proxy (client-facing or
/// upstream-facing). `allow` is deliberately absent: it is rejected at
/// configuration time rather than modeled here, since it behaves identically
/// to `disable` from the proxy's point of view (it only changes what a real
/// `libpq` client does when *it* is asked to allow plaintext, which has no
/// meaning for a component that is itself the server for that negotiation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Preferred,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn requires_tls(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Whether this mode mandates a certificate be configured up front, as
    /// opposed to `preferred`, which degrades to plaintext gracefully when
    /// none is available.
    pub fn requires_certificate(self) -> bool {
        matches!(self, SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull)
    }

    /// Whether the chain should be verified unconditionally. `require` only
    /// verifies when the caller also supplied a root certificate (checked
    /// separately by the caller); see [`Self::verifies_chain_with_root`].
    pub fn verifies_chain(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }

    /// Whether this mode verifies the chain given that a root certificate
    /// was or wasn't supplied. `require` skips verification unless a root
    /// cert is present, in which case it verifies just like `verify-ca`.
    pub fn verifies_chain_with_root(self, has_root_cert: bool) -> bool {
        self.verifies_chain() || (self == SslMode::Require && has_root_cert)
    }

    pub fn verifies_hostname(self) -> bool {
        matches!(self, SslMode::VerifyFull)
    }
}

impl FromStr for SslMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "preferred" => Ok(SslMode::Preferred),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            "allow" => Err(ProxyError::Config(
                "ssl mode \"allow\" is not supported; use \"preferred\" or \"disable\"".into(),
            )),
            other => Err(ProxyError::Config(format!("unknown ssl mode {other:?}"))),
        }
    }
}

/// Sends the four-byte `SSLRequest` startup packet and reads back the
/// single-byte response, ahead of normal message framing.
async fn send_ssl_request(stream: &mut TcpStream) -> Result<u8, ProxyError> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&8i32.to_be_bytes());
    buf.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).await?;
    Ok(reply[0])
}

/// Dials the upstream over TCP and, unless `mode` is `disable`, performs the
/// `SSLRequest` handshake and wraps the connection in TLS.
pub async fn dial(
    addr: &str,
    mode: SslMode,
    server_name: &str,
    client_cert: Option<&CertifiedKey>,
    root_cert: Option<&CertificateDer<'static>>,
) -> Result<DynStream, ProxyError> {
    let mut tcp = TcpStream::connect(addr)
        .await
        .map_err(ProxyError::UpstreamDial)?;

    if mode == SslMode::Disable {
        return Ok(Box::pin(tcp) as DynStream);
    }

    let reply = send_ssl_request(&mut tcp).await.map_err(|e| match e {
        ProxyError::Io(io) => ProxyError::UpstreamDial(io),
        other => other,
    })?;

    if reply != b'S' {
        if mode == SslMode::Preferred {
            return Ok(Box::pin(tcp) as DynStream);
        }
        return Err(ProxyError::UpstreamDial(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "upstream does not support SSL",
        )));
    }

    upgrade_client(tcp, mode, server_name, client_cert, root_cert).await
}

/// Wraps a TCP connection, already past the `SSLRequest` dance, in a TLS
/// client session. Chain and hostname verification for `verify-ca` and
/// `verify-full` is performed explicitly after the handshake completes, so
/// the `rustls` verifier installed here never rejects a handshake on its
/// own — it only needs to let the handshake through so the certificates can
/// be inspected.
pub async fn upgrade_client(
    tcp: TcpStream,
    mode: SslMode,
    server_name: &str,
    client_cert: Option<&CertifiedKey>,
    root_cert: Option<&CertificateDer<'static>>,
) -> Result<DynStream, ProxyError> {
    let verifier = Arc::new(AcceptAnyServerCert);

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let config = match client_cert {
        Some(cert) => builder
            .with_client_auth_cert(cert.cert_chain.clone(), cert.private_key.clone_key())
            .map_err(|e| ProxyError::Config(format!("client certificate: {e}")))?,
        None => builder.with_no_client_auth(),
    };

    let connector = TlsConnector::from(Arc::new(config));
    let dns_name = ServerName::try_from(server_name.to_string())
        .map_err(|_| ProxyError::Config(format!("invalid server name {server_name:?}")))?;

    let tls_stream = connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| ProxyError::UpstreamDial(e))?;

    if mode.verifies_chain_with_root(root_cert.is_some()) {
        let (_, conn) = tls_stream.get_ref();
        let chain = conn
            .peer_certificates()
            .ok_or_else(|| ProxyError::Config("upstream presented no certificate".into()))?;
        verify_chain(chain, root_cert, if mode.verifies_hostname() { Some(server_name) } else { None })?;
    }

    Ok(Box::pin(tls_stream) as DynStream)
}

/// Wraps an inbound TCP connection from a client in a TLS server session
/// using the proxy's own certificate.
pub async fn upgrade_server(
    tcp: TcpStream,
    cert: &CertifiedKey,
) -> Result<DynStream, ProxyError> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert.cert_chain.clone(), cert.private_key.clone_key())
        .map_err(|e| ProxyError::Config(format!("server certificate: {e}")))?;

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let tls_stream = acceptor
        .accept(tcp)
        .await
        .map_err(|e| ProxyError::Io(e))?;

    Ok(Box::pin(tls_stream) as DynStream)
}

/// Writes the single-byte "SSL not supported" response and returns the plain
/// stream, used when the client-facing leg is configured with `disable`.
pub async fn reject_ssl_request(tcp: &mut TcpStream) -> Result<(), ProxyError> {
    tcp.write_all(&[SSL_NOT_ALLOWED]).await?;
    tcp.flush().await?;
    Ok(())
}

pub fn is_ssl_request_code(code: i32) -> bool {
    code == SSL_REQUEST_CODE
}

pub fn is_gss_request_code(code: i32) -> bool {
    code == GSS_ENC_REQUEST_CODE
}

/// Verifies a peer's certificate chain against the system trust store plus
/// an optional user-supplied root, the way `verify-ca`/`verify-full` are
/// specified: the first certificate is the subject (leaf), everything after
/// it is an intermediate, and the chain must terminate at a trusted root.
/// When `expected_host` is `Some`, the leaf's subject alternative names (or
/// common name, as a fallback) must also match it.
///
/// This performs signature-chain and validity-period checks; it does not
/// evaluate `X509v3` extensions such as basic constraints or key usage,
/// which a full RFC 5280 path validator would.
fn verify_chain(
    chain: &[CertificateDer<'_>],
    user_root: Option<&CertificateDer<'static>>,
    expected_host: Option<&str>,
) -> Result<(), ProxyError> {
    if chain.is_empty() {
        return Err(ProxyError::Config("empty certificate chain".into()));
    }

    let (_, leaf) = X509Certificate::from_der(chain[0].as_ref())
        .map_err(|e| ProxyError::Config(format!("parsing leaf certificate: {e}")))?;

    let now = ASN1Time::now();
    if !leaf.validity().is_valid_at(now) {
        return Err(ProxyError::Config("leaf certificate is not currently valid".into()));
    }

    if let Some(host) = expected_host {
        if !hostname_matches(&leaf, host) {
            return Err(ProxyError::Config(format!(
                "certificate does not match hostname {host:?}"
            )));
        }
    }

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    roots.add_parsable_certificates(native.certs);
    if let Some(extra) = user_root {
        roots
            .add(extra.clone())
            .map_err(|e| ProxyError::Config(format!("adding root certificate: {e}")))?;
    }

    let intermediates: Vec<X509Certificate<'_>> = chain[1..]
        .iter()
        .map(|der| {
            X509Certificate::from_der(der.as_ref())
                .map(|(_, cert)| cert)
                .map_err(|e| ProxyError::Config(format!("parsing intermediate certificate: {e}")))
        })
        .collect::<Result<_, _>>()?;

    // Trust anchors only carry their subject name and public key, not a full
    // certificate, so roots are represented as (name, key) pairs rather than
    // parsed `X509Certificate`s.
    let root_anchors: Vec<(X509Name<'_>, SubjectPublicKeyInfo<'_>)> = roots
        .roots
        .iter()
        .filter_map(|anchor| {
            let (_, name) = X509Name::from_der(anchor.subject.as_ref()).ok()?;
            let (_, spki) = SubjectPublicKeyInfo::from_der(anchor.subject_public_key_info.as_ref()).ok()?;
            Some((name, spki))
        })
        .collect();

    let mut current = leaf;
    let mut remaining = intermediates;
    loop {
        if let Some((_, spki)) = root_anchors
            .iter()
            .find(|(name, _)| current.issuer() == name)
        {
            if current.verify_signature(Some(spki)).is_ok() {
                return Ok(());
            }
            return Err(ProxyError::Config("certificate chain signature mismatch".into()));
        }
        let issuer_pos = remaining
            .iter()
            .position(|candidate| current.issuer() == candidate.subject());
        match issuer_pos {
            Some(pos) => {
                let issuer = remaining.remove(pos);
                if current.verify_signature(Some(issuer.public_key())).is_err() {
                    return Err(ProxyError::Config("certificate chain signature mismatch".into()));
                }
                current = issuer;
            }
            None => {
                return Err(ProxyError::Config(
                    "certificate chain does not terminate at a trusted root".into(),
                ));
            }
        }
    }
}

fn hostname_matches(cert: &X509Certificate<'_>, host: &str) -> bool {
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                if dns_name_matches(dns, host) {
                    return true;
                }
            }
        }
    }
    cert.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| dns_name_matches(cn, host))
}

fn dns_name_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host.ends_with(suffix) && host.matches('.').count() == suffix.matches('.').count() + 1
    } else {
        pattern.eq_ignore_ascii_case(host)
    }
}

/// A `rustls` verifier that accepts any server certificate. Used so the TLS
/// handshake itself never fails on certificate grounds; real verification
/// for `verify-ca`/`verify-full` happens afterward, explicitly, against the
/// trust store this proxy controls.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn rejects_allow_mode() {
        assert!(matches!(
            SslMode::from_str("allow"),
            Err(ProxyError::Config(_))
        ));
    }

    #[rstest]
    #[case("disable", SslMode::Disable)]
    #[case("preferred", SslMode::Preferred)]
    #[case("require", SslMode::Require)]
    #[case("verify-ca", SslMode::VerifyCa)]
    #[case("verify-full", SslMode::VerifyFull)]
    fn parses_known_modes(#[case] input: &str, #[case] expected: SslMode) {
        assert_eq!(SslMode::from_str(input).unwrap(), expected);
    }

    #[test]
    fn verify_full_requires_hostname_match_flag() {
        assert!(!SslMode::Require.verifies_hostname());
        assert!(SslMode::VerifyFull.verifies_hostname());
        assert!(SslMode::VerifyCa.verifies_chain());
    }

    #[test]
    fn require_mode_verifies_chain_only_when_root_cert_supplied() {
        assert!(!SslMode::Require.verifies_chain_with_root(false));
        assert!(SslMode::Require.verifies_chain_with_root(true));
        assert!(SslMode::VerifyCa.verifies_chain_with_root(false));
    }

    #[rstest]
    #[case("*.example.com", "db.example.com", true)]
    #[case("*.example.com", "db.sub.example.com", false)]
    #[case("*.example.com", "example.com", false)]
    #[case("db.example.com", "db.example.com", true)]
    #[case("db.example.com", "other.example.com", false)]
    #[case("DB.EXAMPLE.COM", "db.example.com", true)]
    fn wildcard_hostname_matching(#[case] pattern: &str, #[case] host: &str, #[case] expected: bool) {
        assert_eq!(dns_name_matches(pattern, host), expected);
    }
}
