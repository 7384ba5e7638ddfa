//! The client-facing side of a session: negotiating the client's `SSLRequest`
//! and reading its `StartupMessage`, then exchanging typed messages with it
//! for the lifetime of the connection.

use std::time::Duration;

use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::cert::CertifiedKey;
use crate::error::{is_retryable_io, ProxyError};
use crate::pg::message::{
    read_raw_message, read_startup_packet, write_raw_message, FrontendMessage, StartupMessage,
    StartupPacket,
};
use crate::pg::ssl;
use crate::pg::DynStream;

/// Repeatedly reads startup-class packets off a freshly accepted TCP
/// connection until a real `StartupMessage` arrives, handling `SSLRequest`
/// (and rejecting `GSSEncRequest`, which this proxy never supports) along
/// the way. Returns the negotiated stream — plain or TLS-wrapped — together
/// with the client's startup parameters.
pub async fn negotiate_client_tls(
    mut tcp: TcpStream,
    cert: Option<&CertifiedKey>,
) -> Result<(DynStream, StartupMessage), ProxyError> {
    loop {
        match read_startup_packet(&mut tcp).await? {
            StartupPacket::SslRequest => {
                if cert.is_none() {
                    ssl::reject_ssl_request(&mut tcp).await?;
                    continue;
                }
                tcp.write_all(b"S").await?;
                tcp.flush().await?;
                let cert = cert.expect("checked above");
                let tls_stream = ssl::upgrade_server(tcp, cert).await?;
                return negotiate_over(tls_stream).await;
            }
            StartupPacket::GssEncRequest => {
                tcp.write_all(b"N").await?;
                tcp.flush().await?;
                continue;
            }
            StartupPacket::Startup(startup) => {
                return Ok((Box::pin(tcp) as DynStream, startup));
            }
        }
    }
}

/// Continues the startup negotiation on an already-TLS-wrapped stream. A
/// client is not expected to send a second `SSLRequest` once TLS is
/// established, but the loop still tolerates a repeated `GSSEncRequest`.
async fn negotiate_over(mut stream: DynStream) -> Result<(DynStream, StartupMessage), ProxyError> {
    loop {
        match read_startup_packet(&mut stream).await? {
            StartupPacket::SslRequest => {
                return Err(ProxyError::Config(
                    "client sent SSLRequest over an already-encrypted connection".into(),
                ));
            }
            StartupPacket::GssEncRequest => {
                stream.write_all(b"N").await?;
                stream.flush().await?;
                continue;
            }
            StartupPacket::Startup(startup) => return Ok((stream, startup)),
        }
    }
}

/// The client-facing codec: typed message exchange with bounded-retry idle
/// timeouts, once the startup handshake above has completed.
pub struct Backend {
    reader: Mutex<ReadHalf<DynStream>>,
    writer: Mutex<WriteHalf<DynStream>>,
    idle_timeout: Duration,
}

impl Backend {
    pub fn new(stream: DynStream, idle_timeout: Duration) -> Self {
        let (reader, writer) = split(stream);
        Backend {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            idle_timeout,
        }
    }

    /// Reads one typed message from the client, retrying on idle timeouts up
    /// to the bound computed from a five-minute ceiling, and treating a
    /// clean EOF as [`ProxyError::ConnectionClosed`].
    pub async fn receive(&self) -> Result<FrontendMessage, ProxyError> {
        let max_retries = max_idle_retries(self.idle_timeout);
        let mut reader = self.reader.lock().await;
        for attempt in 0..=max_retries {
            match tokio::time::timeout(self.idle_timeout, read_raw_message(&mut *reader)).await {
                Ok(Ok(raw)) => return FrontendMessage::from_raw(raw),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(ProxyError::ConnectionClosed)
                }
                Ok(Err(e)) if is_retryable_io(&e) && attempt < max_retries => continue,
                Ok(Err(e)) => return Err(ProxyError::Io(e)),
                Err(_elapsed) if attempt < max_retries => continue,
                Err(_elapsed) => return Err(ProxyError::IdleTimeout),
            }
        }
        Err(ProxyError::IdleTimeout)
    }

    pub async fn send(&self, msg: crate::pg::message::BackendMessage) -> Result<(), ProxyError> {
        let raw = msg.into_raw();
        let mut writer = self.writer.lock().await;
        write_raw_message(&mut *writer, &raw).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// The number of consecutive idle timeouts tolerated before a read gives up
/// for good, chosen so the effective ceiling is about five minutes
/// regardless of the configured per-read idle timeout.
pub fn max_idle_retries(idle_timeout: Duration) -> u32 {
    const CEILING: Duration = Duration::from_secs(5 * 60);
    if idle_timeout.is_zero() {
        return 0;
    }
    let ceiling_millis = CEILING.as_millis().max(1);
    let idle_millis = idle_timeout.as_millis().max(1);
    ((ceiling_millis + idle_millis - 1) / idle_millis) as u32
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(30, 10)]
    #[case(60, 5)]
    #[case(400, 1)]
    fn max_idle_retries_bounds_total_wait_near_five_minutes(
        #[case] idle_secs: u64,
        #[case] expected_retries: u32,
    ) {
        assert_eq!(
            max_idle_retries(Duration::from_secs(idle_secs)),
            expected_retries
        );
    }
}
