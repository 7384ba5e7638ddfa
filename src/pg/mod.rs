//! The PostgreSQL wire protocol layer: message framing, the backend-role and
//! frontend-role codecs built on top of it, and in-band TLS negotiation.

pub mod backend;
pub mod frontend;
pub mod message;
pub mod ssl;

use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

/// Blanket-implemented for anything that can stand in for a client or
/// upstream connection, whether that's a raw `TcpStream` or a `TlsStream`
/// wrapping one. Lets the rest of the proxy stop caring whether a given
/// session ever upgraded to TLS.
pub trait AsyncRW: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncRW for T {}

/// A connection that may or may not be wrapped in TLS, boxed so both cases
/// share one type.
pub type DynStream = Pin<Box<dyn AsyncRW>>;
