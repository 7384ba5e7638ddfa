//! Wire types for PostgreSQL protocol version 3, and the framing rules that
//! turn them into bytes.
//!
//! Startup-class messages have no type byte (`int32 length + int32 code +
//! body`); every other message does (`byte1 type + int32 length + body`).
//! This module only decodes the subset of messages the proxy's state machine
//! needs to inspect (§4.1 of the spec); everything else round-trips through
//! `Unknown` so the relay can forward message types it has no opinion about.

use std::collections::HashMap;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const GSS_ENC_REQUEST_CODE: i32 = 80_877_104;
pub const PROTOCOL_VERSION_3: i32 = 196_608;

pub const SSL_ALLOWED: u8 = b'S';
pub const SSL_NOT_ALLOWED: u8 = b'N';

/// Largest startup packet we're willing to buffer. Postgres clients never
/// send anything close to this; it exists to bound allocation for a
/// malformed or hostile peer.
const MAX_STARTUP_LEN: i32 = 10 * 1024;

/// Largest regular message body we're willing to buffer for messages we
/// actually parse (auth/query/terminate). Everything else streams through
/// [`read_raw_message`] without this limit applying.
const MAX_PARSED_BODY_LEN: i32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub protocol_version: i32,
    pub parameters: HashMap<String, String>,
}

impl StartupMessage {
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i32(self.protocol_version);
        for (k, v) in &self.parameters {
            body.put_slice(k.as_bytes());
            body.put_u8(0);
            body.put_slice(v.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);

        let mut out = BytesMut::with_capacity(body.len() + 4);
        out.put_i32(body.len() as i32 + 4);
        out.put_slice(&body);
        out
    }
}

/// The three startup-class messages a backend codec can receive before the
/// connection has a protocol version: a real startup, an SSL upgrade
/// request, or a (refused) GSSAPI encryption request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupPacket {
    Startup(StartupMessage),
    SslRequest,
    GssEncRequest,
}

/// Reads one startup-class message: `int32 length` + `int32 code` + body.
pub async fn read_startup_packet<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> io::Result<StartupPacket> {
    let len = stream.read_i32().await?;
    if !(8..=MAX_STARTUP_LEN).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid startup message length {len}"),
        ));
    }

    let mut rest = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut rest).await?;
    let mut buf = BytesMut::from(&rest[..]);
    let code = buf.get_i32();

    match code {
        SSL_REQUEST_CODE => Ok(StartupPacket::SslRequest),
        GSS_ENC_REQUEST_CODE => Ok(StartupPacket::GssEncRequest),
        _ => {
            let parameters = parse_parameters(&mut buf)?;
            Ok(StartupPacket::Startup(StartupMessage {
                protocol_version: code,
                parameters,
            }))
        }
    }
}

fn parse_parameters(buf: &mut BytesMut) -> io::Result<HashMap<String, String>> {
    let mut parameters = HashMap::new();
    loop {
        let key = read_cstr(buf)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstr(buf)?;
        parameters.insert(key, value);
    }
    Ok(parameters)
}

fn read_cstr(buf: &mut BytesMut) -> io::Result<String> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "unterminated string"))?;
    let bytes = buf.split_to(nul);
    buf.advance(1);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// A raw, framed, typed message: `byte1 type + int32 length + body`. Used for
/// blind pass-through when the relay has no interest in the contents.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub tag: u8,
    pub body: BytesMut,
}

impl RawMessage {
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.body.len() + 5);
        out.put_u8(self.tag);
        out.put_i32(self.body.len() as i32 + 4);
        out.put_slice(&self.body);
        out
    }
}

pub async fn read_raw_message<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<RawMessage> {
    let tag = match stream.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))
        }
        Err(e) => return Err(e),
    };
    let len = stream.read_i32().await?;
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid message length {len}"),
        ));
    }
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await?;
    Ok(RawMessage {
        tag,
        body: BytesMut::from(&body[..]),
    })
}

pub async fn write_raw_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg: &RawMessage,
) -> io::Result<()> {
    stream.write_all(&msg.encode()).await
}

/// Messages the client (frontend role, from the backend's point of view)
/// sends that the proxy's state machine needs to recognize by name. Anything
/// else is `Unknown` and forwarded unparsed.
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    Query(String),
    Terminate,
    Password(String),
    Unknown(RawMessage),
}

const TAG_QUERY: u8 = b'Q';
const TAG_TERMINATE: u8 = b'X';
const TAG_PASSWORD: u8 = b'p';

impl FrontendMessage {
    pub fn from_raw(raw: RawMessage) -> io::Result<Self> {
        match raw.tag {
            TAG_QUERY if raw.body.len() <= MAX_PARSED_BODY_LEN as usize => {
                Ok(FrontendMessage::Query(cstr_from_body(&raw.body)?))
            }
            TAG_TERMINATE => Ok(FrontendMessage::Terminate),
            TAG_PASSWORD if raw.body.len() <= MAX_PARSED_BODY_LEN as usize => {
                Ok(FrontendMessage::Password(cstr_from_body(&raw.body)?))
            }
            _ => Ok(FrontendMessage::Unknown(raw)),
        }
    }

    pub fn into_raw(self) -> RawMessage {
        match self {
            FrontendMessage::Query(q) => encode_cstr_message(TAG_QUERY, &q),
            FrontendMessage::Terminate => RawMessage {
                tag: TAG_TERMINATE,
                body: BytesMut::new(),
            },
            FrontendMessage::Password(p) => encode_cstr_message(TAG_PASSWORD, &p),
            FrontendMessage::Unknown(raw) => raw,
        }
    }
}

/// Messages the server (backend role, from the frontend's point of view)
/// sends that the proxy's state machine needs to recognize by name.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    AuthenticationSasl,
    ReadyForQuery,
    ErrorResponse(ErrorResponse),
    Unknown(RawMessage),
}

const TAG_AUTH: u8 = b'R';
const TAG_READY_FOR_QUERY: u8 = b'Z';
const TAG_ERROR_RESPONSE: u8 = b'E';

const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT_PASSWORD: i32 = 3;
const AUTH_MD5_PASSWORD: i32 = 5;
const AUTH_SASL: i32 = 10;

impl BackendMessage {
    pub fn from_raw(raw: RawMessage) -> io::Result<Self> {
        match raw.tag {
            TAG_AUTH => {
                let mut body = raw.body.clone();
                if body.len() < 4 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "short authentication message",
                    ));
                }
                let code = body.get_i32();
                match code {
                    AUTH_OK => Ok(BackendMessage::AuthenticationOk),
                    AUTH_CLEARTEXT_PASSWORD => Ok(BackendMessage::AuthenticationCleartextPassword),
                    AUTH_MD5_PASSWORD => {
                        if body.len() < 4 {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "missing md5 salt",
                            ));
                        }
                        let mut salt = [0u8; 4];
                        salt.copy_from_slice(&body[..4]);
                        Ok(BackendMessage::AuthenticationMd5Password { salt })
                    }
                    AUTH_SASL => Ok(BackendMessage::AuthenticationSasl),
                    _ => Ok(BackendMessage::Unknown(raw)),
                }
            }
            TAG_READY_FOR_QUERY => Ok(BackendMessage::ReadyForQuery),
            TAG_ERROR_RESPONSE => Ok(BackendMessage::ErrorResponse(ErrorResponse::parse(
                &raw.body,
            )?)),
            _ => Ok(BackendMessage::Unknown(raw)),
        }
    }

    pub fn into_raw(self) -> RawMessage {
        match self {
            BackendMessage::AuthenticationOk => {
                let mut body = BytesMut::with_capacity(4);
                body.put_i32(AUTH_OK);
                RawMessage { tag: TAG_AUTH, body }
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let mut body = BytesMut::with_capacity(4);
                body.put_i32(AUTH_CLEARTEXT_PASSWORD);
                RawMessage { tag: TAG_AUTH, body }
            }
            BackendMessage::AuthenticationMd5Password { salt } => {
                let mut body = BytesMut::with_capacity(8);
                body.put_i32(AUTH_MD5_PASSWORD);
                body.put_slice(&salt);
                RawMessage { tag: TAG_AUTH, body }
            }
            BackendMessage::AuthenticationSasl => {
                let mut body = BytesMut::with_capacity(4);
                body.put_i32(AUTH_SASL);
                RawMessage { tag: TAG_AUTH, body }
            }
            BackendMessage::ReadyForQuery => RawMessage {
                tag: TAG_READY_FOR_QUERY,
                body: BytesMut::from(&b"I"[..]),
            },
            BackendMessage::ErrorResponse(e) => RawMessage {
                tag: TAG_ERROR_RESPONSE,
                body: e.encode_body(),
            },
            BackendMessage::Unknown(raw) => raw,
        }
    }
}

fn cstr_from_body(body: &BytesMut) -> io::Result<String> {
    let nul = body
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(body.len());
    String::from_utf8(body[..nul].to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn encode_cstr_message(tag: u8, s: &str) -> RawMessage {
    let mut body = BytesMut::with_capacity(s.len() + 1);
    body.put_slice(s.as_bytes());
    body.put_u8(0);
    RawMessage { tag, body }
}

/// An `ErrorResponse`: `severity`/`code`/`message` are pulled out for
/// logging and matching, but a response parsed off the wire also keeps its
/// exact original field bytes in `raw_body` (`Detail`/`Hint`/`Position`/
/// `File`/`Line`/`Routine`, and anything else a real server sent) so it can
/// be forwarded to the client byte-for-byte instead of being reduced to the
/// three fields this proxy actually inspects. Responses this proxy
/// originates itself (via [`Self::fatal`]) have no `raw_body` and are
/// encoded fresh from their three fields.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub severity: String,
    pub code: String,
    pub message: String,
    raw_body: Option<BytesMut>,
}

impl PartialEq for ErrorResponse {
    fn eq(&self, other: &Self) -> bool {
        self.severity == other.severity && self.code == other.code && self.message == other.message
    }
}

impl Eq for ErrorResponse {}

const FIELD_SEVERITY: u8 = b'S';
const FIELD_CODE: u8 = b'C';
const FIELD_MESSAGE: u8 = b'M';

impl ErrorResponse {
    pub fn fatal(message: impl Into<String>) -> Self {
        ErrorResponse {
            severity: "FATAL".to_string(),
            code: "08006".to_string(),
            message: message.into(),
            raw_body: None,
        }
    }

    /// Encodes this response's body. When it was parsed off the wire, the
    /// original bytes are echoed back unchanged (so the client sees the
    /// upstream's `Detail`/`Hint`/`Position`/... fields too); otherwise the
    /// body is built fresh from `severity`/`code`/`message`.
    fn encode_body(&self) -> BytesMut {
        if let Some(raw) = &self.raw_body {
            return raw.clone();
        }

        let mut body = BytesMut::new();
        body.put_u8(FIELD_SEVERITY);
        body.put_slice(self.severity.as_bytes());
        body.put_u8(0);
        body.put_u8(FIELD_CODE);
        body.put_slice(self.code.as_bytes());
        body.put_u8(0);
        body.put_u8(FIELD_MESSAGE);
        body.put_slice(self.message.as_bytes());
        body.put_u8(0);
        body.put_u8(0);
        body
    }

    fn parse(body: &BytesMut) -> io::Result<Self> {
        let mut severity = String::new();
        let mut code = String::new();
        let mut message = String::new();

        let mut rest = body.clone();
        loop {
            if rest.is_empty() {
                break;
            }
            let field = rest.get_u8();
            if field == 0 {
                break;
            }
            let value = read_cstr(&mut rest)?;
            match field {
                FIELD_SEVERITY => severity = value,
                FIELD_CODE => code = value,
                FIELD_MESSAGE => message = value,
                _ => {}
            }
        }

        Ok(ErrorResponse {
            severity,
            code,
            message,
            raw_body: Some(body.clone()),
        })
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_startup_message() {
        let mut params = HashMap::new();
        params.insert("user".to_string(), "alice".to_string());
        params.insert("database".to_string(), "app".to_string());
        let msg = StartupMessage {
            protocol_version: PROTOCOL_VERSION_3,
            parameters: params.clone(),
        };
        let mut encoded = std::io::Cursor::new(msg.encode().to_vec());
        let decoded = read_startup_packet(&mut encoded).await.unwrap();
        match decoded {
            StartupPacket::Startup(got) => {
                assert_eq!(got.protocol_version, PROTOCOL_VERSION_3);
                assert_eq!(got.parameters, params);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn recognizes_ssl_request() {
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        assert_eq!(
            read_startup_packet(&mut cursor).await.unwrap(),
            StartupPacket::SslRequest
        );
    }

    #[tokio::test]
    async fn recognizes_gss_request() {
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_i32(GSS_ENC_REQUEST_CODE);
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        assert_eq!(
            read_startup_packet(&mut cursor).await.unwrap(),
            StartupPacket::GssEncRequest
        );
    }

    #[test]
    fn error_response_round_trips() {
        let err = ErrorResponse::fatal("host not allowed");
        let raw = BackendMessage::ErrorResponse(err.clone()).into_raw();
        let parsed = ErrorResponse::parse(&raw.body).unwrap();
        assert_eq!(parsed, err);
    }

    /// A real server's `ErrorResponse` carries fields this proxy never
    /// inspects (`Detail`, `Hint`, `Position`, ...); forwarding it to the
    /// client must not drop them, even though `ErrorResponse` only surfaces
    /// `severity`/`code`/`message` as named fields.
    #[test]
    fn error_response_forwards_unmodeled_fields_verbatim() {
        let mut body = BytesMut::new();
        body.put_u8(b'S');
        body.put_slice(b"FATAL\0");
        body.put_u8(b'C');
        body.put_slice(b"28000\0");
        body.put_u8(b'M');
        body.put_slice(b"password authentication failed\0");
        body.put_u8(b'D');
        body.put_slice(b"connection matched rule \"deny all\"\0");
        body.put_u8(b'H');
        body.put_slice(b"check pg_hba.conf\0");
        body.put_u8(0);

        let parsed = ErrorResponse::parse(&body).unwrap();
        assert_eq!(parsed.message, "password authentication failed");

        let forwarded = BackendMessage::ErrorResponse(parsed).into_raw();
        assert_eq!(forwarded.body, body);
    }

    #[test]
    fn md5_auth_round_trips_salt() {
        let salt = [1u8, 2, 3, 4];
        let raw = BackendMessage::AuthenticationMd5Password { salt }.into_raw();
        match BackendMessage::from_raw(raw).unwrap() {
            BackendMessage::AuthenticationMd5Password { salt: got } => assert_eq!(got, salt),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn frontend_query_round_trips() {
        let raw = FrontendMessage::Query("select 1".into()).into_raw();
        match FrontendMessage::from_raw(raw).unwrap() {
            FrontendMessage::Query(q) => assert_eq!(q, "select 1"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
