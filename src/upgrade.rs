//! HTTP-to-WebSocket upgrade handshake (RFC 6455 section 4).
//!
//! [`Upgrader`] validates the opening handshake of an inbound request,
//! negotiates the subprotocol and permessage-deflate, and produces the
//! `101 Switching Protocols` response together with an [`UpgradeFut`].
//! The future resolves once hyper has surrendered the underlying byte
//! stream, yielding a live [`Connection`].
//!
//! hyper's model is response-driven: the handler returns the 101 (or the
//! error response from [`UpgradeError::to_response`]) and hyper performs
//! the protocol switch after sending it. The hijacker is the
//! [`hyper::upgrade::OnUpgrade`] extension carried by the request.

use std::{
    future::Future,
    io,
    pin::{pin, Pin},
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use http::HeaderMap;
use http_body_util::Empty;
use hyper::{
    header,
    upgrade::{OnUpgrade, Upgraded},
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    compression::offers_permessage_deflate,
    connection::{
        Connection, HttpConnection, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_BUFFER_SIZE,
        DEFAULT_WRITE_BUFFER_SIZE,
    },
};

/// The HTTP responses produced during the handshake. Upgrade responses
/// never carry a body.
pub type HttpResponse = Response<Empty<Bytes>>;

/// Origin predicate: receives the `Origin` header value, or `None` when
/// the header is absent.
type OriginPredicate = Box<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Configuration for a single [`Upgrader`].
pub struct UpgradeOptions {
    origin_check: Option<OriginPredicate>,
    subprotocols: Vec<String>,
    compress: bool,
    read_buffer_size: usize,
    write_buffer_size: usize,
    max_message_size: usize,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            origin_check: None,
            subprotocols: Vec::new(),
            compress: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl UpgradeOptions {
    /// Rejects handshakes whose `Origin` header fails the predicate.
    /// Without a predicate any origin is accepted.
    pub fn with_origin_check(
        mut self,
        check: impl Fn(Option<&str>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.origin_check = Some(Box::new(check));
        self
    }

    /// Subprotocols the server supports, in order of preference.
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Enables permessage-deflate negotiation.
    pub fn with_compression(mut self) -> Self {
        self.compress = true;
        self
    }

    /// Initial capacity of the read buffer.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Initial capacity of the write buffer.
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Maximum accepted message size, on the wire and after
    /// decompression. Larger messages close the connection with
    /// code 1009.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

/// Errors raised while validating or completing the opening handshake.
///
/// Each variant maps onto an HTTP status code; [`UpgradeError::to_response`]
/// builds the error response the handler should return.
#[derive(Error, Debug)]
pub enum UpgradeError {
    /// The handshake was not a GET request.
    #[error("handshake must be a GET request")]
    MethodNotAllowed,

    /// The `Connection` header is missing the `Upgrade` token.
    #[error("'Connection' header does not contain 'Upgrade'")]
    InvalidConnectionHeader,

    /// The `Upgrade` header is missing the `websocket` token.
    #[error("'Upgrade' header does not contain 'websocket'")]
    InvalidUpgradeHeader,

    /// `Sec-WebSocket-Version` was absent or not `13`. The error
    /// response advertises the supported version.
    #[error("Sec-WebSocket-Version must be 13")]
    UnsupportedVersion,

    /// The `Sec-WebSocket-Key` header is missing.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingKey,

    /// The `Sec-WebSocket-Key` header is not the base64 encoding of a
    /// 16-byte value.
    #[error("Sec-WebSocket-Key must be a base64-encoded 16-byte value")]
    InvalidKey,

    /// The configured origin predicate rejected the request.
    #[error("client origin rejected")]
    OriginRejected,

    /// The HTTP layer did not expose a connection hijacker for this
    /// request.
    #[error("connection is not hijackable")]
    NotHijackable,

    /// The client sent bytes before receiving the 101 response, which
    /// RFC 6455 section 4.1 forbids.
    #[error("client sent data before the handshake completed")]
    ClientDataBeforeHandshake,

    /// The protocol switch itself failed in the HTTP layer.
    #[error(transparent)]
    Http(#[from] hyper::Error),
}

impl UpgradeError {
    /// The HTTP status this handshake failure answers with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UpgradeError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            UpgradeError::InvalidConnectionHeader
            | UpgradeError::InvalidUpgradeHeader
            | UpgradeError::MissingKey
            | UpgradeError::InvalidKey
            | UpgradeError::ClientDataBeforeHandshake => StatusCode::BAD_REQUEST,
            UpgradeError::UnsupportedVersion => StatusCode::UPGRADE_REQUIRED,
            UpgradeError::OriginRejected => StatusCode::FORBIDDEN,
            UpgradeError::NotHijackable | UpgradeError::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Builds the HTTP error response for this failure. A version
    /// mismatch advertises `Sec-WebSocket-Version: 13` as required by
    /// RFC 6455 section 4.2.2.
    pub fn to_response(&self) -> HttpResponse {
        let mut builder = Response::builder().status(self.status_code());
        if matches!(self, UpgradeError::UnsupportedVersion) {
            builder = builder.header(header::SEC_WEBSOCKET_VERSION, "13");
        }

        builder
            .body(Empty::new())
            .expect("bug: failed to build error response")
    }
}

/// Parameters negotiated during the handshake, handed to the connection.
#[derive(Debug)]
pub(crate) struct Negotiation {
    pub(crate) compression: bool,
    pub(crate) subprotocol: Option<String>,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
    pub(crate) max_message_size: usize,
}

/// Validates opening handshakes and produces upgraded connections.
///
/// One `Upgrader` is typically built at startup and shared across
/// requests.
pub struct Upgrader {
    options: UpgradeOptions,
}

impl Upgrader {
    pub fn new(options: UpgradeOptions) -> Self {
        Self { options }
    }

    /// Validates the handshake and prepares the protocol switch.
    ///
    /// On success returns the `101 Switching Protocols` response — which
    /// the handler must send back — and the future resolving into the
    /// [`Connection`] once the switch completes. On failure the request
    /// is answered with [`UpgradeError::to_response`] instead; nothing
    /// beyond that HTTP response reaches the wire.
    pub fn upgrade<B>(
        &self,
        request: &mut Request<B>,
    ) -> Result<(HttpResponse, UpgradeFut), UpgradeError> {
        let (response, negotiation) = self.handshake(request)?;

        let on_upgrade = request
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(UpgradeError::NotHijackable)?;

        Ok((
            response,
            UpgradeFut {
                inner: on_upgrade,
                negotiation: Some(negotiation),
            },
        ))
    }

    /// Header validation and response construction, in the order
    /// mandated by RFC 6455 section 4.2.1: the first failed check
    /// decides the status code.
    fn handshake<B>(
        &self,
        request: &Request<B>,
    ) -> Result<(HttpResponse, Negotiation), UpgradeError> {
        if request.method() != Method::GET {
            return Err(UpgradeError::MethodNotAllowed);
        }

        let headers = request.headers();

        if !header_contains_token(headers, header::CONNECTION, "upgrade") {
            return Err(UpgradeError::InvalidConnectionHeader);
        }

        if !header_contains_token(headers, header::UPGRADE, "websocket") {
            return Err(UpgradeError::InvalidUpgradeHeader);
        }

        if headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(|v| v.as_bytes())
            != Some(b"13")
        {
            return Err(UpgradeError::UnsupportedVersion);
        }

        let key = headers
            .get(header::SEC_WEBSOCKET_KEY)
            .ok_or(UpgradeError::MissingKey)?;

        use base64::prelude::*;
        if BASE64_STANDARD.decode(key.as_bytes()).map(|k| k.len()) != Ok(16) {
            return Err(UpgradeError::InvalidKey);
        }

        if let Some(check) = &self.options.origin_check {
            let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
            if !check(origin) {
                return Err(UpgradeError::OriginRejected);
            }
        }

        let subprotocol = self.resolve_subprotocol(headers);

        let compression = self.options.compress
            && headers
                .get(header::SEC_WEBSOCKET_EXTENSIONS)
                .and_then(|h| h.to_str().ok())
                .map(offers_permessage_deflate)
                .unwrap_or(false);

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(key.as_bytes()));

        if let Some(subprotocol) = &subprotocol {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, subprotocol.as_str());
        }
        if compression {
            builder = builder.header(header::SEC_WEBSOCKET_EXTENSIONS, "permessage-deflate");
        }

        let response = builder
            .body(Empty::new())
            .expect("bug: failed to build response");

        log::debug!(
            "accepting websocket handshake (subprotocol={subprotocol:?} compression={compression})"
        );

        Ok((
            response,
            Negotiation {
                compression,
                subprotocol,
                read_buffer_size: self.options.read_buffer_size,
                write_buffer_size: self.options.write_buffer_size,
                max_message_size: self.options.max_message_size,
            },
        ))
    }

    /// Picks the first subprotocol the client offered that the server
    /// also supports. No match (or no header) means no subprotocol is
    /// echoed.
    fn resolve_subprotocol(&self, headers: &HeaderMap) -> Option<String> {
        let offered = headers.get(header::SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;

        offered
            .split(',')
            .map(str::trim)
            .find(|candidate| self.options.subprotocols.iter().any(|p| p == candidate))
            .map(str::to_owned)
    }
}

/// Comma-separated, case-insensitive token match, as HTTP list-valued
/// headers require (`Connection: keep-alive, Upgrade` must pass).
fn header_contains_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// Derives the `Sec-WebSocket-Accept` value from the raw key bytes:
/// `base64(SHA1(key ++ GUID))` over the literal header value.
fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11"); // magic string
    BASE64_STANDARD.encode(sha1.finalize())
}

/// The byte stream recovered from the HTTP layer after the switch.
///
/// When the transport can be downcast back to a plain TCP stream the
/// connection runs directly on it; otherwise it runs through the
/// upgraded handle hyper returned.
pub enum ServerStream {
    Tcp(TcpStream),
    Hyper(TokioIo<Upgraded>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => pin!(stream).poll_read(cx, buf),
            Self::Hyper(stream) => pin!(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => pin!(stream).poll_write(cx, buf),
            Self::Hyper(stream) => pin!(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => pin!(stream).poll_flush(cx),
            Self::Hyper(stream) => pin!(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => pin!(stream).poll_shutdown(cx),
            Self::Hyper(stream) => pin!(stream).poll_shutdown(cx),
        }
    }
}

/// Future completing the protocol switch on the server side.
///
/// The 101 response must be sent before this future can resolve. It
/// yields the connection, or fails when the switch breaks down or the
/// client jumped the gun with early data.
#[derive(Debug)]
pub struct UpgradeFut {
    inner: OnUpgrade,
    negotiation: Option<Negotiation>,
}

impl Future for UpgradeFut {
    type Output = Result<HttpConnection, UpgradeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let upgraded = ready!(Pin::new(&mut this.inner).poll(cx))?;
        let negotiation = this.negotiation.take().expect("polled after completion");

        let stream = match upgraded.downcast::<TokioIo<TcpStream>>() {
            Ok(parts) => {
                // RFC 6455 section 4.1: the client must not send data
                // before it has received the 101 response.
                if !parts.read_buf.is_empty() {
                    return Poll::Ready(Err(UpgradeError::ClientDataBeforeHandshake));
                }
                ServerStream::Tcp(parts.io.into_inner())
            }
            Err(upgraded) => ServerStream::Hyper(TokioIo::new(upgraded)),
        };

        Poll::Ready(Ok(Connection::new(stream, negotiation)))
    }
}
