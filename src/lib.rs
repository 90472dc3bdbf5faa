//! Server-side WebSocket protocol implementation (RFC 6455) with the
//! permessage-deflate extension (RFC 7692).
//!
//! The crate has two entry points, consumed in order:
//!
//! 1. [`Upgrader`] validates an inbound HTTP/1.1 request, negotiates the
//!    subprotocol and compression, and produces the `101 Switching
//!    Protocols` response together with an [`UpgradeFut`].
//! 2. The future resolves into a [`Connection`] — a framed message channel
//!    over the hijacked byte stream that handles masking, fragmentation
//!    reassembly, control frames, the close handshake, and per-message
//!    compression.
//!
//! ```no_run
//! use hyper::{body::Incoming, Request};
//! use websock::{OpCode, UpgradeOptions, Upgrader};
//!
//! async fn handle(mut request: Request<Incoming>) -> websock::HttpResponse {
//!     let upgrader = Upgrader::new(UpgradeOptions::default().with_compression());
//!
//!     let (response, fut) = match upgrader.upgrade(&mut request) {
//!         Ok(upgrade) => upgrade,
//!         Err(err) => return err.to_response(),
//!     };
//!
//!     tokio::spawn(async move {
//!         let mut conn = match fut.await {
//!             Ok(conn) => conn,
//!             Err(err) => {
//!                 log::debug!("upgrade failed: {err}");
//!                 return;
//!             }
//!         };
//!
//!         while let Ok(message) = conn.read_message().await {
//!             let _ = conn.write_message(OpCode::Text, message.payload).await;
//!         }
//!     });
//!
//!     response
//! }
//! ```
//!
//! The HTTP server that routes the request, TLS termination, and the
//! application logic on top of the message channel are all host concerns.
//! Outgoing (client) connections are out of scope; inbound frames must be
//! masked and outbound frames never are.

pub mod close;
pub mod codec;
mod compression;
pub mod connection;
pub mod frame;
mod mask;
pub mod upgrade;

use thiserror::Error;

pub use close::{CloseCode, CloseEvent};
pub use connection::{Connection, HttpConnection, Message, Writer};
pub use frame::{Frame, OpCode};
pub use upgrade::{HttpResponse, ServerStream, UpgradeError, UpgradeFut, UpgradeOptions, Upgrader};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors raised on an established WebSocket connection.
///
/// Handshake failures are reported separately through [`UpgradeError`],
/// which maps onto HTTP status codes. Once the connection is upgraded the
/// errors fall into three groups:
///
/// - Protocol violations by the peer (invalid frames, bad fragmentation,
///   reserved bits). The connection answers with a close frame carrying
///   code 1002 before surfacing the error.
/// - Payload violations (invalid UTF-8 in text messages, oversized
///   messages), answered with codes 1007 and 1009 respectively.
/// - Terminal conditions: the peer's close handshake or an I/O failure on
///   the underlying stream.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A frame carried an opcode outside the set defined by RFC 6455.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// RSV2 or RSV3 was set; no negotiated extension uses them. Also
    /// raised for RSV1 on a continuation frame — the compression bit is
    /// only valid on the first frame of a message.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// The client sent an unmasked frame. Servers must reject these
    /// (RFC 6455 section 5.1).
    #[error("received unmasked frame from client")]
    UnmaskedFrame,

    /// A control frame arrived with the FIN bit clear. Control frames
    /// must not be fragmented.
    #[error("fragmented control frame")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 bytes of payload.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// A continuation frame arrived with no message in progress, or a new
    /// data frame arrived while a fragmented message was still open.
    #[error("invalid fragment")]
    InvalidFragment,

    /// A 64-bit payload length had its most significant bit set.
    #[error("payload length out of range")]
    InvalidPayloadLength,

    /// The peer set RSV1 but permessage-deflate was not negotiated on
    /// this connection.
    #[error("received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// A text message (or a close reason) was not valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// A compressed message body was not a valid DEFLATE stream.
    #[error("corrupt deflate stream in message body")]
    InvalidCompressedData,

    /// A close frame carried a 1-byte payload or a status code outside
    /// the ranges RFC 6455 permits on the wire.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// A message exceeded the configured maximum size, either on the wire
    /// or after decompression.
    #[error("message too big")]
    MessageTooBig,

    /// The connection has completed (or aborted) the close handshake.
    /// Carries the peer's status code and reason; a peer that closed
    /// without a body is reported as [`CloseCode::NoStatus`], which never
    /// appears on the wire.
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseEvent),

    /// An error on the underlying byte stream. Always fatal; no close
    /// frame is attempted.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// The close code sent to the peer before this error is surfaced, if
    /// the error class warrants a close frame at all.
    pub(crate) fn close_code(&self) -> Option<CloseCode> {
        match self {
            WebSocketError::MessageTooBig => Some(CloseCode::Size),
            WebSocketError::InvalidUtf8 | WebSocketError::InvalidCompressedData => {
                Some(CloseCode::Invalid)
            }
            WebSocketError::InvalidOpCode(_)
            | WebSocketError::ReservedBitsNotZero
            | WebSocketError::UnmaskedFrame
            | WebSocketError::ControlFrameFragmented
            | WebSocketError::ControlFrameTooLarge
            | WebSocketError::InvalidFragment
            | WebSocketError::InvalidPayloadLength
            | WebSocketError::CompressionNotSupported
            | WebSocketError::InvalidCloseFrame => Some(CloseCode::Protocol),
            WebSocketError::ConnectionClosed(_) | WebSocketError::Io(_) => None,
        }
    }
}
