//! The established WebSocket connection: a bidirectional framed message
//! channel over the hijacked byte stream.
//!
//! The read side is single-reader: [`Connection::read_message`] owns the
//! read buffer and the reassembly state, runs a plain loop over decoded
//! frames, answers pings, and hands completed messages (reassembled and
//! inflated) to the caller. The write side is multi-writer: every frame
//! goes through one `tokio::sync::Mutex`, so the reader can inject a
//! Pong or a close echo between application frames and the bytes of two
//! frames never interleave on the wire. Cloneable [`Writer`] handles let
//! other tasks send while the reader task blocks in `read_message`.
//!
//! Cancellation safety: dropping a `read_message` future is harmless
//! (partial input stays buffered), but dropping a write future mid-frame
//! leaves an unfinishable frame on the wire. The writer detects this and
//! treats the connection as closed from then on.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use futures::StreamExt;
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Encoder as _, FramedRead};

use crate::{
    close::{CloseCode, CloseEvent},
    codec::{Decoder, Encoder},
    compression::{Compressor, Decompressor},
    frame::{Frame, OpCode},
    upgrade::{Negotiation, ServerStream},
    Result, WebSocketError,
};

/// Default capacity of the read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default capacity of the write buffer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

/// Default cap on message size, on the wire and after decompression.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// The connection type produced by [`crate::UpgradeFut`].
pub type HttpConnection = Connection<ServerStream>;

/// A complete application message: text or binary payload, reassembled
/// from its fragments and decompressed if the peer compressed it.
#[derive(Debug, Clone)]
pub struct Message {
    /// [`OpCode::Text`] or [`OpCode::Binary`].
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Message {
    /// The payload as text. Text messages are UTF-8 validated on
    /// receive, so this only returns `None` for binary messages with
    /// non-UTF-8 content.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Close handshake progress (RFC 6455 section 7).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Open,
    /// We sent a close frame and are waiting for the peer's.
    ClosingLocal,
    /// The peer's close frame arrived; we owe the echo.
    ClosingRemote,
    Closed,
}

struct WriterInner<S> {
    io: io::WriteHalf<S>,
    deflate: Option<Compressor>,
    buf: BytesMut,
    state: State,
    close_event: Option<CloseEvent>,
    /// Set while frame bytes are in flight. Still set on re-entry means
    /// the previous write future was dropped mid-frame, which poisons
    /// the stream.
    mid_write: bool,
}

impl<S: AsyncWrite> WriterInner<S> {
    /// Marks the connection closed when a cancelled write is detected,
    /// then requires the open state.
    fn ensure_open(&mut self) -> Result<()> {
        if self.mid_write {
            self.state = State::Closed;
        }
        if self.state != State::Open {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> WebSocketError {
        let event = self
            .close_event
            .clone()
            .unwrap_or_else(|| CloseEvent::new(CloseCode::NoStatus, String::new()));
        WebSocketError::ConnectionClosed(event)
    }

    /// Encodes and writes one frame as a single logical send: header and
    /// payload leave through the same locked section.
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        Encoder.encode(frame, &mut self.buf)?;

        self.mid_write = true;
        let res = write_buf(&mut self.io, &self.buf).await;
        self.buf.clear();

        match res {
            Ok(()) => {
                self.mid_write = false;
                Ok(())
            }
            Err(err) => {
                self.state = State::Closed;
                self.mid_write = false;
                Err(err.into())
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

async fn write_buf<S: AsyncWrite>(io: &mut io::WriteHalf<S>, buf: &[u8]) -> io::Result<()> {
    io.write_all(buf).await?;
    io.flush().await
}

/// Cloneable handle for sending frames on a connection.
///
/// Any number of tasks may hold a `Writer`; frames are serialised
/// through the shared mutex and appear on the wire whole, in lock
/// acquisition order. Obtain one with [`Connection::writer`].
pub struct Writer<S> {
    shared: Arc<Mutex<WriterInner<S>>>,
}

impl<S> Clone for Writer<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: AsyncWrite> Writer<S> {
    /// Sends a single-frame message (FIN=1, unmasked).
    ///
    /// Text and binary payloads are deflated when permessage-deflate was
    /// negotiated, with RSV1 set on the frame. Ping and Pong are sent
    /// as-is and must fit in 125 bytes. Close frames go through
    /// [`Writer::close`] so the handshake state stays consistent;
    /// continuation frames cannot be sent (outbound messages are never
    /// fragmented).
    pub async fn write_message(&self, opcode: OpCode, payload: impl AsRef<[u8]>) -> Result<()> {
        let payload = payload.as_ref();

        if matches!(opcode, OpCode::Close | OpCode::Continuation) {
            return Err(WebSocketError::InvalidOpCode(u8::from(opcode)));
        }
        if opcode.is_control() && payload.len() > 125 {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        let mut inner = self.shared.lock().await;
        inner.ensure_open()?;

        let frame = if !opcode.is_control() {
            if let Some(deflate) = inner.deflate.as_mut() {
                let output = deflate.compress(payload)?;
                Frame::compressed(opcode, output)
            } else {
                Frame::new(true, opcode, payload)
            }
        } else {
            Frame::new(true, opcode, payload)
        };

        inner.send_frame(frame).await
    }

    /// Starts the close handshake: sends a close frame carrying
    /// `code ++ reason` and refuses further application writes. The
    /// connection fully closes when the peer's close frame arrives at
    /// the reader.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        if 2 + reason.len() > 125 {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        let mut inner = self.shared.lock().await;
        inner.ensure_open()?;

        log::debug!("closing connection (code {code})");
        inner.state = State::ClosingLocal;
        inner.close_event = Some(CloseEvent::new(code, reason.to_owned()));
        inner.send_frame(Frame::close(code, reason.as_bytes())).await
    }

    /// Answers a ping. Dropped silently once the close handshake has
    /// started.
    async fn send_pong(&self, payload: BytesMut) -> Result<()> {
        let mut inner = self.shared.lock().await;
        if inner.mid_write {
            inner.state = State::Closed;
        }
        if inner.state != State::Open {
            return Ok(());
        }
        inner.send_frame(Frame::pong(payload)).await
    }

    /// Completes the close handshake after the peer's close frame: sends
    /// the echo if we had not closed already, then shuts the stream
    /// down. The echo carries the peer's code, or 1000 when the peer's
    /// frame had no body — 1005 never goes on the wire.
    async fn finish_remote_close(&self, event: &CloseEvent) {
        let mut inner = self.shared.lock().await;
        if inner.mid_write {
            inner.state = State::Closed;
        }

        if inner.state == State::Open {
            inner.state = State::ClosingRemote;
            let code = if event.code == CloseCode::NoStatus {
                CloseCode::Normal
            } else {
                event.code
            };
            let _ = inner.send_frame(Frame::close(code, b"")).await;
        }

        inner.state = State::Closed;
        inner.close_event.get_or_insert_with(|| event.clone());
        inner.shutdown().await;
    }

    /// Best-effort close frame for a protocol violation, then shutdown.
    async fn fail_close(&self, code: CloseCode, reason: &str) {
        let mut inner = self.shared.lock().await;
        if !inner.mid_write && matches!(inner.state, State::Open | State::ClosingLocal) {
            let _ = inner.send_frame(Frame::close(code, reason.as_bytes())).await;
        }
        inner.state = State::Closed;
        inner
            .close_event
            .get_or_insert_with(|| CloseEvent::new(code, reason.to_owned()));
        inner.shutdown().await;
    }

    /// Marks the connection dead without attempting a close frame (I/O
    /// failures, abrupt stream end).
    async fn abort(&self) {
        let mut inner = self.shared.lock().await;
        inner.state = State::Closed;
        inner.shutdown().await;
    }
}

/// In-progress fragmented message: the opcode and compression flag are
/// latched from the first frame.
struct Fragment {
    opcode: OpCode,
    is_compressed: bool,
}

/// An established server-side WebSocket connection.
///
/// Created by awaiting [`crate::UpgradeFut`]. `read_message` must be
/// driven from a single task; writes may come from any number of tasks
/// through [`Connection::writer`] handles.
pub struct Connection<S> {
    reader: FramedRead<io::ReadHalf<S>, Decoder>,
    writer: Writer<S>,
    inflate: Option<Decompressor>,
    fragment: Option<Fragment>,
    accumulated: BytesMut,
    max_message_size: usize,
    subprotocol: Option<String>,
    /// Terminal state of the read side; set once, then every call
    /// returns `ConnectionClosed`.
    closed: Option<CloseEvent>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, negotiation: Negotiation) -> Self {
        let (read_half, write_half) = io::split(stream);

        let reader = FramedRead::with_capacity(
            read_half,
            Decoder::new(negotiation.max_message_size),
            negotiation.read_buffer_size,
        );

        let writer = Writer {
            shared: Arc::new(Mutex::new(WriterInner {
                io: write_half,
                deflate: negotiation
                    .compression
                    .then(|| Compressor::new(Compression::best())),
                buf: BytesMut::with_capacity(negotiation.write_buffer_size),
                state: State::Open,
                close_event: None,
                mid_write: false,
            })),
        };

        Self {
            reader,
            writer,
            inflate: negotiation.compression.then(Decompressor::new),
            fragment: None,
            accumulated: BytesMut::with_capacity(1024),
            max_message_size: negotiation.max_message_size,
            subprotocol: negotiation.subprotocol,
            closed: None,
        }
    }

    /// The subprotocol selected during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// A cloneable handle for sending from other tasks.
    pub fn writer(&self) -> Writer<S> {
        self.writer.clone()
    }

    /// See [`Writer::write_message`].
    pub async fn write_message(&self, opcode: OpCode, payload: impl AsRef<[u8]>) -> Result<()> {
        self.writer.write_message(opcode, payload).await
    }

    /// See [`Writer::close`].
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.writer.close(code, reason).await
    }

    /// Reads the next complete application message.
    ///
    /// Control frames arriving between data frames are handled
    /// transparently: pings are answered immediately, pongs discarded,
    /// and a close frame completes the handshake and surfaces as
    /// [`WebSocketError::ConnectionClosed`]. Protocol violations close
    /// the connection with the matching status code before the error is
    /// returned; after that, every call returns `ConnectionClosed`.
    pub async fn read_message(&mut self) -> Result<Message> {
        if let Some(event) = &self.closed {
            return Err(WebSocketError::ConnectionClosed(event.clone()));
        }

        loop {
            let frame = match self.reader.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return self.fail(err).await,
                None => {
                    // stream ended without a close frame
                    let event = CloseEvent::new(CloseCode::Abnormal, String::new());
                    self.writer.abort().await;
                    self.closed = Some(event.clone());
                    return Err(WebSocketError::ConnectionClosed(event));
                }
            };

            // RSV1 belongs to data frames only; a compressed control
            // frame is a protocol violation.
            if frame.is_compressed && frame.opcode.is_control() {
                return self.fail(WebSocketError::ReservedBitsNotZero).await;
            }

            match frame.opcode {
                OpCode::Ping => {
                    log::trace!("ping received ({} bytes)", frame.payload.len());
                    if let Err(err) = self.writer.send_pong(frame.payload).await {
                        self.closed = Some(CloseEvent::new(CloseCode::Abnormal, String::new()));
                        return Err(err);
                    }
                }
                OpCode::Pong => {
                    log::trace!("pong received ({} bytes)", frame.payload.len());
                }
                OpCode::Close => return self.on_close(frame).await,
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.is_some() {
                        return self.fail(WebSocketError::InvalidFragment).await;
                    }
                    if frame.is_compressed && self.inflate.is_none() {
                        return self.fail(WebSocketError::CompressionNotSupported).await;
                    }

                    if frame.fin {
                        let (opcode, compressed) = (frame.opcode, frame.is_compressed);
                        return match self.finish_message(opcode, frame.payload, compressed) {
                            Ok(message) => Ok(message),
                            Err(err) => self.fail(err).await,
                        };
                    }

                    self.fragment = Some(Fragment {
                        opcode: frame.opcode,
                        is_compressed: frame.is_compressed,
                    });
                    self.accumulated.extend_from_slice(&frame.payload);
                }
                OpCode::Continuation => {
                    // RSV1 is only valid on the first frame of a message
                    if frame.is_compressed {
                        return self.fail(WebSocketError::ReservedBitsNotZero).await;
                    }
                    if self.fragment.is_none() {
                        return self.fail(WebSocketError::InvalidFragment).await;
                    }
                    if self.accumulated.len() + frame.payload.len() > self.max_message_size {
                        return self.fail(WebSocketError::MessageTooBig).await;
                    }

                    self.accumulated.extend_from_slice(&frame.payload);

                    if frame.fin {
                        let fragment = self.fragment.take().expect("fragment in progress");
                        // swap the accumulator out so the next message
                        // starts from a small buffer
                        let payload = std::mem::replace(
                            &mut self.accumulated,
                            BytesMut::with_capacity(1024),
                        );
                        return match self.finish_message(
                            fragment.opcode,
                            payload,
                            fragment.is_compressed,
                        ) {
                            Ok(message) => Ok(message),
                            Err(err) => self.fail(err).await,
                        };
                    }
                }
            }
        }
    }

    /// Finalises an assembled message body: inflate if the first frame
    /// carried RSV1, then validate UTF-8 for text.
    fn finish_message(
        &mut self,
        opcode: OpCode,
        payload: BytesMut,
        compressed: bool,
    ) -> Result<Message> {
        let payload = if compressed {
            let inflate = self.inflate.as_mut().expect("compression negotiated");
            inflate.decompress(&payload, self.max_message_size)?
        } else {
            payload
        };

        if opcode == OpCode::Text && std::str::from_utf8(&payload).is_err() {
            return Err(WebSocketError::InvalidUtf8);
        }

        Ok(Message {
            opcode,
            payload: payload.freeze(),
        })
    }

    /// Handles the peer's close frame: validate the body, send the echo
    /// if we owe one, shut down, and surface the event.
    async fn on_close(&mut self, frame: Frame) -> Result<Message> {
        let event = match frame.payload.len() {
            0 => CloseEvent::new(CloseCode::NoStatus, String::new()),
            1 => return self.fail(WebSocketError::InvalidCloseFrame).await,
            _ => {
                let code = frame.close_code().expect("close frame body length checked");
                if !code.is_allowed() {
                    return self.fail(WebSocketError::InvalidCloseFrame).await;
                }
                let reason = match frame.close_reason() {
                    Ok(reason) => reason.unwrap_or_default().to_owned(),
                    Err(err) => return self.fail(err).await,
                };
                CloseEvent::new(code, reason)
            }
        };

        log::debug!("close frame received ({event})");
        self.writer.finish_remote_close(&event).await;
        self.closed = Some(event.clone());
        Err(WebSocketError::ConnectionClosed(event))
    }

    /// Terminates the connection over a read-path error. Violations that
    /// map to a close code get a best-effort close frame (1002, 1007,
    /// 1009); I/O failures do not — the stream is already broken.
    async fn fail(&mut self, err: WebSocketError) -> Result<Message> {
        match err.close_code() {
            Some(code) => {
                let reason = err.to_string();
                self.writer.fail_close(code, &reason).await;
                self.closed = Some(CloseEvent::new(code, reason));
            }
            None => {
                self.writer.abort().await;
                self.closed = Some(CloseEvent::new(CloseCode::Abnormal, String::new()));
            }
        }

        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::apply_mask;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn negotiation(compression: bool, max_message_size: usize) -> Negotiation {
        Negotiation {
            compression,
            subprotocol: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_message_size,
        }
    }

    fn server(compression: bool) -> (Connection<DuplexStream>, DuplexStream) {
        server_with_limit(compression, DEFAULT_MAX_MESSAGE_SIZE)
    }

    fn server_with_limit(
        compression: bool,
        max_message_size: usize,
    ) -> (Connection<DuplexStream>, DuplexStream) {
        let (client, stream) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(stream, negotiation(compression, max_message_size)),
            client,
        )
    }

    /// Builds a masked client frame. `byte0` carries FIN/RSV/opcode.
    fn client_frame(byte0: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![byte0];

        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else if len < 65536 {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        out.extend_from_slice(&MASK);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, MASK);
        out.extend_from_slice(&masked);
        out
    }

    fn client_close_frame(code: u16, reason: &[u8]) -> Vec<u8> {
        let mut body = code.to_be_bytes().to_vec();
        body.extend_from_slice(reason);
        client_frame(0x88, &body)
    }

    /// Reads one unmasked server frame off the client end of the pipe.
    async fn read_server_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.expect("frame header");
        assert_eq!(head[1] & 0x80, 0, "server frames must not be masked");

        let len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                client.read_exact(&mut ext).await.expect("extended length");
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                client.read_exact(&mut ext).await.expect("extended length");
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };

        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.expect("payload");
        (head[0], payload)
    }

    #[tokio::test]
    async fn test_text_echo() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x81, b"test")).await.unwrap();

        let message = conn.read_message().await.expect("read message");
        assert_eq!(message.opcode, OpCode::Text);
        assert_eq!(&message.payload[..], b"test");

        conn.write_message(OpCode::Text, "test").await.expect("write");

        // Exact wire bytes: FIN | Text, unmasked, 4-byte length.
        let mut wire = [0u8; 6];
        client.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, &[0x81, 0x04, b't', b'e', b's', b't']);
    }

    #[tokio::test]
    async fn test_fragmented_text_reassembly() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x01, b"te")).await.unwrap();
        client.write_all(&client_frame(0x80, b"st")).await.unwrap();

        let message = conn.read_message().await.expect("read message");
        assert_eq!(message.opcode, OpCode::Text);
        assert_eq!(&message.payload[..], b"test");
    }

    #[tokio::test]
    async fn test_multi_fragment_binary() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x02, b"ab")).await.unwrap();
        for _ in 0..3 {
            client.write_all(&client_frame(0x00, b"cd")).await.unwrap();
        }
        client.write_all(&client_frame(0x80, b"ef")).await.unwrap();

        let message = conn.read_message().await.expect("read message");
        assert_eq!(message.opcode, OpCode::Binary);
        assert_eq!(&message.payload[..], b"abcdcdcdef");
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x89, b"peepo")).await.unwrap();
        client.write_all(&client_frame(0x81, b"x")).await.unwrap();

        let message = conn.read_message().await.expect("read message");
        assert_eq!(&message.payload[..], b"x");

        // The pong is the server's next wire output, byte for byte.
        let mut wire = [0u8; 7];
        client.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, &[0x8A, 0x05, b'p', b'e', b'e', b'p', b'o']);
    }

    #[tokio::test]
    async fn test_ping_between_fragments() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x01, b"te")).await.unwrap();
        client.write_all(&client_frame(0x89, b"live?")).await.unwrap();
        client.write_all(&client_frame(0x80, b"st")).await.unwrap();

        // The interleaved ping does not corrupt reassembly.
        let message = conn.read_message().await.expect("read message");
        assert_eq!(&message.payload[..], b"test");

        let (head, payload) = read_server_frame(&mut client).await;
        assert_eq!(head, 0x8A);
        assert_eq!(&payload[..], b"live?");
    }

    #[tokio::test]
    async fn test_pong_discarded() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x8A, b"late")).await.unwrap();
        client.write_all(&client_frame(0x81, b"data")).await.unwrap();

        let message = conn.read_message().await.expect("read message");
        assert_eq!(&message.payload[..], b"data");
    }

    #[tokio::test]
    async fn test_unmasked_frame_closes_with_1002() {
        let (mut conn, mut client) = server(false);

        client
            .write_all(&[0x81, 0x04, b't', b'e', b's', b't'])
            .await
            .unwrap();

        let err = conn.read_message().await.unwrap_err();
        assert!(matches!(err, WebSocketError::UnmaskedFrame));

        let (head, payload) = read_server_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);

        // The reader is terminal from here on.
        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_close_is_echoed() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_close_frame(1000, b"bye")).await.unwrap();

        let err = conn.read_message().await.unwrap_err();
        match err {
            WebSocketError::ConnectionClosed(event) => {
                assert_eq!(event.code, CloseCode::Normal);
                assert_eq!(event.reason, "bye");
            }
            other => panic!("unexpected error: {other}"),
        }

        // The echo carries the peer's code and no reason.
        let (head, payload) = read_server_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..], &1000u16.to_be_bytes());

        // Writes are refused after the handshake completes.
        assert!(matches!(
            conn.write_message(OpCode::Text, "nope").await,
            Err(WebSocketError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_bodiless_close_answered_with_1000() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x88, b"")).await.unwrap();

        let err = conn.read_message().await.unwrap_err();
        match err {
            WebSocketError::ConnectionClosed(event) => {
                // 1005 is the API-level sentinel for "no code received".
                assert_eq!(event.code, CloseCode::NoStatus);
                assert!(event.reason.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        // On the wire the answer is 1000, never 1005.
        let (head, payload) = read_server_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..], &1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_one_byte_close_body_is_protocol_error() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x88, &[0x03])).await.unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::InvalidCloseFrame)
        ));

        let (_, payload) = read_server_frame(&mut client).await;
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);
    }

    #[tokio::test]
    async fn test_local_close_handshake() {
        let (mut conn, mut client) = server(false);

        conn.close(CloseCode::Normal, "done").await.expect("close");

        let (head, payload) = read_server_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"done");

        // Application writes are refused while the handshake is pending.
        assert!(matches!(
            conn.write_message(OpCode::Text, "nope").await,
            Err(WebSocketError::ConnectionClosed(_))
        ));

        // The peer's responding close frame completes the handshake
        // without a second echo from us.
        client.write_all(&client_close_frame(1000, b"")).await.unwrap();

        let err = conn.read_message().await.unwrap_err();
        assert!(matches!(err, WebSocketError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let (mut conn, mut client) = server(true);

        let text = b"compression keeps repeating, repeating, repeating";

        // Deflate on the client side, then mask and set RSV1.
        let mut deflate = Compressor::new(Compression::best());
        let compressed = deflate.compress(text).expect("client compress");
        client
            .write_all(&client_frame(0xC1, &compressed))
            .await
            .unwrap();

        let message = conn.read_message().await.expect("read message");
        assert_eq!(message.opcode, OpCode::Text);
        assert_eq!(&message.payload[..], text);

        // And back: the server compresses its own frames.
        conn.write_message(OpCode::Text, &message.payload)
            .await
            .expect("write");

        let (head, payload) = read_server_frame(&mut client).await;
        assert_eq!(head, 0xC1); // FIN | RSV1 | Text

        let mut inflate = Decompressor::new();
        let inflated = inflate.decompress(&payload, usize::MAX).expect("inflate");
        assert_eq!(&inflated[..], text);
    }

    #[tokio::test]
    async fn test_compressed_fragmented_message() {
        let (mut conn, mut client) = server(true);

        let text = b"fragmented and deflated";
        let mut deflate = Compressor::new(Compression::best());
        let compressed = deflate.compress(text).expect("client compress");

        // RSV1 on the first frame only; the body splits across frames.
        let (first, rest) = compressed.split_at(compressed.len() / 2);
        client.write_all(&client_frame(0x41, first)).await.unwrap();
        client.write_all(&client_frame(0x80, rest)).await.unwrap();

        let message = conn.read_message().await.expect("read message");
        assert_eq!(&message.payload[..], text);
    }

    #[tokio::test]
    async fn test_rsv1_without_negotiation() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0xC1, b"x")).await.unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::CompressionNotSupported)
        ));

        let (_, payload) = read_server_frame(&mut client).await;
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);
    }

    #[tokio::test]
    async fn test_rsv1_on_continuation_frame() {
        let (mut conn, mut client) = server(true);

        client.write_all(&client_frame(0x41, b"ab")).await.unwrap();
        client.write_all(&client_frame(0xC0, b"cd")).await.unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::ReservedBitsNotZero)
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_with_1007() {
        let (mut conn, mut client) = server(false);

        client
            .write_all(&client_frame(0x81, &[0xFF, 0xFE, 0xFD]))
            .await
            .unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::InvalidUtf8)
        ));

        let (_, payload) = read_server_frame(&mut client).await;
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1007);
    }

    #[tokio::test]
    async fn test_oversized_message_closes_with_1009() {
        let (mut conn, mut client) = server_with_limit(false, 16);

        client
            .write_all(&client_frame(0x82, &[0u8; 17]))
            .await
            .unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::MessageTooBig)
        ));

        let (_, payload) = read_server_frame(&mut client).await;
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1009);
    }

    #[tokio::test]
    async fn test_oversized_fragmented_message() {
        let (mut conn, mut client) = server_with_limit(false, 16);

        client.write_all(&client_frame(0x02, &[0u8; 10])).await.unwrap();
        client.write_all(&client_frame(0x00, &[0u8; 10])).await.unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::MessageTooBig)
        ));
    }

    #[tokio::test]
    async fn test_continuation_without_start() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x80, b"x")).await.unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::InvalidFragment)
        ));
    }

    #[tokio::test]
    async fn test_new_data_frame_mid_fragment() {
        let (mut conn, mut client) = server(false);

        client.write_all(&client_frame(0x01, b"a")).await.unwrap();
        client.write_all(&client_frame(0x81, b"b")).await.unwrap();

        assert!(matches!(
            conn.read_message().await,
            Err(WebSocketError::InvalidFragment)
        ));
    }

    #[tokio::test]
    async fn test_peer_disconnect_without_close() {
        let (mut conn, client) = server(false);
        drop(client);

        let err = conn.read_message().await.unwrap_err();
        match err {
            WebSocketError::ConnectionClosed(event) => {
                assert_eq!(event.code, CloseCode::Abnormal)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let (conn, mut client) = server(false);

        let writer_a = conn.writer();
        let writer_b = conn.writer();

        let task_a = tokio::spawn(async move {
            for _ in 0..20 {
                writer_a.write_message(OpCode::Text, "aaaa").await.unwrap();
            }
        });
        let task_b = tokio::spawn(async move {
            for _ in 0..20 {
                writer_b.write_message(OpCode::Text, "bbbb").await.unwrap();
            }
        });

        // Every frame must arrive whole regardless of the interleaving.
        let mut counts = (0, 0);
        for _ in 0..40 {
            let (head, payload) = read_server_frame(&mut client).await;
            assert_eq!(head, 0x81);
            match &payload[..] {
                b"aaaa" => counts.0 += 1,
                b"bbbb" => counts.1 += 1,
                other => panic!("corrupted frame payload: {other:?}"),
            }
        }
        assert_eq!(counts, (20, 20));

        task_a.await.unwrap();
        task_b.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_rejects_close_and_continuation() {
        let (conn, _client) = server(false);

        assert!(matches!(
            conn.write_message(OpCode::Close, "").await,
            Err(WebSocketError::InvalidOpCode(0x8))
        ));
        assert!(matches!(
            conn.write_message(OpCode::Continuation, "").await,
            Err(WebSocketError::InvalidOpCode(0x0))
        ));
    }

    #[tokio::test]
    async fn test_oversized_control_write_rejected() {
        let (conn, _client) = server(false);

        assert!(matches!(
            conn.write_message(OpCode::Ping, vec![0u8; 126]).await,
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_extended_length_wire_format() {
        let (conn, mut client) = server(false);

        conn.write_message(OpCode::Binary, vec![0x42u8; 300])
            .await
            .expect("write");

        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        // Opcode byte intact, 16-bit length at offset 2.
        assert_eq!(head[0], 0x82);
        assert_eq!(head[1], 126);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), 300);

        let mut payload = vec![0u8; 300];
        client.read_exact(&mut payload).await.unwrap();
        assert!(payload.iter().all(|&b| b == 0x42));
    }
}
