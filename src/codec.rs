//! Frame-level codec for the server side of a connection.
//!
//! [`Decoder`] parses client frames out of the read buffer, enforcing the
//! decode-time rules of RFC 6455 (masking required, reserved bits clear,
//! control frame constraints, sane lengths) and unmasking payloads in
//! place. [`Encoder`] serialises server frames, which are never masked.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    mask::apply_mask,
    WebSocketError,
};

/// Decoding progress across calls.
enum ReadState {
    /// The fixed 2 bytes are parsed; waiting for the extended length and
    /// masking key.
    Header(Header),
    /// The full header is parsed; waiting for the payload.
    Payload(HeaderAndMask),
}

struct Header {
    fin: bool,
    /// Compression flag (RSV1).
    rsv1: bool,
    opcode: OpCode,
    /// Length of the extended payload length field (0, 2 or 8).
    extra: usize,
    /// The 7-bit length code from the second header byte.
    length_code: u8,
    /// Remaining header bytes: extended length plus the 4-byte key.
    header_size: usize,
}

struct HeaderAndMask {
    header: Header,
    mask: [u8; 4],
    payload_len: usize,
}

/// Streaming decoder for client frames.
///
/// Frames larger than `max_frame_size` are rejected before their payload
/// is buffered, bounding memory per connection.
pub struct Decoder {
    state: Option<ReadState>,
    max_frame_size: usize,
}

impl Decoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: None,
            max_frame_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;

                    if src[0] & 0b0011_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;

                    // Clients must mask every frame (RFC 6455 section 5.1).
                    if src[1] & 0b1000_0000 == 0 {
                        return Err(WebSocketError::UnmaskedFrame);
                    }

                    let length_code = src[1] & 0x7F;
                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };

                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        opcode,
                        extra,
                        length_code,
                        header_size: extra + 4,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => {
                            let length = src.get_u64();
                            if length & (1 << 63) != 0 {
                                return Err(WebSocketError::InvalidPayloadLength);
                            }
                            match usize::try_from(length) {
                                Ok(length) => length,
                                Err(_) => return Err(WebSocketError::MessageTooBig),
                            }
                        }
                        _ => unreachable!(),
                    };

                    let mask = src.get_u32().to_be_bytes();

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > 125 {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }
                    if payload_len > self.max_frame_size {
                        return Err(WebSocketError::MessageTooBig);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let mut payload = src.split_to(header_and_mask.payload_len);
                    apply_mask(&mut payload, header_and_mask.mask);

                    let mut frame = Frame::new(header.fin, header.opcode, payload);
                    frame.is_compressed = header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Serialises server frames: header then payload, no masking key.
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    /// Builds a masked client frame by hand.
    fn client_frame(byte0: u8, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        out.extend_from_slice(&[byte0]);

        let len = payload.len();
        if len < 126 {
            out.extend_from_slice(&[0x80 | len as u8]);
        } else if len < 65536 {
            out.extend_from_slice(&[0x80 | 126]);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.extend_from_slice(&[0x80 | 127]);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        out.extend_from_slice(&MASK);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, MASK);
        out.extend_from_slice(&masked);
        out
    }

    fn decoder() -> Decoder {
        Decoder::new(1024 * 1024)
    }

    #[test]
    fn test_decode_text_frame() {
        let mut src = client_frame(0x81, b"test");

        let frame = decoder().decode(&mut src).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(!frame.is_compressed);
        assert_eq!(&frame.payload[..], b"test");
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_incremental() {
        let full = client_frame(0x82, b"abcdef");
        let mut decoder = decoder();
        let mut src = BytesMut::new();

        // Feed one byte at a time; the frame completes only at the end.
        for (i, byte) in full.iter().enumerate() {
            src.extend_from_slice(&[*byte]);
            let result = decoder.decode(&mut src).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none(), "frame completed early at byte {i}");
            } else {
                let frame = result.unwrap();
                assert_eq!(frame.opcode, OpCode::Binary);
                assert_eq!(&frame.payload[..], b"abcdef");
            }
        }
    }

    #[test]
    fn test_decode_extended_16bit_length() {
        let payload = vec![0xABu8; 300];
        let mut src = client_frame(0x82, &payload);

        let frame = decoder().decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn test_decode_extended_64bit_length() {
        let payload = vec![0x5Au8; 70000];
        let mut src = client_frame(0x82, &payload);

        let frame = decoder().decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70000);
    }

    #[test]
    fn test_unmasked_frame_rejected() {
        // FIN | Text, MASK=0, length 4
        let mut src = BytesMut::from(&[0x81u8, 0x04, b't', b'e', b's', b't'][..]);

        assert!(matches!(
            decoder().decode(&mut src),
            Err(WebSocketError::UnmaskedFrame)
        ));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        for byte0 in [0xA1u8, 0x91] {
            // RSV2 / RSV3 set
            let mut src = client_frame(byte0, b"x");
            assert!(matches!(
                decoder().decode(&mut src),
                Err(WebSocketError::ReservedBitsNotZero)
            ));
        }
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut src = client_frame(0x83, b"");
        assert!(matches!(
            decoder().decode(&mut src),
            Err(WebSocketError::InvalidOpCode(0x3))
        ));
    }

    #[test]
    fn test_fragmented_control_frame_rejected() {
        // Ping with FIN=0
        let mut src = client_frame(0x09, b"ping");
        assert!(matches!(
            decoder().decode(&mut src),
            Err(WebSocketError::ControlFrameFragmented)
        ));
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        let mut src = client_frame(0x89, &[0u8; 126]);
        assert!(matches!(
            decoder().decode(&mut src),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
    }

    #[test]
    fn test_length_msb_rejected() {
        let mut src = BytesMut::new();
        src.extend_from_slice(&[0x82, 0x80 | 127]);
        src.extend_from_slice(&(1u64 << 63).to_be_bytes());
        src.extend_from_slice(&MASK);

        assert!(matches!(
            decoder().decode(&mut src),
            Err(WebSocketError::InvalidPayloadLength)
        ));
    }

    #[test]
    fn test_frame_over_limit_rejected() {
        let mut decoder = Decoder::new(16);
        let mut src = client_frame(0x82, &[0u8; 17]);

        assert!(matches!(
            decoder.decode(&mut src),
            Err(WebSocketError::MessageTooBig)
        ));
    }

    #[test]
    fn test_encode_text_frame() {
        let mut dst = BytesMut::new();
        Encoder
            .encode(Frame::new(true, OpCode::Text, &b"test"[..]), &mut dst)
            .unwrap();

        assert_eq!(&dst[..], &[0x81, 0x04, b't', b'e', b's', b't']);
    }

    #[test]
    fn test_encode_extended_length_offset() {
        let mut dst = BytesMut::new();
        Encoder
            .encode(
                Frame::new(true, OpCode::Binary, BytesMut::zeroed(300)),
                &mut dst,
            )
            .unwrap();

        // The marker byte survives and the extended length sits at offset 2.
        assert_eq!(dst[0], 0x82);
        assert_eq!(dst[1], 126);
        assert_eq!(u16::from_be_bytes([dst[2], dst[3]]), 300);
        assert_eq!(dst.len(), 4 + 300);
    }

    #[test]
    fn test_encode_decode_inverse() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let mut dst = BytesMut::new();
            Encoder
                .encode(
                    Frame::new(true, OpCode::Binary, BytesMut::zeroed(len)),
                    &mut dst,
                )
                .unwrap();

            let expected_head = if len <= 125 {
                2
            } else if len <= 65535 {
                4
            } else {
                10
            };
            assert_eq!(dst.len(), expected_head + len);

            // Re-mask the encoded frame as a client would and decode it.
            let (head, payload) = dst.split_at(expected_head);
            let mut src = BytesMut::new();
            src.extend_from_slice(&[head[0], head[1] | 0x80]);
            src.extend_from_slice(&head[2..]);
            src.extend_from_slice(&MASK);
            let mut masked = payload.to_vec();
            apply_mask(&mut masked, MASK);
            src.extend_from_slice(&masked);

            let frame = Decoder::new(usize::MAX)
                .decode(&mut src)
                .unwrap()
                .unwrap();
            assert_eq!(frame.payload.len(), len);
        }
    }
}
