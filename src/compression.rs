//! permessage-deflate support (RFC 7692).
//!
//! Outbound messages are run through a raw DEFLATE stream and the
//! trailing `00 00 FF FF` left by a sync flush is stripped (section
//! 7.2.1). Inbound message bodies get the trailer appended back before
//! inflation (section 7.2.2). Both directions keep their LZ77 context
//! across messages — no context takeover is signalled during
//! negotiation, so the RFC default of shared context applies.
//!
//! flate2's raw `Compress`/`Decompress` types write into caller-provided
//! slices, so both wrappers grow their output buffer in zeroed scratch
//! blocks and trim back to the bytes each step actually produced.

use std::io;

use bytes::BytesMut;
use flate2::{Compression, Status};

use nom::{
    bytes::complete::take_while1, character::complete::space0, sequence::preceded, IResult,
};

use crate::WebSocketError;

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// The sync-flush trailer shared by both directions (RFC 7692 sections
/// 7.2.1 and 7.2.2).
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Scratch block appended to the output buffer ahead of each flate2
/// step. One block fits most frames outright.
const SCRATCH_SIZE: usize = 4096;

/// Parses the extension name that leads a single offer, e.g.
/// `permessage-deflate; client_max_window_bits`. Parameters after the
/// name are accepted but not negotiated in this implementation.
fn extension_name(input: &str) -> IResult<&str, &str> {
    preceded(
        space0,
        take_while1(|c: char| c.is_alphanumeric() || c == '-' || c == '_'),
    )(input)
}

/// Whether a `Sec-WebSocket-Extensions` header value contains a
/// permessage-deflate offer.
pub(crate) fn offers_permessage_deflate(header: &str) -> bool {
    header.split(',').any(|offer| {
        matches!(
            extension_name(offer),
            Ok((_, name)) if name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE)
        )
    })
}

fn deflate_error(kind: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("corrupt {kind} stream"))
}

/// Deflate compressor for outbound message payloads.
///
/// The LZ77 dictionary carries over from one message to the next.
pub(crate) struct Compressor {
    output: BytesMut,
    compress: flate2::Compress,
}

impl Compressor {
    pub(crate) fn new(level: Compression) -> Self {
        Self {
            output: BytesMut::new(),
            compress: flate2::Compress::new(level, false),
        }
    }

    /// Compresses a whole message payload and strips the sync-flush
    /// trailer.
    pub(crate) fn compress(&mut self, mut input: &[u8]) -> io::Result<BytesMut> {
        while !input.is_empty() {
            let consumed = self.write(input)?;
            input = &input[consumed..];
        }
        self.flush()
    }

    /// Feeds one round of input through the compressor. Returns how many
    /// input bytes were taken.
    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        let start = self.output.len();
        self.output.resize(start + SCRATCH_SIZE, 0);

        let before_out = self.compress.total_out();
        let before_in = self.compress.total_in();

        let status =
            self.compress
                .compress(input, &mut self.output[start..], flate2::FlushCompress::None);

        let written = (self.compress.total_out() - before_out) as usize;
        let consumed = (self.compress.total_in() - before_in) as usize;
        self.output.truncate(start + written);

        match status {
            // A step may spend its whole scratch block draining pending
            // output without taking input; only zero progress on both
            // sides means the stream is stuck.
            Ok(Status::Ok) if consumed > 0 || written > 0 => Ok(consumed),
            _ => Err(deflate_error("deflate")),
        }
    }

    /// Sync-flushes the stream, drains whatever the compressor still
    /// holds, and hands the message over without the trailer.
    fn flush(&mut self) -> io::Result<BytesMut> {
        let mut mode = flate2::FlushCompress::Sync;
        loop {
            let start = self.output.len();
            self.output.resize(start + SCRATCH_SIZE, 0);

            let before_out = self.compress.total_out();
            self.compress
                .compress(&[], &mut self.output[start..], mode)
                .map_err(|_| deflate_error("deflate"))?;

            let written = (self.compress.total_out() - before_out) as usize;
            self.output.truncate(start + written);

            if written == 0 {
                break;
            }
            mode = flate2::FlushCompress::None;
        }

        if self.output.ends_with(&DEFLATE_TRAILER) {
            self.output.truncate(self.output.len() - DEFLATE_TRAILER.len());
        }

        Ok(self.output.split())
    }
}

/// Inflater for inbound message bodies.
///
/// Output is capped by the connection's message size limit so a small
/// compressed frame cannot expand without bound.
pub(crate) struct Decompressor {
    output: BytesMut,
    decompress: flate2::Decompress,
}

impl Decompressor {
    pub(crate) fn new() -> Self {
        Self {
            output: BytesMut::new(),
            decompress: flate2::Decompress::new(false),
        }
    }

    /// Inflates a complete message body, appending the RFC 7692 trailer
    /// first. Fails with [`WebSocketError::MessageTooBig`] when the
    /// output exceeds `max_size`.
    pub(crate) fn decompress(&mut self, input: &[u8], max_size: usize) -> crate::Result<BytesMut> {
        self.write(input, max_size)?;
        self.write(&DEFLATE_TRAILER, max_size)?;
        self.flush(max_size)
    }

    fn write(&mut self, mut input: &[u8], max_size: usize) -> crate::Result<()> {
        while !input.is_empty() {
            let start = self.output.len();
            self.output.resize(start + SCRATCH_SIZE, 0);

            let before_out = self.decompress.total_out();
            let before_in = self.decompress.total_in();

            let status = self.decompress.decompress(
                input,
                &mut self.output[start..],
                flate2::FlushDecompress::None,
            );

            let written = (self.decompress.total_out() - before_out) as usize;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            self.output.truncate(start + written);

            input = &input[consumed..];

            if self.output.len() > max_size {
                return Err(WebSocketError::MessageTooBig);
            }

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(..) => return Err(WebSocketError::InvalidCompressedData),
            }

            // scratch space was available, so zero progress means the
            // stream is stuck rather than starved
            if consumed == 0 && written == 0 {
                return Err(WebSocketError::InvalidCompressedData);
            }
        }

        Ok(())
    }

    fn flush(&mut self, max_size: usize) -> crate::Result<BytesMut> {
        let mut mode = flate2::FlushDecompress::Sync;
        loop {
            let start = self.output.len();
            self.output.resize(start + SCRATCH_SIZE, 0);

            let before_out = self.decompress.total_out();
            self.decompress
                .decompress(&[], &mut self.output[start..], mode)
                .map_err(|_| WebSocketError::InvalidCompressedData)?;

            let written = (self.decompress.total_out() - before_out) as usize;
            self.output.truncate(start + written);

            if self.output.len() > max_size {
                return Err(WebSocketError::MessageTooBig);
            }

            if written == 0 {
                break;
            }
            mode = flate2::FlushDecompress::None;
        }

        Ok(self.output.split())
    }
}
