//! Payload masking (RFC 6455 section 5.3).
//!
//! Clients mask every frame with a 4-byte XOR key; the server applies the
//! same transform to unmask. The operation is its own inverse.

/// Mask/unmask a payload in place.
///
/// The key repeats every 4 bytes, so doubling it to 64 bits lets the
/// bulk of the buffer go through one XOR per 8-byte chunk. Chunks are
/// counted from the start of the slice, which keeps the key phase at
/// zero for both the word loop and the scalar tail — no realignment or
/// key rotation is ever needed.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let mut doubled = [0u8; 8];
    doubled[..4].copy_from_slice(&mask);
    doubled[4..].copy_from_slice(&mask);
    let key = u64::from_ne_bytes(doubled);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in chunks.by_ref() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ key).to_ne_bytes());
    }

    for (byte, key) in chunks.into_remainder().iter_mut().zip(doubled) {
        *byte ^= key;
    }
}
