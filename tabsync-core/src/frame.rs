//! Frame compression and incremental frame decoding.
//!
//! Wire layout of a data frame:
//!
//! ```text
//! ┌──────────────────┬────────────────────────────────────────┐
//! │ len: u32 (BE)    │ lz4 block (u32 LE raw size + data)     │
//! └──────────────────┴────────────────────────────────────────┘
//! ```
//!
//! A heartbeat is the literal 4 bytes `ping` in the position where a length
//! prefix is expected. Read as a big-endian length it would be ~1.8 GB, far
//! above [`MAX_FRAME_BYTES`], so the two can never be confused.

use crate::error::ProtocolError;

/// Idle keepalive marker.
pub const HEARTBEAT: [u8; 4] = *b"ping";

/// Size of the length prefix.
pub const PREFIX_LEN: usize = 4;

/// Maximum compressed frame size accepted from a peer (64 MiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Maximum decompressed payload size accepted from a peer (256 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024 * 1024;

/// A decoded unit from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Liveness marker, carries nothing.
    Heartbeat,
    /// Decompressed record bytes.
    Data(Vec<u8>),
}

/// Compress a payload and prefix it with its compressed length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let block = lz4_flex::compress_prepend_size(payload);
    let mut frame = Vec::with_capacity(PREFIX_LEN + block.len());
    frame.extend_from_slice(&(block.len() as u32).to_be_bytes());
    frame.extend_from_slice(&block);
    frame
}

/// Decompress one lz4 block produced by [`encode_frame`].
pub fn decompress_block(block: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if block.len() < 4 {
        return Err(ProtocolError::Decompression(format!(
            "block too short: {} bytes",
            block.len()
        )));
    }
    let raw_size = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if raw_size > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::Decompression(format!(
            "declared payload {} exceeds {}",
            raw_size, MAX_PAYLOAD_BYTES
        )));
    }
    lz4_flex::decompress_size_prepended(block)
        .map_err(|e| ProtocolError::Decompression(e.to_string()))
}

/// Accumulates socket reads and yields whole frames.
///
/// Both the prefix and the payload may arrive split across any number of
/// reads; nothing is decompressed until the full block is buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder primed with bytes already read from the stream.
    pub fn with_buffered(bytes: Vec<u8>) -> Self {
        Self { buf: bytes }
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting to be decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes waiting to be decoded.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Discard `n` leading bytes that were consumed outside the decoder.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Decode the next frame if it is complete.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let prefix = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        if prefix == HEARTBEAT {
            self.buf.drain(..PREFIX_LEN);
            return Ok(Some(Frame::Heartbeat));
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                limit: MAX_FRAME_BYTES,
            });
        }
        if self.buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }

        let payload = decompress_block(&self.buf[PREFIX_LEN..PREFIX_LEN + len])?;
        self.buf.drain(..PREFIX_LEN + len);
        Ok(Some(Frame::Data(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        (0..4096u32).flat_map(|i| (i % 97).to_le_bytes()).collect()
    }

    #[test]
    fn frame_prefix_is_big_endian_compressed_length() {
        let frame = encode_frame(&sample_payload());
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - PREFIX_LEN);
    }

    #[test]
    fn decoder_yields_payload() {
        let payload = sample_payload();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_frame(&payload));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Data(payload)));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_tolerates_byte_at_a_time_delivery() {
        let payload = sample_payload();
        let frame = encode_frame(&payload);
        let mut decoder = FrameDecoder::new();

        for (i, byte) in frame.iter().enumerate() {
            assert_eq!(decoder.next_frame().unwrap(), None, "early frame at byte {i}");
            decoder.feed(std::slice::from_ref(byte));
        }
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Data(payload)));
    }

    #[test]
    fn heartbeat_is_recognized_between_frames() {
        let mut bytes = HEARTBEAT.to_vec();
        bytes.extend_from_slice(&encode_frame(b"abc"));
        bytes.extend_from_slice(&HEARTBEAT);

        let mut decoder = FrameDecoder::with_buffered(bytes);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Heartbeat));
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::Data(b"abc".to_vec()))
        );
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Heartbeat));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn empty_payload_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_frame(&[]));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Data(Vec::new())));
    }

    #[test]
    fn oversized_length_is_a_framing_error() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn corrupt_block_is_a_decompression_error() {
        // Raw size 10, then a match token whose offset points before the
        // start of the output.
        let block = [10u8, 0, 0, 0, 0x0f, 0x01, 0x00, 0x00];
        let mut frame = (block.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&block);
        let mut decoder = FrameDecoder::with_buffered(frame);
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::Decompression(_))
        ));
    }

    #[test]
    fn declared_size_above_ceiling_is_refused_before_allocating() {
        let mut block = ((MAX_PAYLOAD_BYTES as u32) + 1).to_le_bytes().to_vec();
        block.push(0);
        assert!(matches!(
            decompress_block(&block),
            Err(ProtocolError::Decompression(_))
        ));
    }
}
