//! Length-prefixed stream framing for transports without inherent message
//! boundaries.
//!
//! The wire format is the Meshtastic stream header: `0x94 0xC3` followed by
//! a big-endian u16 payload length, then the serialized envelope. The serial
//! transport declares `requires_framing` and exposes only raw bytes; this
//! layer sits above it.

const START1: u8 = 0x94;
const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;

/// Maximum envelope size the device will ever emit.
pub const MAX_FRAME_LEN: usize = 512;

/// Wrap one complete envelope for writing to a framed byte stream.
pub fn encode(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + frame.len());
    out.push(START1);
    out.push(START2);
    out.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    out.extend_from_slice(frame);
    out
}

/// Incremental decoder accumulating arbitrary read chunks into complete
/// frames.
///
/// Resynchronizes on garbage (debug text, partial writes after a reset) by
/// scanning forward for the start marker; a length field above
/// [`MAX_FRAME_LEN`] is treated as corruption and skipped the same way.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes, returning every complete frame it closes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            // Drop everything before a plausible header.
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(idx) => {
                    self.buf.drain(..idx);
                }
                None => {
                    self.buf.clear();
                    break;
                }
            }

            if self.buf.len() < HEADER_LEN {
                break;
            }

            if self.buf[1] != START2 {
                self.buf.drain(..1);
                continue;
            }

            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if len > MAX_FRAME_LEN {
                // Corrupt length; skip the false start marker and resync.
                self.buf.drain(..1);
                continue;
            }

            if self.buf.len() < HEADER_LEN + len {
                break;
            }

            let frame = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.drain(..HEADER_LEN + len);
            frames.push(frame);
        }

        frames
    }

    /// Bytes currently buffered waiting for the rest of a frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_single_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&encode(b"hello mesh"));
        assert_eq!(frames, vec![b"hello mesh".to_vec()]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let wire = encode(&[7u8; 100]);
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&wire[..1]).is_empty());
        assert!(decoder.push(&wire[1..50]).is_empty());
        let frames = decoder.push(&wire[50..]);
        assert_eq!(frames, vec![vec![7u8; 100]]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut wire = encode(b"one");
        wire.extend_from_slice(&encode(b"two"));
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&wire);
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut wire = b"boot: radio v2.3\r\n".to_vec();
        wire.extend_from_slice(&encode(b"payload"));
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&wire);
        assert_eq!(frames, vec![b"payload".to_vec()]);
    }

    #[test]
    fn test_oversized_length_is_skipped() {
        let mut wire = vec![START1, START2, 0xFF, 0xFF]; // length 65535
        wire.extend_from_slice(&encode(b"ok"));
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&wire);
        assert_eq!(frames, vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_empty_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&encode(b""));
        assert_eq!(frames, vec![Vec::<u8>::new()]);
    }
}
