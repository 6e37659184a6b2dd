//!
//! Byte-stuffed framing: `S` <escaped payload> `E`, where the payload bytes
//! `S`, `E` and `\` are escaped with a `\` prefix.
//!
//! The decoder is a three-state machine (idle / in-frame / escaped) which
//! tolerates leading garbage, recovers from a missed end-of-frame when a bare
//! `S` appears mid-frame, and drops the frame on an invalid escape sequence.

/// Start-of-frame marker
pub const FRAME_START: u8 = b'S';
/// End-of-frame marker
pub const FRAME_END: u8 = b'E';
/// Escape prefix
pub const FRAME_ESCAPE: u8 = b'\\';

/// Frames the payload into `out` (cleared first)
pub fn encode(payload: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.push(FRAME_START);
    for &byte in payload {
        if matches!(byte, FRAME_START | FRAME_END | FRAME_ESCAPE) {
            out.push(FRAME_ESCAPE);
        }
        out.push(byte);
    }
    out.push(FRAME_END);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Idle,
    InFrame,
    Escaped,
}

/// Incremental frame decoder. Owns its payload buffer, so the caller may keep
/// feeding raw bytes from a reused read buffer.
pub struct Decoder {
    state: State,
    payload: Vec<u8>,
    max_payload: usize,
}

impl Decoder {
    /// Creates a decoder accepting payloads up to `max_payload` bytes; longer
    /// frames are dropped
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: State::Idle,
            payload: Vec::with_capacity(max_payload),
            max_payload,
        }
    }
    /// Feeds one raw byte. Returns the completed payload when `byte` closes a
    /// frame.
    pub fn push(&mut self, byte: u8) -> Option<&[u8]> {
        match self.state {
            State::Idle => {
                if byte == FRAME_START {
                    self.state = State::InFrame;
                    self.payload.clear();
                }
            }
            State::InFrame => match byte {
                FRAME_ESCAPE => self.state = State::Escaped,
                FRAME_END => {
                    self.state = State::Idle;
                    return Some(&self.payload);
                }
                // missed end of the last frame: drop it, start over
                FRAME_START => self.payload.clear(),
                b => self.append(b),
            },
            State::Escaped => match byte {
                FRAME_ESCAPE | FRAME_END | FRAME_START => {
                    self.state = State::InFrame;
                    self.append(byte);
                }
                _ => {
                    // invalid sequence, drop the frame
                    self.state = State::Idle;
                    self.payload.clear();
                }
            },
        }
        None
    }
    fn append(&mut self, byte: u8) {
        if self.payload.len() == self.max_payload {
            self.state = State::Idle;
            self.payload.clear();
        } else {
            self.payload.push(byte);
        }
    }
    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.state == State::Idle
    }
}

#[cfg(test)]
mod test {
    use super::{encode, Decoder};

    fn decode_all(decoder: &mut Decoder, stream: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in stream {
            if let Some(payload) = decoder.push(byte) {
                frames.push(payload.to_vec());
            }
        }
        frames
    }

    #[test]
    fn test_encode_reserved_bytes() {
        let mut out = Vec::new();
        encode(&[0x53, 0x45, 0x5c, 0x01], &mut out);
        insta::assert_snapshot!(
            format!("{:02x?}", out),
            @"[53, 5c, 53, 5c, 45, 5c, 5c, 01, 45]"
        );
    }

    #[test]
    fn test_roundtrip_with_reserved_bytes() {
        let payload = [0x53, 0x45, 0x5c, 0x01];
        let mut out = Vec::new();
        encode(&payload, &mut out);
        let mut decoder = Decoder::new(16);
        let frames = decode_all(&mut decoder, &out);
        assert_eq!(frames, vec![payload.to_vec()]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_roundtrip_full_block() {
        let payload: Vec<u8> = (0..28u8).map(|i| i.wrapping_mul(37)).collect();
        let mut out = Vec::new();
        encode(&payload, &mut out);
        let mut decoder = Decoder::new(64);
        assert_eq!(decode_all(&mut decoder, &out), vec![payload]);
    }

    #[test]
    fn test_garbage_before_start_discarded() {
        let mut out = Vec::new();
        encode(&[0xaa, 0xbb], &mut out);
        let mut stream = vec![0x00, 0xff, 0x45, 0x10];
        stream.extend(&out);
        let mut decoder = Decoder::new(16);
        assert_eq!(decode_all(&mut decoder, &stream), vec![vec![0xaa, 0xbb]]);
    }

    #[test]
    fn test_bare_start_restarts_frame() {
        // 'S' 0x01 0x02 'S' 0x03 'E' → the first partial frame is dropped
        let stream = [0x53, 0x01, 0x02, 0x53, 0x03, 0x45];
        let mut decoder = Decoder::new(16);
        assert_eq!(decode_all(&mut decoder, &stream), vec![vec![0x03]]);
    }

    #[test]
    fn test_invalid_escape_drops_frame() {
        let stream = [0x53, 0x01, 0x5c, 0x02, 0x45];
        let mut decoder = Decoder::new(16);
        assert!(decode_all(&mut decoder, &stream).is_empty());
        assert!(decoder.is_idle());
        // the decoder still accepts the next well-formed frame
        let stream = [0x53, 0x07, 0x45];
        assert_eq!(decode_all(&mut decoder, &stream), vec![vec![0x07]]);
    }

    #[test]
    fn test_oversized_payload_dropped() {
        let mut decoder = Decoder::new(2);
        let stream = [0x53, 0x01, 0x02, 0x03, 0x45];
        assert!(decode_all(&mut decoder, &stream).is_empty());
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut stream = Vec::new();
        let mut buf = Vec::new();
        encode(&[0x01], &mut buf);
        stream.extend(&buf);
        encode(&[0x02, 0x5c], &mut buf);
        stream.extend(&buf);
        let mut decoder = Decoder::new(16);
        assert_eq!(
            decode_all(&mut decoder, &stream),
            vec![vec![0x01], vec![0x02, 0x5c]]
        );
    }
}
