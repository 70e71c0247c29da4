//! Multiplexed exec/attach stream framing.
//!
//! When a container runs without a TTY the engine interleaves stdout and
//! stderr on one connection. Each frame is an 8-byte header followed by the
//! payload:
//!
//! ```text
//! ┌──────────┬───────────────┬──────────────────────┬─────────────┐
//! │ 1 byte   │ 3 bytes       │ 4 bytes (big endian) │ N bytes     │
//! │ stream   │ reserved (0)  │ payload length N     │ payload     │
//! └──────────┴───────────────┴──────────────────────┴─────────────┘
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::runtime::error::{Result, RuntimeError};

const HEADER_LEN: usize = 8;

/// Which stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    /// Engine-level messages (rare; treated like stderr by callers).
    System,
}

impl StreamKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            3 => Some(Self::System),
            _ => None,
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
            Self::System => 3,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

/// Encode a single frame.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        RuntimeError::protocol(format!("frame payload too large: {} bytes", payload.len()))
    })?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind.as_byte());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental decoder. Feed it body chunks as they arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buf.len() >= HEADER_LEN {
            let kind = StreamKind::from_byte(self.buf[0]).ok_or_else(|| {
                RuntimeError::protocol(format!("unknown stream type {}", self.buf[0]))
            })?;
            let len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if self.buf.len() < HEADER_LEN + len {
                break;
            }
            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(len).freeze();
            frames.push(Frame { kind, payload });
        }

        Ok(frames)
    }

    /// Signal end of stream. Leftover bytes mean a truncated frame.
    pub fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::protocol(format!(
                "stream ended inside a frame ({} trailing bytes)",
                self.buf.len()
            )))
        }
    }
}

/// Decode a complete multiplexed body.
pub fn demux(data: &[u8]) -> Result<Vec<Frame>> {
    let mut decoder = FrameDecoder::new();
    let frames = decoder.push(data)?;
    decoder.finish()?;
    Ok(frames)
}

/// Output split back into its two streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demuxed {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Demuxed {
    pub fn from_frames(frames: &[Frame]) -> Self {
        let mut out = Self::default();
        for frame in frames {
            match frame.kind {
                StreamKind::Stdout | StreamKind::Stdin => out.stdout.extend_from_slice(&frame.payload),
                StreamKind::Stderr | StreamKind::System => {
                    out.stderr.extend_from_slice(&frame.payload)
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(frames: &[(StreamKind, Vec<u8>)]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|(k, p)| encode_frame(*k, p).unwrap())
            .collect()
    }

    #[test]
    fn test_round_trip_payload_sizes() {
        let big: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        let input = vec![
            (StreamKind::Stdout, Vec::new()),
            (StreamKind::Stderr, vec![b'x']),
            (StreamKind::Stdout, big.clone()),
        ];
        let wire = encode_all(&input);

        let frames = demux(&wire).unwrap();
        assert_eq!(frames.len(), 3);
        let concatenated: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        let expected: Vec<u8> = input.iter().flat_map(|(_, p)| p.clone()).collect();
        assert_eq!(concatenated, expected);
        assert_eq!(frames[2].payload.len(), big.len());
    }

    #[test]
    fn test_incremental_push_across_chunk_boundaries() {
        let wire = encode_all(&[
            (StreamKind::Stdout, b"hello ".to_vec()),
            (StreamKind::Stderr, b"oops".to_vec()),
            (StreamKind::Stdout, b"world".to_vec()),
        ]);

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(3) {
            frames.extend(decoder.push(chunk).unwrap());
        }
        decoder.finish().unwrap();

        let out = Demuxed::from_frames(&frames);
        assert_eq!(out.stdout, b"hello world");
        assert_eq!(out.stderr, b"oops");
    }

    #[test]
    fn test_truncated_frame_is_protocol_error() {
        let mut wire = encode_frame(StreamKind::Stdout, b"abcdef").unwrap();
        wire.truncate(wire.len() - 2);
        let err = demux(&wire).unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol { .. }));
    }

    #[test]
    fn test_unknown_stream_type_rejected() {
        let mut wire = encode_frame(StreamKind::Stdout, b"abc").unwrap();
        wire[0] = 9;
        assert!(demux(&wire).is_err());
    }

    #[test]
    fn test_empty_body() {
        assert!(demux(&[]).unwrap().is_empty());
    }
}
