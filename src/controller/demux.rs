use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

use crate::shared::models::SandboxError;

const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("invalid stream type {0} in frame header")]
    InvalidStreamType(u8),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DemuxError> for SandboxError {
    fn from(err: DemuxError) -> Self {
        SandboxError::SessionStream(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DemuxMode {
    /// Nothing seen yet.
    #[default]
    Detecting,
    /// 8-byte header framing (stdin/stdout/stderr multiplexed).
    Framed,
    /// TTY output; bytes pass through untouched.
    Raw,
}

/// Leftover state carried between chunks.
#[derive(Debug, Clone, Default)]
pub struct DemuxState {
    pub mode: DemuxMode,
    pub pending: BytesMut,
}

/// Decide the stream mode from its first bytes. `None` means not enough
/// bytes yet.
fn detect(buf: &[u8]) -> Option<DemuxMode> {
    let first = *buf.first()?;
    if first > 2 {
        return Some(DemuxMode::Raw);
    }
    // Reserved header bytes are always zero in framed streams
    let reserved_seen = buf.len().min(4);
    if buf[1..reserved_seen].iter().any(|b| *b != 0) {
        return Some(DemuxMode::Raw);
    }
    if buf.len() < 4 {
        return None;
    }
    Some(DemuxMode::Framed)
}

/// Pull the next payload out of `buf`, leaving partial frames in place.
fn next_payload(mode: &mut DemuxMode, buf: &mut BytesMut) -> Result<Option<Bytes>, DemuxError> {
    if *mode == DemuxMode::Detecting {
        match detect(buf) {
            Some(detected) => *mode = detected,
            None => return Ok(None),
        }
    }

    match mode {
        DemuxMode::Raw => {
            if buf.is_empty() {
                Ok(None)
            } else {
                Ok(Some(buf.split().freeze()))
            }
        }
        DemuxMode::Framed => {
            if buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let stream_type = buf[0];
            if stream_type > 2 {
                return Err(DemuxError::InvalidStreamType(stream_type));
            }
            let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            if buf.len() < HEADER_LEN + len {
                buf.reserve(HEADER_LEN + len - buf.len());
                return Ok(None);
            }
            buf.advance(HEADER_LEN);
            Ok(Some(buf.split_to(len).freeze()))
        }
        DemuxMode::Detecting => Ok(None),
    }
}

/// Decode one chunk against the carried-over state. Returns every complete
/// payload in order plus the state for the next chunk.
pub fn demux(state: DemuxState, chunk: &[u8]) -> Result<(Vec<Bytes>, DemuxState), DemuxError> {
    let DemuxState { mut mode, mut pending } = state;
    pending.extend_from_slice(chunk);

    let mut payloads = Vec::new();
    while let Some(payload) = next_payload(&mut mode, &mut pending)? {
        if !payload.is_empty() {
            payloads.push(payload);
        }
    }
    Ok((payloads, DemuxState { mode, pending }))
}

/// `Decoder` form of [`demux`] for use with `FramedRead`.
#[derive(Debug, Default)]
pub struct StreamDemuxer {
    mode: DemuxMode,
}

impl StreamDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> DemuxMode {
        self.mode
    }
}

impl Decoder for StreamDemuxer {
    type Item = Bytes;
    type Error = DemuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, DemuxError> {
        loop {
            match next_payload(&mut self.mode, src)? {
                Some(payload) if payload.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }
}
