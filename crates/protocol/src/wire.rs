//! Length-prefixed framing and the payload primitives shared by all frames.
//!
//! Every frame on the channel is `{u32 length, u8 kind, payload}` with the
//! length counting the kind byte plus payload, big-endian integers
//! throughout.  One frame is delivered atomically; partial reads are buffered
//! here so callers only ever see whole frames.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::Frame;

/// Upper bound on the body (kind + payload) of a single frame.
pub const MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME}-byte limit")]
    Oversized(usize),
    #[error("truncated payload")]
    Truncated,
    #[error("trailing bytes after payload")]
    TrailingBytes,
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("invalid UTF-8 in string field")]
    Utf8,
    #[error("invalid field value: {0}")]
    BadValue(&'static str),
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Encoding ─────────────────────────────────────────────────────────────────

pub(crate) fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, value: &[u8]) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value);
}

pub(crate) fn put_string(out: &mut Vec<u8>, value: &str) {
    put_bytes(out, value.as_bytes());
}

pub(crate) fn put_opt_string(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(s) => {
            put_u8(out, 1);
            put_string(out, s);
        }
        None => put_u8(out, 0),
    }
}

pub(crate) fn put_string_list(out: &mut Vec<u8>, values: &[String]) {
    put_u32(out, values.len() as u32);
    for value in values {
        put_string(out, value);
    }
}

pub(crate) fn put_string_map(out: &mut Vec<u8>, values: &BTreeMap<String, String>) {
    put_u32(out, values.len() as u32);
    for (key, value) in values {
        put_string(out, key);
        put_string(out, value);
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Sequential reader over a single frame payload.  Every accessor fails with
/// [`WireError::Truncated`] rather than panicking when the payload runs out.
pub(crate) struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        if end > self.buf.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, WireError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, WireError> {
        let raw = self.take(4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub(crate) fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn string(&mut self) -> Result<String, WireError> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|_| WireError::Utf8)
    }

    pub(crate) fn opt_string(&mut self) -> Result<Option<String>, WireError> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.string()?)),
            _ => Err(WireError::BadValue("presence flag")),
        }
    }

    pub(crate) fn string_list(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.u32()? as usize;
        // Each entry carries at least its own length prefix.
        if count > self.buf.len().saturating_sub(self.pos) / 4 {
            return Err(WireError::Truncated);
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.string()?);
        }
        Ok(values)
    }

    pub(crate) fn string_map(&mut self) -> Result<BTreeMap<String, String>, WireError> {
        let count = self.u32()? as usize;
        let mut values = BTreeMap::new();
        for _ in 0..count {
            let key = self.string()?;
            let value = self.string()?;
            values.insert(key, value);
        }
        Ok(values)
    }

    /// Rejects frames that carry bytes beyond what their kind defines.
    pub(crate) fn finish(&self) -> Result<(), WireError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes)
        }
    }
}

// ── Framed channel I/O ───────────────────────────────────────────────────────

/// Reads one frame, returning `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame_or_eof<R>(reader: &mut R) -> Result<Option<Frame>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::UnexpectedEof);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(WireError::BadValue("empty frame"));
    }
    if len > MAX_FRAME {
        return Err(WireError::Oversized(len));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => WireError::UnexpectedEof,
            _ => WireError::Io(err),
        })?;

    Frame::decode(&body).map(Some)
}

/// Reads one frame; EOF anywhere is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    read_frame_or_eof(reader)
        .await?
        .ok_or(WireError::UnexpectedEof)
}

/// Writes one frame and flushes it so it is observable as a unit.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode();
    if body.len() > MAX_FRAME {
        return Err(WireError::Oversized(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_rejects_truncated_string() {
        let mut out = Vec::new();
        put_string(&mut out, "hello");
        let mut p = Payload::new(&out[..out.len() - 1]);
        assert!(matches!(p.string(), Err(WireError::Truncated)));
    }

    #[test]
    fn payload_rejects_trailing_bytes() {
        let mut out = Vec::new();
        put_u32(&mut out, 7);
        out.push(0xFF);
        let mut p = Payload::new(&out);
        assert_eq!(p.u32().unwrap(), 7);
        assert!(matches!(p.finish(), Err(WireError::TrailingBytes)));
    }

    #[test]
    fn string_map_round_trips() {
        let mut map = BTreeMap::new();
        map.insert("PATH".to_string(), "/usr/bin".to_string());
        map.insert("HOME".to_string(), "/root".to_string());
        let mut out = Vec::new();
        put_string_map(&mut out, &map);
        let mut p = Payload::new(&out);
        assert_eq!(p.string_map().unwrap(), map);
        p.finish().unwrap();
    }

    #[test]
    fn opt_string_rejects_bad_flag() {
        let mut p = Payload::new(&[2]);
        assert!(matches!(p.opt_string(), Err(WireError::BadValue(_))));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_refused() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME as u32) + 1).to_be_bytes());
        buf.push(1);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WireError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn clean_eof_at_boundary_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_frame_or_eof(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_length_prefix_is_an_error() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0]);
        assert!(matches!(
            read_frame_or_eof(&mut cursor).await,
            Err(WireError::UnexpectedEof)
        ));
    }
}
