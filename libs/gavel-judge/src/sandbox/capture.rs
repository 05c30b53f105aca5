//! Bounded output capture.
//!
//! Runaway output must not grow worker memory, and a child blocked on a full
//! pipe must not look like a hang, so past the ceiling bytes are read and
//! discarded while `truncated` records that it happened.

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK: usize = 8 * 1024;

#[derive(Debug)]
pub struct CappedBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Lossy UTF-8; a multi-byte character cut at the ceiling becomes U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Drain `reader` to EOF into `out`.
///
/// Writes through `&mut` so whatever arrived before a timeout cancels the
/// read is still available to the caller.
pub async fn drain_into<R>(reader: Option<R>, out: &mut CappedBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut chunk = vec![0u8; CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        out.push(&chunk[..n]);
    }
}
