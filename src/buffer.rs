//! Growable decode buffer with pattern extraction

use crate::constants::MAX_BUFFER_SIZE;
use crate::error::{AmiError, AmiResult};

/// Byte buffer persisting partial reads across socket recv calls.
///
/// Consumed bytes are tracked by a read offset; [`compact`](Self::compact)
/// reclaims them once a block has been extracted.
#[derive(Debug, Default)]
pub(crate) struct AmiBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl AmiBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the socket.
    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data
            .extend_from_slice(bytes);
    }

    /// Enforce the hard buffer cap. A buffer this large means the peer
    /// stopped terminating blocks; the connection must be dropped.
    pub(crate) fn check_size_limits(&self) -> AmiResult<()> {
        if self.data.len() - self.pos > MAX_BUFFER_SIZE {
            return Err(AmiError::protocol_error(format!(
                "decode buffer exceeded {} bytes without a block terminator",
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Extract all bytes up to (excluding) the first occurrence of `pattern`,
    /// consuming the pattern itself. Returns `None` if the pattern is absent.
    pub(crate) fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let haystack = &self.data[self.pos..];
        let at = haystack
            .windows(pattern.len())
            .position(|w| w == pattern)?;
        let out = haystack[..at].to_vec();
        self.pos += at + pattern.len();
        Some(out)
    }

    /// Like [`extract_until_pattern`](Self::extract_until_pattern), but for
    /// two candidate terminators: whichever occurs first in the stream wins.
    pub(crate) fn extract_until_first_of(&mut self, a: &[u8], b: &[u8]) -> Option<Vec<u8>> {
        let haystack = &self.data[self.pos..];
        let find = |p: &[u8]| {
            haystack
                .windows(p.len())
                .position(|w| w == p)
        };
        let (at, pat_len) = match (find(a), find(b)) {
            (Some(x), Some(y)) if x <= y => (x, a.len()),
            (_, Some(y)) => (y, b.len()),
            (Some(x), None) => (x, a.len()),
            (None, None) => return None,
        };
        let out = haystack[..at].to_vec();
        self.pos += at + pat_len;
        Some(out)
    }

    /// Drop consumed bytes and reset the read offset.
    pub(crate) fn compact(&mut self) {
        if self.pos > 0 {
            self.data
                .drain(..self.pos);
            self.pos = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_consumes_pattern() {
        let mut buf = AmiBuffer::new();
        buf.extend_from_slice(b"abc\r\n\r\ndef");
        let block = buf
            .extract_until_pattern(b"\r\n\r\n")
            .unwrap();
        assert_eq!(block, b"abc");
        buf.compact();
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn extract_none_when_pattern_absent() {
        let mut buf = AmiBuffer::new();
        buf.extend_from_slice(b"partial dat");
        assert!(buf
            .extract_until_pattern(b"\r\n\r\n")
            .is_none());
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn extract_across_feeds() {
        let mut buf = AmiBuffer::new();
        buf.extend_from_slice(b"Key: Value\r\n\r");
        assert!(buf
            .extract_until_pattern(b"\r\n\r\n")
            .is_none());
        buf.extend_from_slice(b"\nnext");
        let block = buf
            .extract_until_pattern(b"\r\n\r\n")
            .unwrap();
        assert_eq!(block, b"Key: Value");
        buf.compact();
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn size_limit_enforced() {
        let mut buf = AmiBuffer::new();
        buf.extend_from_slice(&vec![b'x'; MAX_BUFFER_SIZE + 1]);
        assert!(buf
            .check_size_limits()
            .is_err());
    }
}
