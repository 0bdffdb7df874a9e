//! Byte coalescer
//!
//! The PTY hands bytes over in arbitrarily small reads. The parser wants
//! display-granular chunks so a sentinel rarely splits across calls: flush
//! on newline or carriage return, when the buffer passes 128 bytes, or
//! (pump-driven) after a short idle window.

const MAX_BUFFER: usize = 128;

/// Buffers raw serial bytes into display-granular chunks.
#[derive(Debug, Default)]
pub struct ByteCoalescer {
    buf: Vec<u8>,
}

impl ByteCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one byte; returns a chunk when a flush condition is hit.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.buf.push(byte);
        if byte == b'\n' || byte == b'\r' || self.buf.len() > MAX_BUFFER {
            return Some(std::mem::take(&mut self.buf));
        }
        None
    }

    /// Append a slice; returns every chunk completed along the way.
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(chunk) = self.push(b) {
                out.push(chunk);
            }
        }
        out
    }

    /// True when bytes are waiting on the idle-flush timer.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Idle flush: take whatever is buffered.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_on_newline() {
        let mut c = ByteCoalescer::new();
        assert!(c.push(b'h').is_none());
        assert!(c.push(b'i').is_none());
        let chunk = c.push(b'\n').unwrap();
        assert_eq!(chunk, b"hi\n");
        assert!(!c.has_pending());
    }

    #[test]
    fn test_flush_on_carriage_return() {
        let mut c = ByteCoalescer::new();
        c.push(b'x');
        assert_eq!(c.push(b'\r').unwrap(), b"x\r");
    }

    #[test]
    fn test_flush_on_overflow() {
        let mut c = ByteCoalescer::new();
        let mut flushed = None;
        for i in 0..200u8 {
            if let Some(chunk) = c.push(b'a') {
                flushed = Some((i, chunk));
                break;
            }
        }
        let (i, chunk) = flushed.expect("overflow flush");
        assert_eq!(usize::from(i) + 1, MAX_BUFFER + 1);
        assert_eq!(chunk.len(), MAX_BUFFER + 1);
    }

    #[test]
    fn test_idle_take() {
        let mut c = ByteCoalescer::new();
        assert!(c.take().is_none());
        c.push(b'$');
        c.push(b' ');
        assert!(c.has_pending());
        assert_eq!(c.take().unwrap(), b"$ ");
        assert!(c.take().is_none());
    }

    #[test]
    fn test_extend_splits_lines() {
        let mut c = ByteCoalescer::new();
        let chunks = c.extend(b"one\ntwo\nthr");
        assert_eq!(chunks, vec![b"one\n".to_vec(), b"two\n".to_vec()]);
        assert!(c.has_pending());
        assert_eq!(c.take().unwrap(), b"thr");
    }
}
