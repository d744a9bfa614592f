use crate::error::Error;

/// Splits an inbound byte stream into newline-delimited messages.
///
/// Bytes are buffered across reads, so a message split over several TCP
/// segments is reassembled and several messages in one segment are separated.
/// Trailing whitespace (including `\r`) is stripped. Blank lines are returned
/// as empty strings; callers decide whether they mean anything.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    // Prefix of `buf` already known to contain no delimiter.
    scanned: usize,
    max_len: usize,
}

impl LineDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_len,
        }
    }

    /// Feeds raw bytes and returns every message they complete.
    ///
    /// Fails once a single message grows beyond `max_len` bytes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<String>, Error> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            if end - start > self.max_len {
                return Err(Error::MessageTooLong {
                    limit: self.max_len,
                });
            }
            let line = String::from_utf8_lossy(&self.buf[start..end]);
            lines.push(line.trim_end().to_string());
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_len {
            return Err(Error::MessageTooLong {
                limit: self.max_len,
            });
        }
        Ok(lines)
    }

    /// Bytes received after the last delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
