use std::fmt;
use std::io::{self, BufRead, Read};

/// Bytes requested from the underlying reader per fill
const READ_CHUNK: usize = 8 * 1024;

/// Whether an I/O error is a read timeout rather than a failure
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Buffered byte stream that can look ahead without consuming
///
/// Peeked bytes stay buffered until consumed, so a decoder that declines a
/// stream leaves it exactly as it found it.
pub struct SniffStream {
    inner: Box<dyn Read + Send>,

    /// Bytes read from `inner`; `buf[pos..]` is unconsumed
    buf: Vec<u8>,
    pos: usize,

    /// `inner` reported end of stream
    eof: bool,
}

impl SniffStream {
    pub fn new<R: Read + Send + 'static>(inner: R) -> Self {
        Self {
            inner: Box::new(inner),
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            eof: false,
        }
    }

    /// Unconsumed bytes currently held in memory
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Whether the underlying reader has reported end of stream
    pub fn reached_eof(&self) -> bool {
        self.eof
    }

    /// Look at up to `n` leading bytes without consuming them
    ///
    /// Reads until `n` bytes are buffered or the stream ends. A timeout
    /// returns whatever is buffered, or the timeout error if nothing is.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffered().len() < n && !self.eof {
            match self.fill_more() {
                Ok(_) => {}
                Err(e) if is_timeout(&e) && !self.buffered().is_empty() => break,
                Err(e) => return Err(e),
            }
        }

        let end = (self.pos + n).min(self.buf.len());
        Ok(&self.buf[self.pos..end])
    }

    /// Look at up to `n` bytes following any leading ASCII whitespace
    ///
    /// Like [`peek`](Self::peek), but the whitespace does not count towards
    /// `n`, so a stream opening with blank lines still shows its first token.
    pub fn peek_significant(&mut self, n: usize) -> io::Result<&[u8]> {
        loop {
            let skip = leading_whitespace(self.buffered());
            let have = self.buffered().len() - skip;
            if have >= n || self.eof {
                break;
            }
            match self.fill_more() {
                Ok(_) => {}
                Err(e) if is_timeout(&e) && have > 0 => break,
                Err(e) => return Err(e),
            }
        }

        let buffered = self.buffered();
        let skip = leading_whitespace(buffered);
        let end = (skip + n).min(buffered.len());
        Ok(&buffered[skip..end])
    }

    /// Read once from the underlying reader, appending to the buffer
    ///
    /// Returns the number of new bytes; 0 means end of stream.
    pub fn fill_more(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }

        self.compact();
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);

        let result = loop {
            match self.inner.read(&mut self.buf[start..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        let n = *result.as_ref().unwrap_or(&0);
        self.buf.truncate(start + n);
        if matches!(result, Ok(0)) {
            self.eof = true;
        }
        result
    }

    /// Mark `n` buffered bytes as read
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    /// Drop consumed bytes from the front of the buffer
    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

fn leading_whitespace(data: &[u8]) -> usize {
    data.iter().take_while(|b| b.is_ascii_whitespace()).count()
}

impl Read for SniffStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for SniffStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.buffered().is_empty() {
            self.fill_more()?;
        }
        Ok(self.buffered())
    }

    fn consume(&mut self, amt: usize) {
        SniffStream::consume(self, amt);
    }
}

impl fmt::Debug for SniffStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniffStream")
            .field("buffered", &self.buffered().len())
            .field("eof", &self.eof)
            .finish()
    }
}
