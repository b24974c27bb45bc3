use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Buffered reader for the line- and byte-oriented handshakes that precede a
/// relay (HTTP request heads, SOCKS5 replies).
///
/// The buffer size is also the maximum line length. Bytes read from the
/// stream but not consumed by a parse are available via `unparsed_data` and
/// must be forwarded by the caller before raw relaying starts.
pub struct LineReader {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl LineReader {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Reads a single `\n`-terminated line, stripping the newline and an
    /// optional preceding `\r`.
    pub async fn read_line<T: AsyncRead + Unpin>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<&str> {
        loop {
            if let Some(pos) = memchr(b'\n', &self.buf[self.start..self.end]) {
                let newline_pos = self.start + pos;
                let line_start = self.start;
                let line_end = if newline_pos > line_start && self.buf[newline_pos - 1] == b'\r' {
                    newline_pos - 1
                } else {
                    newline_pos
                };
                self.consume(newline_pos + 1 - self.start);
                return std::str::from_utf8(&self.buf[line_start..line_end]).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("line is not utf-8: {e}"),
                    )
                });
            }
            self.fill(stream).await?;
        }
    }

    pub async fn read_u8<T: AsyncRead + Unpin>(&mut self, stream: &mut T) -> std::io::Result<u8> {
        while self.end - self.start < 1 {
            self.fill(stream).await?;
        }
        let value = self.buf[self.start];
        self.consume(1);
        Ok(value)
    }

    pub async fn read_slice<T: AsyncRead + Unpin>(
        &mut self,
        stream: &mut T,
        len: usize,
    ) -> std::io::Result<&[u8]> {
        if len > self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("requested length {} exceeds buffer size {}", len, self.buf.len()),
            ));
        }
        while self.end - self.start < len {
            self.fill(stream).await?;
        }
        let slice_start = self.start;
        self.consume(len);
        Ok(&self.buf[slice_start..slice_start + len])
    }

    /// Bytes read from the stream but not consumed by any parse call.
    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start == self.end {
            // Only the cursors move, the bytes stay put until the next fill,
            // so slices taken just before a consume stay valid.
            self.start = 0;
            self.end = 0;
        }
    }

    async fn fill<T: AsyncRead + Unpin>(&mut self, stream: &mut T) -> std::io::Result<()> {
        if self.start == 0 && self.end == self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "read buffer is full",
            ));
        }

        // Slide pending bytes to the front so there is room to read into.
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        let len = stream.read(&mut self.buf[self.end..]).await?;
        if len == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "eof while reading",
            ));
        }
        self.end += len;
        Ok(())
    }
}
