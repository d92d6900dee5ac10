//! Newline-framed text transport.
//!
//! Every message is one UTF-8 line terminated by `\n`. Reads return one
//! complete line or `None` at EOF; writes flush immediately. There is no
//! header and no binary payload.

use std::io::{Read, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line exceeds {max_line_bytes} bytes")]
    LineTooLong { max_line_bytes: usize },
    #[error("line is not valid utf-8")]
    InvalidUtf8,
}

impl LineError {
    /// True when the underlying read hit a socket read timeout rather
    /// than a real failure; callers poll their shutdown flag and retry.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LineError::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

/// Reads newline-terminated frames from a byte stream.
///
/// Partial input survives across calls, so a read timeout mid-line does
/// not lose the bytes already received.
pub struct LineReader<R> {
    reader: R,
    max_line_bytes: usize,
    pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        LineReader {
            reader,
            max_line_bytes,
            pending: Vec::new(),
        }
    }

    /// Read the next complete line, without its terminator. `Ok(None)`
    /// means the peer closed the stream. Bytes after EOF without a final
    /// newline are returned as one last line.
    pub fn read_line(&mut self) -> Result<Option<String>, LineError> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let line = String::from_utf8(line).map_err(|_| LineError::InvalidUtf8)?;
                return Ok(Some(line));
            }

            if self.pending.len() > self.max_line_bytes {
                return Err(LineError::LineTooLong {
                    max_line_bytes: self.max_line_bytes,
                });
            }

            let mut chunk = [0u8; 1024];
            let n = self.reader.read(&mut chunk)?;
            if n == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let line = String::from_utf8(std::mem::take(&mut self.pending))
                    .map_err(|_| LineError::InvalidUtf8)?;
                return Ok(Some(line));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes newline-terminated frames, flushing after every write.
pub struct LineWriter<W> {
    writer: W,
}

impl<W: Write> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        LineWriter { writer }
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        debug_assert!(!line.contains('\n'), "frame must be a single line");
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
