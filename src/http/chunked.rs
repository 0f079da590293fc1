//! `Transfer-Encoding: chunked` decoder (RFC 9112 §7.1).
//!
//! ```text
//! chunk      = chunk-size [ chunk-ext ] CRLF chunk-data CRLF
//! last-chunk = 1*"0" [ chunk-ext ] CRLF trailer-section CRLF
//! ```
//!
//! Incremental: feed arbitrary slices, data bytes stream out through the
//! sink. Trailer headers after the zero-size chunk are parsed and
//! discarded.

use crate::error::{Error, Result};

enum ChunkState {
    /// Reading the hex size line.
    Size,
    /// Reading `remaining` data bytes of the current chunk.
    Data { remaining: usize },
    /// Expecting the CRLF that terminates a chunk's data.
    DataEnd,
    /// Reading trailer lines after the zero-size chunk.
    Trailer,
    Done,
}

pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

const MAX_LINE: usize = 4096;

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Consume `data`, pushing decoded body bytes into `sink`. Returns
    /// `true` once the terminating chunk and trailers have been seen.
    /// Input past that point is ignored.
    pub fn input(&mut self, mut data: &[u8], sink: &mut dyn FnMut(&[u8])) -> Result<bool> {
        while !data.is_empty() {
            match self.state {
                ChunkState::Size => {
                    data = self.take_line(data)?;
                    if let Some(line) = self.finished_line()? {
                        let size_part = line
                            .split(';')
                            .next()
                            .unwrap_or("")
                            .trim();
                        let size = usize::from_str_radix(size_part, 16).map_err(|_| {
                            Error::Protocol(format!("bad chunk size line: {size_part:?}"))
                        })?;
                        self.state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    }
                }
                ChunkState::Data { remaining } => {
                    let take = remaining.min(data.len());
                    sink(&data[..take]);
                    data = &data[take..];
                    if take == remaining {
                        self.state = ChunkState::DataEnd;
                    } else {
                        self.state = ChunkState::Data {
                            remaining: remaining - take,
                        };
                    }
                }
                ChunkState::DataEnd => {
                    data = self.take_line(data)?;
                    if let Some(line) = self.finished_line()? {
                        if !line.is_empty() {
                            return Err(Error::Protocol("missing CRLF after chunk data".into()));
                        }
                        self.state = ChunkState::Size;
                    }
                }
                ChunkState::Trailer => {
                    data = self.take_line(data)?;
                    if let Some(line) = self.finished_line()? {
                        if line.is_empty() {
                            self.state = ChunkState::Done;
                        } else {
                            tracing::trace!(trailer = %line, "chunked trailer ignored");
                        }
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
        Ok(self.is_done())
    }

    /// Accumulate bytes up to and including a LF into `self.line`.
    fn take_line<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8]> {
        match data.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                self.line.extend_from_slice(&data[..=pos]);
                Ok(&data[pos + 1..])
            }
            None => {
                self.line.extend_from_slice(data);
                if self.line.len() > MAX_LINE {
                    return Err(Error::Protocol("chunk line too long".into()));
                }
                Ok(&[])
            }
        }
    }

    /// The completed line without its CRLF, if one has been accumulated.
    fn finished_line(&mut self) -> Result<Option<String>> {
        if self.line.last() != Some(&b'\n') {
            if self.line.len() > MAX_LINE {
                return Err(Error::Protocol("chunk line too long".into()));
            }
            return Ok(None);
        }
        let mut line = std::mem::take(&mut self.line);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| Error::Protocol("non-ASCII chunk line".into()))
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut ChunkedDecoder, input: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let done = decoder.input(input, &mut |b| out.extend_from_slice(b)).unwrap();
        (out, done)
    }

    #[test]
    fn basic_two_chunks() {
        let mut d = ChunkedDecoder::new();
        let (out, done) = decode_all(&mut d, b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        assert_eq!(out, b"hello world");
        assert!(done);
    }

    #[test]
    fn split_across_inputs() {
        let mut d = ChunkedDecoder::new();
        let stream = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut out = Vec::new();
        let mut done = false;
        for byte in stream.iter() {
            done = d.input(&[*byte], &mut |b| out.extend_from_slice(b)).unwrap();
        }
        assert_eq!(out, b"hello world");
        assert!(done);
    }

    #[test]
    fn chunk_extension_ignored() {
        let mut d = ChunkedDecoder::new();
        let (out, done) = decode_all(&mut d, b"5;ext=1\r\nhello\r\n0\r\n\r\n");
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn trailers_parsed_and_discarded() {
        let mut d = ChunkedDecoder::new();
        let (out, done) = decode_all(&mut d, b"3\r\nabc\r\n0\r\nX-Trailer: 1\r\n\r\n");
        assert_eq!(out, b"abc");
        assert!(done);
    }

    #[test]
    fn uppercase_hex_size() {
        let mut d = ChunkedDecoder::new();
        let (out, done) = decode_all(&mut d, b"A\r\n0123456789\r\n0\r\n\r\n");
        assert_eq!(out, b"0123456789");
        assert!(done);
    }

    #[test]
    fn bad_size_line_is_protocol_error() {
        let mut d = ChunkedDecoder::new();
        let err = d.input(b"zz\r\n", &mut |_| {}).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn missing_crlf_after_data_is_protocol_error() {
        let mut d = ChunkedDecoder::new();
        let err = d.input(b"3\r\nabcXX\r\n", &mut |_| {}).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn input_after_done_is_ignored() {
        let mut d = ChunkedDecoder::new();
        decode_all(&mut d, b"0\r\n\r\n");
        let (out, done) = decode_all(&mut d, b"garbage");
        assert!(out.is_empty());
        assert!(done);
    }
}
