//! Request body sources.
//!
//! Bodies are abstracted as a pull interface: the sender asks for the
//! next chunk until EOF. A known total size is framed with
//! `Content-Length`; an unknown size is streamed with
//! `Transfer-Encoding: chunked`.

/// Pull-style request body.
pub trait HttpBody: Send {
    /// Total size when known up front (`Content-Length` framing).
    fn total_size(&self) -> Option<u64>;

    /// Next chunk of bytes, or `None` at EOF.
    fn read_chunk(&mut self) -> Option<Vec<u8>>;
}

/// Fully buffered body, yielded in one chunk.
pub struct BufferBody {
    data: Option<Vec<u8>>,
    len: u64,
}

impl BufferBody {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        BufferBody {
            len: data.len() as u64,
            data: Some(data),
        }
    }
}

impl HttpBody for BufferBody {
    fn total_size(&self) -> Option<u64> {
        Some(self.len)
    }

    fn read_chunk(&mut self) -> Option<Vec<u8>> {
        self.data.take()
    }
}

impl From<String> for BufferBody {
    fn from(s: String) -> Self {
        BufferBody::new(s.into_bytes())
    }
}

impl From<Vec<u8>> for BufferBody {
    fn from(v: Vec<u8>) -> Self {
        BufferBody::new(v)
    }
}
