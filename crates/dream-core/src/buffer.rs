//! Chunked byte buffer
//!
//! Message bodies and queue payloads are memoized into fixed-size 16 KiB
//! chunks instead of one contiguous allocation, so large bodies never
//! require a single large resize and the buffer can be handed to multiple
//! subscribers as cheap [`Bytes`] views.

use bytes::{Bytes, BytesMut};
use std::io::{self, Write};

/// Size of each buffer chunk
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Resizable byte buffer built from fixed-size chunks
#[derive(Debug, Clone, Default)]
pub struct ChunkedBuffer {
    chunks: Vec<Vec<u8>>,
    len: usize,
}

impl ChunkedBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes stored
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes are stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes, filling the current chunk before opening a new one
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let remaining = match self.chunks.last() {
                Some(chunk) if chunk.len() < CHUNK_SIZE => CHUNK_SIZE - chunk.len(),
                _ => {
                    self.chunks.push(Vec::with_capacity(CHUNK_SIZE));
                    CHUNK_SIZE
                }
            };
            let take = remaining.min(data.len());
            self.chunks
                .last_mut()
                .expect("chunk pushed above")
                .extend_from_slice(&data[..take]);
            self.len += take;
            data = &data[take..];
        }
    }

    /// Iterate over the filled chunks in order
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(Vec::as_slice)
    }

    /// Copy the contents into a single contiguous [`Bytes`]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    /// Write the contents to `writer` chunk by chunk
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for chunk in &self.chunks {
            writer.write_all(chunk)?;
        }
        Ok(())
    }

    /// Drop all contents, releasing the chunks
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

impl From<&[u8]> for ChunkedBuffer {
    fn from(data: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.append(data);
        buffer
    }
}

impl From<Vec<u8>> for ChunkedBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from(data.as_slice())
    }
}

impl Write for ChunkedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
