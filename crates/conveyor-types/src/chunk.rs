use std::io;
use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;

/// A bounded, ordered slice of a job's log stream.
///
/// Sequence starts at 1 and is strictly increasing per job. The offset is
/// the prefix sum of prior chunk sizes, and `size` is the raw byte count
/// before compression. A chunk once formed is immutable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogChunk {
    pub sequence: u64,
    pub offset: u64,
    pub size: usize,
    payload: Vec<u8>,
}

impl LogChunk {
    /// The gzip-compressed log bytes this chunk carries.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Accumulates raw log bytes and cuts them into [`LogChunk`]s.
///
/// Chunks are formed in stream order on the producer side, which is what
/// makes the sequence/offset invariants hold regardless of upload order.
#[derive(Debug)]
pub struct ChunkBuffer {
    max_size: usize,
    buf: Vec<u8>,
    next_sequence: u64,
    offset: u64,
}

impl ChunkBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            buf: Vec::new(),
            next_sequence: 1,
            offset: 0,
        }
    }

    /// Append raw output bytes, cutting a chunk each time the buffer
    /// reaches the configured maximum size.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<Vec<LogChunk>> {
        self.buf.extend_from_slice(bytes);
        let mut chunks = Vec::new();
        while self.buf.len() >= self.max_size {
            let rest = self.buf.split_off(self.max_size);
            let raw = std::mem::replace(&mut self.buf, rest);
            chunks.push(self.seal(raw)?);
        }
        Ok(chunks)
    }

    /// Cut a chunk from whatever is buffered, if anything.
    pub fn flush(&mut self) -> io::Result<Option<LogChunk>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let raw = std::mem::take(&mut self.buf);
        Ok(Some(self.seal(raw)?))
    }

    fn seal(&mut self, raw: Vec<u8>) -> io::Result<LogChunk> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let payload = encoder.finish()?;
        let chunk = LogChunk {
            sequence: self.next_sequence,
            offset: self.offset,
            size: raw.len(),
            payload,
        };
        self.next_sequence += 1;
        self.offset += raw.len() as u64;
        Ok(chunk)
    }
}
