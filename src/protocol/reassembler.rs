//! Ordered chunk buffer for one session.

use bytes::{Bytes, BytesMut};

/// Fragments of one session, kept in receipt order.
///
/// A buffer always exists once a session does: the first fragment for a new
/// id produces a buffer holding exactly that fragment.
#[derive(Debug, Clone, Default)]
pub struct ChunkBuffer {
    chunks: Vec<Bytes>,
    total_bytes: usize,
}

impl ChunkBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment at the end. Empty chunks are not stored.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
    }

    /// Concatenate every fragment in order. The buffer is left intact.
    pub fn assemble(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut out = BytesMut::with_capacity(self.total_bytes);
                for chunk in chunks {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            },
        }
    }

    /// Drop every fragment.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    /// Number of stored fragments.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// No fragments stored.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Sum of fragment lengths.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}
