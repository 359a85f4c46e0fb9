//! Live swarm storage — an append-only chunk log with a discard window.
//!
//! The source appends raw bytes; the log cuts them into fixed-size chunks
//! and reports which chunk indices became available so the engine can
//! extend the tree and emit signed peaks. With a discard window active,
//! chunks below `head - window` are dropped from memory and disk reads for
//! them fail with a range-discarded error; peak metadata survives so later
//! arrivals still verify.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::StoreError;

#[derive(Debug)]
pub struct LiveStorage {
    path: PathBuf,
    file: std::fs::File,
    chunk_size: usize,
    chunks: BTreeMap<u32, Bytes>,
    /// Bytes accumulated toward the next full chunk.
    partial: Vec<u8>,
    /// Next chunk index to be filled.
    head: u32,
    /// Retain at most this many chunks behind the head.
    window: Option<u64>,
}

impl LiveStorage {
    pub fn create(
        path: impl Into<PathBuf>,
        chunk_size: usize,
        window: Option<u64>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(Self {
            path,
            file,
            chunk_size,
            chunks: BTreeMap::new(),
            partial: Vec::new(),
            head: 0,
            window,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Next chunk index the source will fill.
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Lowest readable chunk index.
    pub fn floor(&self) -> u32 {
        match self.window {
            Some(w) => (u64::from(self.head).saturating_sub(w)) as u32,
            None => 0,
        }
    }

    pub fn size(&self) -> u64 {
        u64::from(self.head) * self.chunk_size as u64 + self.partial.len() as u64
    }

    /// Append source bytes; returns the chunk indices completed by this
    /// call, in order.
    pub fn append(&mut self, mut data: &[u8]) -> Result<Vec<u32>, StoreError> {
        self.file
            .write_all(data)
            .map_err(|e| StoreError::io(&self.path, e))?;
        let mut completed = Vec::new();
        while !data.is_empty() {
            let want = self.chunk_size - self.partial.len();
            let take = want.min(data.len());
            self.partial.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.partial.len() == self.chunk_size {
                let chunk = Bytes::from(std::mem::take(&mut self.partial));
                self.chunks.insert(self.head, chunk);
                completed.push(self.head);
                self.head += 1;
            }
        }
        self.enforce_window();
        Ok(completed)
    }

    /// Flush a trailing partial chunk as a (short) final chunk. Used when
    /// the source stream ends.
    pub fn flush_tail(&mut self) -> Option<u32> {
        if self.partial.is_empty() {
            return None;
        }
        let chunk = Bytes::from(std::mem::take(&mut self.partial));
        self.chunks.insert(self.head, chunk);
        let idx = self.head;
        self.head += 1;
        self.enforce_window();
        Some(idx)
    }

    fn enforce_window(&mut self) {
        let floor = self.floor();
        while let Some((&first, _)) = self.chunks.first_key_value() {
            if first >= floor {
                break;
            }
            self.chunks.remove(&first);
        }
    }

    /// Receive-side insert of a verified chunk at an arbitrary index
    /// (arrivals may be out of order). Advances the head past it.
    pub fn insert_chunk(&mut self, chunk: u32, data: Bytes) -> Result<(), StoreError> {
        if chunk < self.floor() {
            return Err(StoreError::RangeDiscarded { floor: self.floor() });
        }
        self.chunks.insert(chunk, data);
        if chunk >= self.head {
            self.head = chunk + 1;
        }
        self.enforce_window();
        Ok(())
    }

    pub fn read_chunk(&self, chunk: u32) -> Result<Bytes, StoreError> {
        if chunk < self.floor() {
            return Err(StoreError::RangeDiscarded { floor: self.floor() });
        }
        self.chunks
            .get(&chunk)
            .cloned()
            .ok_or(StoreError::ChunkOutOfRange(chunk))
    }
}
