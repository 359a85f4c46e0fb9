//! riptide-store — content storage for swarms.
//!
//! Maps a swarm onto its backing file(s): chunked reads and writes, the
//! `.mhash` / `.mbinmap` sidecars that make checkpoints resumable, the
//! multi-file specification, the live append log, and the one-time
//! hash-check that turns a plain file into a seedable swarm.

pub mod hashcheck;
pub mod live;
pub mod multifile;
pub mod sidecar;
pub mod storage;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk {0} out of range")]
    ChunkOutOfRange(u32),
    #[error("chunk {chunk} has wrong length {got}, expected {want}")]
    ChunkLength { chunk: u32, got: usize, want: usize },
    #[error("chunks below {floor} have been discarded from the live window")]
    RangeDiscarded { floor: u32 },
    #[error("multi-file spec is malformed: {0}")]
    BadSpec(String),
    #[error("sidecar {0} is malformed: {1}")]
    BadSidecar(PathBuf, String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
