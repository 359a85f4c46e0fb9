//! Chunked storage over content files.
//!
//! A swarm's content is addressed as a linear byte stream; storage maps
//! chunk indices onto that stream. Single-file swarms map directly onto one
//! file. Multi-file swarms linearize the spec document followed by every
//! file in sorted order; a downloader starts in single-file mode and
//! switches once the arriving prefix announces a spec.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::multifile::{Located, MultiFileSpec};
use crate::StoreError;

/// Chunked access to a single content file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: File,
    size: u64,
    chunk_size: usize,
}

impl FileStorage {
    /// Open an existing content file for serving.
    pub fn open(path: impl Into<PathBuf>, chunk_size: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        let size = file
            .metadata()
            .map_err(|e| StoreError::io(&path, e))?
            .len();
        Ok(Self {
            path,
            file,
            size,
            chunk_size,
        })
    }

    /// Create (or truncate to size) a content file for downloading.
    pub fn create(
        path: impl Into<PathBuf>,
        size: u64,
        chunk_size: usize,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.set_len(size).map_err(|e| StoreError::io(&path, e))?;
        Ok(Self {
            path,
            file,
            size,
            chunk_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        self.size.div_ceil(self.chunk_size as u64)
    }

    /// Shrink to the exact content size once it is learned (the download
    /// was allocated at a whole number of chunks).
    pub fn truncate_to(&mut self, size: u64) -> Result<(), StoreError> {
        if size < self.size {
            self.file
                .set_len(size)
                .map_err(|e| StoreError::io(&self.path, e))?;
            self.size = size;
        }
        Ok(())
    }

    /// Expected byte length of chunk `chunk` (the last one may be short).
    pub fn chunk_len(&self, chunk: u32) -> Result<usize, StoreError> {
        let start = u64::from(chunk) * self.chunk_size as u64;
        if start >= self.size {
            return Err(StoreError::ChunkOutOfRange(chunk));
        }
        Ok(((self.size - start).min(self.chunk_size as u64)) as usize)
    }

    pub fn read_chunk(&self, chunk: u32) -> Result<Bytes, StoreError> {
        let len = self.chunk_len(chunk)?;
        let mut data = vec![0u8; len];
        let offset = u64::from(chunk) * self.chunk_size as u64;
        self.file
            .read_exact_at(&mut data, offset)
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(Bytes::from(data))
    }

    pub fn write_chunk(&mut self, chunk: u32, data: &[u8]) -> Result<(), StoreError> {
        let want = self.chunk_len(chunk)?;
        if data.len() != want {
            return Err(StoreError::ChunkLength {
                chunk,
                got: data.len(),
                want,
            });
        }
        let offset = u64::from(chunk) * self.chunk_size as u64;
        self.file
            .write_all_at(data, offset)
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Arbitrary byte-range read, for gateway serving.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        let len = len.min(self.size.saturating_sub(offset) as usize);
        let mut data = vec![0u8; len];
        self.file
            .read_exact_at(&mut data, offset)
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(Bytes::from(data))
    }
}

/// Chunked access to a multi-file swarm rooted at a directory.
#[derive(Debug)]
pub struct MultiFileStorage {
    base_dir: PathBuf,
    spec: MultiFileSpec,
    spec_bytes: Vec<u8>,
    chunk_size: usize,
}

impl MultiFileStorage {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        spec: MultiFileSpec,
        chunk_size: usize,
    ) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| StoreError::io(&base_dir, e))?;
        let spec_bytes = spec.to_text().into_bytes();
        let spec_path = base_dir.join(crate::multifile::SPEC_FILENAME);
        fs::write(&spec_path, &spec_bytes).map_err(|e| StoreError::io(&spec_path, e))?;
        Ok(Self {
            base_dir,
            spec,
            spec_bytes,
            chunk_size,
        })
    }

    pub fn spec(&self) -> &MultiFileSpec {
        &self.spec
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn size(&self) -> u64 {
        self.spec.total_size()
    }

    pub fn chunk_count(&self) -> u64 {
        self.size().div_ceil(self.chunk_size as u64)
    }

    pub fn chunk_len(&self, chunk: u32) -> Result<usize, StoreError> {
        let start = u64::from(chunk) * self.chunk_size as u64;
        if start >= self.size() {
            return Err(StoreError::ChunkOutOfRange(chunk));
        }
        Ok(((self.size() - start).min(self.chunk_size as u64)) as usize)
    }

    fn file_path(&self, rel: &str) -> PathBuf {
        let mut path = self.base_dir.clone();
        for part in rel.split('/') {
            path.push(part);
        }
        path
    }

    /// Read `len` bytes at linear offset, crossing file boundaries.
    pub fn read_at(&self, mut offset: u64, len: usize) -> Result<Bytes, StoreError> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let want = len - out.len();
            match self.spec.locate(offset) {
                None => break,
                Some(Located::Spec { offset: spec_off }) => {
                    let end = (spec_off as usize + want).min(self.spec_bytes.len());
                    out.extend_from_slice(&self.spec_bytes[spec_off as usize..end]);
                    offset += (end - spec_off as usize) as u64;
                }
                Some(Located::File {
                    path,
                    offset: file_off,
                    remaining_in_file,
                }) => {
                    let take = (want as u64).min(remaining_in_file) as usize;
                    let full = self.file_path(path);
                    let mut data = vec![0u8; take];
                    match File::open(&full) {
                        Ok(file) => file
                            .read_exact_at(&mut data, file_off)
                            .map_err(|e| StoreError::io(&full, e))?,
                        // Hole in a partially-downloaded swarm reads as zeros.
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(StoreError::io(&full, e)),
                    }
                    out.extend_from_slice(&data);
                    offset += take as u64;
                }
            }
        }
        Ok(Bytes::from(out))
    }

    /// Write bytes at a linear offset, creating sub-files and directories
    /// as needed.
    pub fn write_at(&mut self, mut offset: u64, mut data: &[u8]) -> Result<(), StoreError> {
        while !data.is_empty() {
            match self.spec.locate(offset) {
                None => break,
                Some(Located::Spec { offset: spec_off }) => {
                    // The spec document is synthesized locally; arriving
                    // bytes for it must agree but are not re-persisted.
                    let take = (data.len() as u64)
                        .min(self.spec_bytes.len() as u64 - spec_off)
                        as usize;
                    offset += take as u64;
                    data = &data[take..];
                }
                Some(Located::File {
                    path,
                    offset: file_off,
                    remaining_in_file,
                }) => {
                    let take = (data.len() as u64).min(remaining_in_file) as usize;
                    let full = self.file_path(path);
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
                    }
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&full)
                        .map_err(|e| StoreError::io(&full, e))?;
                    file.write_all_at(&data[..take], file_off)
                        .map_err(|e| StoreError::io(&full, e))?;
                    offset += take as u64;
                    data = &data[take..];
                }
            }
        }
        Ok(())
    }

    pub fn read_chunk(&self, chunk: u32) -> Result<Bytes, StoreError> {
        let len = self.chunk_len(chunk)?;
        self.read_at(u64::from(chunk) * self.chunk_size as u64, len)
    }

    pub fn write_chunk(&mut self, chunk: u32, data: &[u8]) -> Result<(), StoreError> {
        let want = self.chunk_len(chunk)?;
        if data.len() != want {
            return Err(StoreError::ChunkLength {
                chunk,
                got: data.len(),
                want,
            });
        }
        self.write_at(u64::from(chunk) * self.chunk_size as u64, data)
    }
}

/// Storage for a downloading swarm whose shape is not yet known.
///
/// Starts as a single file named after the swarm; if the first chunks
/// announce a multi-file spec, converts in place once the whole spec has
/// arrived, replaying the already-written prefix into the sub-files.
#[derive(Debug)]
pub enum SwarmStorage {
    Single(FileStorage),
    Multi(MultiFileStorage),
}

impl SwarmStorage {
    /// Open a download target. `content_path` is the single-file location;
    /// a multi-file swarm converts under `content_path`'s parent directory.
    pub fn create_download(
        content_path: impl Into<PathBuf>,
        size: u64,
        chunk_size: usize,
    ) -> Result<Self, StoreError> {
        Ok(SwarmStorage::Single(FileStorage::create(
            content_path,
            size,
            chunk_size,
        )?))
    }

    pub fn size(&self) -> u64 {
        match self {
            SwarmStorage::Single(s) => s.size(),
            SwarmStorage::Multi(s) => s.size(),
        }
    }

    pub fn chunk_count(&self) -> u64 {
        match self {
            SwarmStorage::Single(s) => s.chunk_count(),
            SwarmStorage::Multi(s) => s.chunk_count(),
        }
    }

    pub fn chunk_len(&self, chunk: u32) -> Result<usize, StoreError> {
        match self {
            SwarmStorage::Single(s) => s.chunk_len(chunk),
            SwarmStorage::Multi(s) => s.chunk_len(chunk),
        }
    }

    pub fn read_chunk(&self, chunk: u32) -> Result<Bytes, StoreError> {
        match self {
            SwarmStorage::Single(s) => s.read_chunk(chunk),
            SwarmStorage::Multi(s) => s.read_chunk(chunk),
        }
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        match self {
            SwarmStorage::Single(s) => s.read_at(offset, len),
            SwarmStorage::Multi(s) => s.read_at(offset, len),
        }
    }

    /// Write a verified chunk.
    pub fn write_chunk(&mut self, chunk: u32, data: &[u8]) -> Result<(), StoreError> {
        match self {
            SwarmStorage::Single(s) => s.write_chunk(chunk, data),
            SwarmStorage::Multi(s) => s.write_chunk(chunk, data),
        }
    }

    /// If the downloaded prefix announces a multi-file spec, the declared
    /// spec size; the caller converts once every chunk covering it has
    /// been verified.
    pub fn spec_declared_size(&self) -> Option<u64> {
        let SwarmStorage::Single(single) = self else {
            return None;
        };
        let head = single.read_at(0, 1024.min(single.size() as usize)).ok()?;
        if !MultiFileSpec::is_spec_prefix(&head) {
            return None;
        }
        MultiFileSpec::declared_size(&head)
    }

    /// Convert a single-file download whose prefix holds a complete spec
    /// into the multi-file layout, replaying already-written bytes.
    pub fn convert_multifile(&mut self) -> Result<bool, StoreError> {
        let Some(declared) = self.spec_declared_size() else {
            return Ok(false);
        };
        let SwarmStorage::Single(single) = &*self else {
            return Ok(false);
        };
        if declared > single.size() {
            return Err(StoreError::BadSpec(format!(
                "declared spec size {declared} exceeds content size"
            )));
        }
        let head = single.read_at(0, declared as usize)?;
        let text = std::str::from_utf8(&head)
            .map_err(|e| StoreError::BadSpec(e.to_string()))?;
        let spec = MultiFileSpec::parse(text)?;
        let base_dir = single
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let old_path = single.path().to_path_buf();
        let size = single.size();
        let chunk_size = single.chunk_size();

        // Replay the single-file prefix into the multi-file layout, then
        // drop the placeholder file.
        let mut file = File::open(&old_path).map_err(|e| StoreError::io(&old_path, e))?;
        let mut prefix = Vec::with_capacity(size as usize);
        file.read_to_end(&mut prefix)
            .map_err(|e| StoreError::io(&old_path, e))?;
        let mut multi = MultiFileStorage::new(base_dir, spec, chunk_size)?;
        multi.write_at(0, &prefix)?;
        fs::remove_file(&old_path).map_err(|e| StoreError::io(&old_path, e))?;
        tracing::debug!(
            files = multi.spec().entries().len(),
            "storage converted to multi-file layout"
        );
        *self = SwarmStorage::Multi(multi);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multifile::SPEC_FILENAME;

    #[test]
    fn single_file_chunk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content");
        let mut storage = FileStorage::create(&path, 2500, 1024).unwrap();
        storage.write_chunk(0, &[1u8; 1024]).unwrap();
        storage.write_chunk(1, &[2u8; 1024]).unwrap();
        storage.write_chunk(2, &[3u8; 452]).unwrap();
        assert_eq!(storage.chunk_count(), 3);
        assert_eq!(storage.read_chunk(0).unwrap(), Bytes::from(vec![1u8; 1024]));
        assert_eq!(storage.read_chunk(2).unwrap().len(), 452);
        assert!(storage.read_chunk(3).is_err());
    }

    #[test]
    fn short_last_chunk_length_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::create(dir.path().join("c"), 1500, 1024).unwrap();
        let err = storage.write_chunk(1, &[0u8; 1024]).unwrap_err();
        assert!(matches!(err, StoreError::ChunkLength { want: 476, .. }));
    }

    #[test]
    fn multifile_concatenates_spec_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let spec = MultiFileSpec::from_entries(vec![
            ("a.bin".into(), 10),
            ("sub/b.bin".into(), 20),
        ])
        .unwrap();
        let mut storage = MultiFileStorage::new(dir.path(), spec.clone(), 1024).unwrap();
        let spec_size = spec.spec_size();

        let mut content = spec.to_text().into_bytes();
        content.extend(std::iter::repeat(0xaa).take(10));
        content.extend(std::iter::repeat(0xbb).take(20));
        storage.write_at(0, &content).unwrap();

        // Sub-files landed in the right places with the right bytes.
        assert_eq!(
            fs::read(dir.path().join("a.bin")).unwrap(),
            vec![0xaa; 10]
        );
        assert_eq!(
            fs::read(dir.path().join("sub/b.bin")).unwrap(),
            vec![0xbb; 20]
        );

        // Linear reads cross the file boundary.
        let read = storage.read_at(spec_size + 5, 15).unwrap();
        let mut want = vec![0xaa; 5];
        want.extend(vec![0xbb; 10]);
        assert_eq!(read, Bytes::from(want));

        // Whole-stream read equals spec || a || b.
        let all = storage.read_at(0, storage.size() as usize).unwrap();
        assert_eq!(all, Bytes::from(content));
    }

    #[test]
    fn download_converts_to_multifile() {
        let dir = tempfile::tempdir().unwrap();
        let spec = MultiFileSpec::from_entries(vec![("data/x.bin".into(), 1500)]).unwrap();
        let mut content = spec.to_text().into_bytes();
        content.extend((0..1500u32).map(|i| (i % 256) as u8));
        let total = content.len() as u64;

        let mut storage =
            SwarmStorage::create_download(dir.path().join("roothash"), total, 1024).unwrap();

        // Deliver the tail first, then chunk 0 carrying the spec header.
        storage.write_chunk(1, &content[1024..]).unwrap();
        assert_eq!(storage.spec_declared_size(), None);
        storage.write_chunk(0, &content[..1024]).unwrap();
        assert_eq!(storage.spec_declared_size(), Some(spec.spec_size()));
        assert!(storage.convert_multifile().unwrap());

        assert!(matches!(storage, SwarmStorage::Multi(_)));
        assert!(!dir.path().join("roothash").exists());
        assert_eq!(
            fs::read(dir.path().join("data/x.bin")).unwrap(),
            content[content.len() - 1500..]
        );
        assert!(dir.path().join(SPEC_FILENAME).exists());
    }
}
