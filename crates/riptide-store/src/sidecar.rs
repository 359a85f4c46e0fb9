//! Sidecar files — `.mhash` and `.mbinmap`.
//!
//! A checkpoint atomically captures a swarm's verified state next to its
//! content so the engine resumes without rehashing: `.mhash` holds the tree
//! hashes in in-order bin layout (binary), `.mbinmap` holds a keyed text
//! record plus the HAVE runs. Both are written to a temp file and renamed
//! into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use riptide_core::bin::ChunkRange;
use riptide_core::binmap::Binmap;
use riptide_core::merkle::{Hash, HashTree, HASH_SIZE};
use riptide_core::SwarmId;

use crate::StoreError;

pub const MHASH_EXT: &str = "mhash";
pub const MBINMAP_EXT: &str = "mbinmap";

/// `<content>.mhash` / `<content>.mbinmap` paths for a content file.
pub fn sidecar_paths(content_path: &Path) -> (PathBuf, PathBuf) {
    let mut mhash = content_path.as_os_str().to_owned();
    mhash.push(".");
    mhash.push(MHASH_EXT);
    let mut mbinmap = content_path.as_os_str().to_owned();
    mbinmap.push(".");
    mbinmap.push(MBINMAP_EXT);
    (PathBuf::from(mhash), PathBuf::from(mbinmap))
}

/// Parsed `.mbinmap` contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinmapRecord {
    pub root: SwarmId,
    pub chunk_size: usize,
    pub complete_bytes: u64,
    pub complete_chunks: u64,
    pub have: Binmap,
}

/// Write `.mbinmap`: keyed header lines then one `have` line per run.
pub fn write_mbinmap(path: &Path, record: &BinmapRecord) -> Result<(), StoreError> {
    let mut text = String::new();
    text.push_str("version 1\n");
    text.push_str(&format!("root hash {}\n", hex::encode(record.root)));
    text.push_str(&format!("chunk size {}\n", record.chunk_size));
    text.push_str(&format!("complete {}\n", record.complete_bytes));
    text.push_str(&format!("completec {}\n", record.complete_chunks));
    for run in record.have.runs() {
        text.push_str(&format!("have {} {}\n", run.start, run.end));
    }
    atomic_write(path, text.as_bytes())
}

pub fn read_mbinmap(path: &Path) -> Result<BinmapRecord, StoreError> {
    let text =
        fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    let bad = |msg: &str| StoreError::BadSidecar(path.to_path_buf(), msg.to_string());
    let mut root = None;
    let mut chunk_size = None;
    let mut complete_bytes = 0;
    let mut complete_chunks = 0;
    let mut have = Binmap::new();
    for line in text.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["version", v] => {
                if *v != "1" {
                    return Err(bad(&format!("unsupported version {v}")));
                }
            }
            ["root", "hash", hex_root] => {
                root = riptide_core::parse_swarm_id(hex_root);
                if root.is_none() {
                    return Err(bad("bad root hash"));
                }
            }
            ["chunk", "size", n] => {
                chunk_size = n.parse().ok();
            }
            ["complete", n] => {
                complete_bytes = n.parse().map_err(|_| bad("bad complete"))?;
            }
            ["completec", n] => {
                complete_chunks = n.parse().map_err(|_| bad("bad completec"))?;
            }
            ["have", s, e] => {
                let start = s.parse().map_err(|_| bad("bad have run"))?;
                let end = e.parse().map_err(|_| bad("bad have run"))?;
                have.insert(ChunkRange::new(start, end));
            }
            [] => {}
            _ => return Err(bad(&format!("unrecognized line {line:?}"))),
        }
    }
    Ok(BinmapRecord {
        root: root.ok_or_else(|| bad("missing root hash"))?,
        chunk_size: chunk_size.ok_or_else(|| bad("missing chunk size"))?,
        complete_bytes,
        complete_chunks,
        have,
    })
}

/// Write `.mhash`: every bin's hash in in-order layout. Bins covering
/// absent subtrees are zero. File length is `2 * padded_leaves * HASH_SIZE`.
pub fn write_mhash(path: &Path, tree: &HashTree) -> Result<(), StoreError> {
    let n = tree.chunk_count();
    let padded = n.max(1).next_power_of_two();
    let mut data = Vec::with_capacity((2 * padded) as usize * HASH_SIZE);
    for bin in 0..2 * padded {
        let hash = ChunkRange::from_bin(bin as u32)
            .filter(|r| u64::from(r.start) < padded)
            .map(|r| tree.hash_of(r))
            .unwrap_or([0u8; HASH_SIZE]);
        data.extend_from_slice(&hash);
    }
    atomic_write(path, &data)
}

/// Read `.mhash` back into leaf hashes for the first `chunks` chunks.
pub fn read_mhash_leaves(path: &Path, chunks: u64) -> Result<Vec<Hash>, StoreError> {
    let data = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    if data.len() % HASH_SIZE != 0 {
        return Err(StoreError::BadSidecar(
            path.to_path_buf(),
            "length is not a hash multiple".to_string(),
        ));
    }
    let mut leaves = Vec::with_capacity(chunks as usize);
    for chunk in 0..chunks {
        let bin = 2 * chunk as usize;
        let offset = bin * HASH_SIZE;
        if offset + HASH_SIZE > data.len() {
            return Err(StoreError::BadSidecar(
                path.to_path_buf(),
                format!("missing leaf hash for chunk {chunk}"),
            ));
        }
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&data[offset..offset + HASH_SIZE]);
        leaves.push(hash);
    }
    Ok(leaves)
}

/// Rename-from-temp write: the sidecar is either the old version or the new
/// one, never a torn mix.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(data).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}
