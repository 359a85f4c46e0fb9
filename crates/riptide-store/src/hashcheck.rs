//! One-time hash-check — turn plain files into seedable swarms.
//!
//! Attaching a file hashes every chunk (through a memory map), builds the
//! tree, and persists fresh sidecars keyed by the resulting root. A
//! directory attach walks the tree and produces the multi-file spec first,
//! so the swarm id covers spec plus files.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use riptide_core::bin::ChunkRange;
use riptide_core::binmap::Binmap;
use riptide_core::merkle::{leaf_hash, HashTree};
use riptide_core::SwarmId;

use crate::multifile::MultiFileSpec;
use crate::sidecar::{self, BinmapRecord};
use crate::StoreError;

/// Result of hash-checking content.
#[derive(Debug)]
pub struct HashCheck {
    pub root: SwarmId,
    pub tree: HashTree,
    pub size: u64,
}

/// Hash every chunk of a file and build its tree.
pub fn hash_file(path: &Path, chunk_size: usize) -> Result<HashCheck, StoreError> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let size = file.metadata().map_err(|e| StoreError::io(path, e))?.len();
    let mut leaves = Vec::with_capacity(size.div_ceil(chunk_size as u64) as usize);
    if size > 0 {
        // Safety: the engine owns its content files; a truncation race
        // would at worst fail the root comparison downstream.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| StoreError::io(path, e))?;
        leaves.extend(map.chunks(chunk_size).map(leaf_hash));
    }
    let tree = HashTree::from_leaves(leaves);
    Ok(HashCheck {
        root: tree.root(),
        tree,
        size,
    })
}

/// Hash a byte slice already in memory (multi-file linearizations, live
/// source priming).
pub fn hash_bytes(data: &[u8], chunk_size: usize) -> HashCheck {
    let leaves = if data.is_empty() {
        Vec::new()
    } else {
        data.chunks(chunk_size).map(leaf_hash).collect()
    };
    let tree = HashTree::from_leaves(leaves);
    HashCheck {
        root: tree.root(),
        size: data.len() as u64,
        tree,
    }
}

/// Attach a single file as a swarm: hash-check, then write (or refresh)
/// sidecars so the root and the content stay bound together.
pub fn attach_file(path: &Path, chunk_size: usize) -> Result<HashCheck, StoreError> {
    let check = hash_file(path, chunk_size)?;
    let (mhash_path, mbinmap_path) = sidecar::sidecar_paths(path);

    // A matching checkpoint already on disk is trusted as-is.
    if let Ok(existing) = sidecar::read_mbinmap(&mbinmap_path) {
        if existing.root == check.root && mhash_path.exists() {
            tracing::debug!(
                root = hex::encode(check.root),
                path = %path.display(),
                "attach: sidecars current"
            );
            return Ok(check);
        }
    }

    let mut have = Binmap::new();
    let chunks = check.tree.chunk_count();
    if chunks > 0 {
        have.insert(ChunkRange::new(0, (chunks - 1) as u32));
    }
    sidecar::write_mhash(&mhash_path, &check.tree)?;
    sidecar::write_mbinmap(
        &mbinmap_path,
        &BinmapRecord {
            root: check.root,
            chunk_size,
            complete_bytes: check.size,
            complete_chunks: chunks,
            have,
        },
    )?;
    tracing::info!(
        root = hex::encode(check.root),
        size = check.size,
        chunks,
        path = %path.display(),
        "attached file as swarm"
    );
    Ok(check)
}

/// A multi-file collection rooted at a directory, linearized for seeding.
#[derive(Debug)]
pub struct DirCollection {
    pub spec: MultiFileSpec,
    pub check: HashCheck,
    pub base_dir: PathBuf,
}

/// Scan a directory into a multi-file swarm: build the sorted spec, hash
/// the linearized stream (spec then files), and persist the spec document.
pub fn attach_dir_collection(dir: &Path, chunk_size: usize) -> Result<DirCollection, StoreError> {
    let mut entries = Vec::new();
    collect_files(dir, dir, &mut entries)?;
    let spec = MultiFileSpec::from_entries(entries)?;

    let mut stream = spec.to_text().into_bytes();
    for (rel, _) in spec.entries() {
        let full = dir.join(rel.replace('/', std::path::MAIN_SEPARATOR_STR));
        let data = std::fs::read(&full).map_err(|e| StoreError::io(&full, e))?;
        stream.extend_from_slice(&data);
    }
    let check = hash_bytes(&stream, chunk_size);

    let spec_path = dir.join(crate::multifile::SPEC_FILENAME);
    std::fs::write(&spec_path, spec.to_text()).map_err(|e| StoreError::io(&spec_path, e))?;
    tracing::info!(
        root = hex::encode(check.root),
        files = spec.entries().len(),
        size = check.size,
        "attached directory as multi-file swarm"
    );
    Ok(DirCollection {
        spec,
        check,
        base_dir: dir.to_path_buf(),
    })
}

/// Every seedable file directly under `dir`, for `-d` directory seeding.
/// Sidecars and the spec document itself are skipped.
pub fn seedable_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut out = Vec::new();
    let iter = std::fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    for entry in iter {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".mhash")
            || name.ends_with(".mbinmap")
            || name.ends_with(".tmp")
            || name == crate::multifile::SPEC_FILENAME
        {
            continue;
        }
        out.push(path);
    }
    out.sort();
    Ok(out)
}

fn collect_files(
    base: &Path,
    dir: &Path,
    entries: &mut Vec<(String, u64)>,
) -> Result<(), StoreError> {
    let iter = std::fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    for entry in iter {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, entries)?;
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".mhash") || name.ends_with(".mbinmap") || name.ends_with(".tmp") {
            continue;
        }
        if name == crate::multifile::SPEC_FILENAME {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|e| StoreError::io(&path, e))?
            .len();
        let rel = path
            .strip_prefix(base)
            .expect("walked path stays under base")
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push((rel, size));
    }
    Ok(())
}
