//! Merkle hash tree with peak anchoring.
//!
//! The tree is binary over the chunk stream, conceptually zero-padded to the
//! next power of two. An absent subtree hashes to all-zero bytes at every
//! level. The peak set is the binary decomposition of the chunk count; the
//! swarm root is the hash of the node covering the whole padded range,
//! obtained by folding peaks right-to-left with zero-hash extension.
//!
//! Serving a chunk means sending the hashes the remote still lacks: peaks
//! first (smallest covering subtree upward), then the uncle chain from the
//! leaf to its covering peak, lower levels before higher.

use std::collections::HashMap;

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bin::ChunkRange;

pub const HASH_SIZE: usize = 20;

pub type Hash = [u8; HASH_SIZE];

/// Hash of any absent subtree, at every level.
pub const EMPTY_HASH: Hash = [0u8; HASH_SIZE];

pub fn leaf_hash(chunk: &[u8]) -> Hash {
    Sha1::digest(chunk).into()
}

pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut h = Sha1::new();
    h.update(left);
    h.update(right);
    h.finalize().into()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("chunk {0} outside the tree")]
    OutOfRange(u32),
    #[error("peak set does not fold to the swarm root")]
    PeakMismatch,
    #[error("missing hash for {0}")]
    MissingHash(ChunkRange),
    #[error("chunk {0} fails verification against its covering peak")]
    ChunkMismatch(u32),
}

/// Peak ranges for `n` chunks, left to right (largest subtree first).
pub fn peaks(n: u64) -> Vec<ChunkRange> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    let mut rest = n;
    while rest > 0 {
        let width = 1u64 << (63 - rest.leading_zeros() as u64);
        out.push(ChunkRange::new(offset as u32, (offset + width - 1) as u32));
        offset += width;
        rest -= width;
    }
    out
}

/// The peak whose subtree contains `chunk`.
pub fn covering_peak(chunk: u32, n: u64) -> Option<ChunkRange> {
    peaks(n).into_iter().find(|p| p.contains(chunk))
}

/// Sibling ranges from `chunk` up to (not including) its covering peak,
/// bottom-up.
pub fn uncles(chunk: u32, n: u64) -> Vec<ChunkRange> {
    let Some(peak) = covering_peak(chunk, n) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut start = u64::from(chunk);
    let mut width = 1u64;
    let base = u64::from(peak.start);
    while width < peak.count() {
        let sibling_start = if (start - base) / width % 2 == 0 {
            start + width
        } else {
            start - width
        };
        out.push(ChunkRange::new(
            sibling_start as u32,
            (sibling_start + width - 1) as u32,
        ));
        start = start.min(sibling_start);
        width *= 2;
    }
    out
}

/// Fold a left-to-right peak hash sequence into the swarm root.
///
/// Starts from the rightmost (smallest) peak, pads it with zero-hash
/// siblings until it is the right sibling of the next peak leftward, and
/// combines. A single peak IS the root.
pub fn root_from_peaks(peak_hashes: &[(ChunkRange, Hash)]) -> Hash {
    let mut iter = peak_hashes.iter().rev();
    let Some(&(range, hash)) = iter.next() else {
        return EMPTY_HASH;
    };
    let mut width = range.count();
    let mut hash = hash;
    for &(left, left_hash) in iter {
        while width < left.count() {
            hash = node_hash(&hash, &EMPTY_HASH);
            width *= 2;
        }
        hash = node_hash(&left_hash, &hash);
        width *= 2;
    }
    hash
}

/// Validate that `peak_hashes` is the peak decomposition of some chunk count
/// and folds to `root`; returns that count.
pub fn check_peaks(peak_hashes: &[(ChunkRange, Hash)], root: &Hash) -> Result<u64, TreeError> {
    let n: u64 = peak_hashes.iter().map(|(r, _)| r.count()).sum();
    if n == 0 {
        return Err(TreeError::PeakMismatch);
    }
    let expected = peaks(n);
    if expected.len() != peak_hashes.len()
        || expected
            .iter()
            .zip(peak_hashes)
            .any(|(want, (got, _))| want != got)
    {
        return Err(TreeError::PeakMismatch);
    }
    if &root_from_peaks(peak_hashes) != root {
        return Err(TreeError::PeakMismatch);
    }
    Ok(n)
}

// ── Full tree (serving side) ─────────────────────────────────────────────────

/// Complete hash tree over known chunk data.
///
/// Stores leaf hashes and derives interior nodes on demand; the padded part
/// of the tree never materializes.
#[derive(Debug, Clone, Default)]
pub struct HashTree {
    leaves: Vec<Hash>,
}

impl HashTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        Self { leaves }
    }

    pub fn chunk_count(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn leaves(&self) -> &[Hash] {
        &self.leaves
    }

    /// Append a leaf (live streams). Returns the new chunk's index.
    pub fn push_leaf(&mut self, hash: Hash) -> u32 {
        self.leaves.push(hash);
        (self.leaves.len() - 1) as u32
    }

    /// Hash of the subtree covering `range`. `range` must be an aligned
    /// perfect subtree; absent parts hash to zero.
    pub fn hash_of(&self, range: ChunkRange) -> Hash {
        let n = self.leaves.len() as u64;
        if u64::from(range.start) >= n {
            return EMPTY_HASH;
        }
        if range.count() == 1 {
            return self.leaves[range.start as usize];
        }
        let mid = range.start + (range.count() / 2) as u32;
        let left = self.hash_of(ChunkRange::new(range.start, mid - 1));
        let right = self.hash_of(ChunkRange::new(mid, range.end));
        node_hash(&left, &right)
    }

    pub fn peak_hashes(&self) -> Vec<(ChunkRange, Hash)> {
        peaks(self.chunk_count())
            .into_iter()
            .map(|p| (p, self.hash_of(p)))
            .collect()
    }

    pub fn root(&self) -> Hash {
        root_from_peaks(&self.peak_hashes())
    }

    /// Uncle hashes for `chunk`, bottom-up to the covering peak.
    pub fn uncle_hashes(&self, chunk: u32) -> Vec<(ChunkRange, Hash)> {
        uncles(chunk, self.chunk_count())
            .into_iter()
            .map(|r| (r, self.hash_of(r)))
            .collect()
    }
}

// ── Receiving side ───────────────────────────────────────────────────────────

/// Incremental verifier for a downloading swarm.
///
/// INTEGRITY records land in a pending set; a DATA record triggers folding
/// leaf + uncles to the covering peak, and peaks to the root. Only hashes
/// proven by a successful fold are committed to the trusted set.
#[derive(Debug)]
pub struct Verifier {
    root: Hash,
    /// Chunk count implied by the accepted peak set. Zero until peaks known.
    chunk_count: u64,
    peak_set: Vec<(ChunkRange, Hash)>,
    trusted: HashMap<ChunkRange, Hash>,
    pending: HashMap<ChunkRange, Hash>,
}

impl Verifier {
    pub fn new(root: Hash) -> Self {
        Self {
            root,
            chunk_count: 0,
            peak_set: Vec::new(),
            trusted: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Hash {
        &self.root
    }

    /// Chunk count discovered from the accepted peak set (0 = unknown yet).
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn peak_set(&self) -> &[(ChunkRange, Hash)] {
        &self.peak_set
    }

    /// Record an INTEGRITY hash. Tries to accept a new peak set whenever the
    /// pending hashes admit one that folds to the root.
    pub fn add_integrity(&mut self, range: ChunkRange, hash: Hash) {
        self.pending.insert(range, hash);
        if self.chunk_count == 0 {
            self.try_accept_peaks();
        }
    }

    /// Accept a peak set that was verified out of band (live signed peaks).
    /// Extends the known chunk count; earlier peaks stay trusted.
    pub fn accept_signed_peak(&mut self, range: ChunkRange, hash: Hash) {
        self.trusted.insert(range, hash);
        let new_count = u64::from(range.end) + 1;
        if new_count > self.chunk_count {
            self.chunk_count = new_count;
            self.peak_set = peaks(new_count)
                .into_iter()
                .filter_map(|p| {
                    self.trusted
                        .get(&p)
                        .or_else(|| self.pending.get(&p))
                        .map(|h| (p, *h))
                })
                .collect();
        }
    }

    /// A single-peak swarm's peak hash is the root itself; otherwise look
    /// for a pending peak set summing to a count whose decomposition matches.
    fn try_accept_peaks(&mut self) {
        // Candidate counts: every pending range that starts at zero could be
        // the leftmost peak; extend greedily with adjacent pending ranges.
        let mut candidates: Vec<Vec<(ChunkRange, Hash)>> = Vec::new();
        for (&r, &h) in &self.pending {
            if r.start == 0 && r.count().is_power_of_two() {
                let mut set = vec![(r, h)];
                let mut next = u64::from(r.end) + 1;
                loop {
                    let follow = self.pending.iter().find(|(c, _)| {
                        u64::from(c.start) == next && c.count().is_power_of_two()
                    });
                    match follow {
                        Some((&c, &ch)) => {
                            set.push((c, ch));
                            next = u64::from(c.end) + 1;
                        }
                        None => break,
                    }
                    candidates.push(set.clone());
                }
                candidates.push(set);
            }
        }
        // Longest valid candidate wins (covers the most content).
        candidates.sort_by_key(|s| std::cmp::Reverse(s.iter().map(|(r, _)| r.count()).sum::<u64>()));
        for set in candidates {
            if let Ok(n) = check_peaks(&set, &self.root) {
                for (r, h) in &set {
                    self.trusted.insert(*r, *h);
                }
                self.peak_set = set;
                self.chunk_count = n;
                return;
            }
        }
        // Single-peak swarm: the root covers [0, 2^k - 1] for some k, but the
        // true chunk count is only learned from data arrival; treat the root
        // as the covering peak for any chunk once a leaf proof folds to it.
    }

    /// Verify `payload` as chunk `chunk` against the root, consuming pending
    /// INTEGRITY records. On success the whole proven path becomes trusted.
    pub fn verify_chunk(&mut self, chunk: u32, payload: &[u8]) -> Result<(), TreeError> {
        let peak = match self.covering(chunk) {
            Some(p) => p,
            // No peak set yet: try folding directly to the root (single-peak
            // swarm whose peak is implicitly known).
            None => match self.fold_to_root(chunk, payload) {
                Ok(()) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        let peak_hash = self
            .trusted
            .get(&peak)
            .copied()
            .ok_or(TreeError::MissingHash(peak))?;

        let mut hash = leaf_hash(payload);
        let mut range = ChunkRange::single(chunk);
        let mut proven = vec![(range, hash)];
        while range != peak {
            let (sibling, parent) = sibling_and_parent(range, peak);
            let sib_hash = self.lookup(&sibling).ok_or(TreeError::MissingHash(sibling))?;
            proven.push((sibling, sib_hash));
            hash = if sibling.start > range.start {
                node_hash(&hash, &sib_hash)
            } else {
                node_hash(&sib_hash, &hash)
            };
            range = parent;
            proven.push((range, hash));
        }
        if hash != peak_hash {
            return Err(TreeError::ChunkMismatch(chunk));
        }
        for (r, h) in proven {
            self.trusted.insert(r, h);
        }
        Ok(())
    }

    /// Single-peak fallback: fold leaf + pending uncles until the running
    /// hash equals the root, learning the peak (and chunk count bound).
    fn fold_to_root(&mut self, chunk: u32, payload: &[u8]) -> Result<(), TreeError> {
        let mut hash = leaf_hash(payload);
        let mut range = ChunkRange::single(chunk);
        let mut proven = vec![(range, hash)];
        loop {
            if hash == self.root && range.start == 0 {
                for (r, h) in proven {
                    self.trusted.insert(r, h);
                }
                self.peak_set = vec![(range, self.root)];
                if self.chunk_count == 0 {
                    self.chunk_count = range.count();
                }
                return Ok(());
            }
            let width = range.count() as u32;
            let sibling = if (range.start / width) % 2 == 0 {
                ChunkRange::new(range.start + width, range.end + width)
            } else {
                ChunkRange::new(range.start - width, range.start - 1)
            };
            let Some(sib_hash) = self.lookup(&sibling) else {
                return Err(TreeError::MissingHash(sibling));
            };
            proven.push((sibling, sib_hash));
            hash = if sibling.start > range.start {
                node_hash(&hash, &sib_hash)
            } else {
                node_hash(&sib_hash, &hash)
            };
            range = ChunkRange::new(range.start.min(sibling.start), range.end.max(sibling.end));
            proven.push((range, hash));
        }
    }

    fn covering(&self, chunk: u32) -> Option<ChunkRange> {
        self.peak_set.iter().map(|(r, _)| *r).find(|r| r.contains(chunk))
    }

    fn lookup(&self, range: &ChunkRange) -> Option<Hash> {
        self.trusted
            .get(range)
            .or_else(|| self.pending.get(range))
            .copied()
    }

    /// Trusted leaf hashes currently known, for sidecar checkpointing.
    pub fn trusted_leaf(&self, chunk: u32) -> Option<Hash> {
        self.trusted.get(&ChunkRange::single(chunk)).copied()
    }

    /// A hash received but not yet proven (for signed-peak validation,
    /// where the signature rather than the root fold vouches for it).
    pub fn pending_hash(&self, range: &ChunkRange) -> Option<Hash> {
        self.pending.get(range).copied()
    }

    /// A hash this side can vouch for: directly trusted, or derivable from
    /// trusted leaves covering the whole subtree. Lets a partial downloader
    /// serve integrity records for the chunks it verified.
    pub fn known_hash(&self, range: &ChunkRange) -> Option<Hash> {
        if let Some(h) = self.trusted.get(range) {
            return Some(*h);
        }
        if range.count() == 1 {
            return None;
        }
        let mid = range.start + (range.count() / 2) as u32;
        let left = self.known_hash(&ChunkRange::new(range.start, mid - 1))?;
        let right = self.known_hash(&ChunkRange::new(mid, range.end))?;
        Some(node_hash(&left, &right))
    }

    /// Prime the verifier from checkpointed leaf hashes. Only leaves in
    /// `have` are trusted; if they cover everything and fold to the root,
    /// the peak set is accepted too.
    pub fn restore(root: Hash, leaves: &[Hash], have: impl Iterator<Item = u32>) -> Self {
        let mut v = Self::new(root);
        let mut count = 0u64;
        for chunk in have {
            if let Some(hash) = leaves.get(chunk as usize) {
                v.trusted.insert(ChunkRange::single(chunk), *hash);
                count += 1;
            }
        }
        if count == leaves.len() as u64 && count > 0 {
            let peak_hashes: Option<Vec<(ChunkRange, Hash)>> = peaks(count)
                .into_iter()
                .map(|p| v.known_hash(&p).map(|h| (p, h)))
                .collect();
            if let Some(set) = peak_hashes {
                if check_peaks(&set, &root).is_ok() {
                    for (r, h) in &set {
                        v.trusted.insert(*r, *h);
                    }
                    v.peak_set = set;
                    v.chunk_count = count;
                }
            }
        }
        v
    }
}

// ── Live peak signatures ─────────────────────────────────────────────────────

/// Signer/verifier for live peak announcements.
///
/// Implements the placeholder "privatedns" scheme: a 20-byte keyed digest
/// over (range, hash, timestamp) under a key derived from the swarm id. A
/// real deployment substitutes an asymmetric scheme here; the record layout
/// does not change, only the signature length taken from the algorithm
/// identifier.
#[derive(Debug, Clone)]
pub struct LiveSigner {
    key: Hash,
}

impl LiveSigner {
    pub fn for_swarm(swarm_id: &Hash) -> Self {
        let mut h = Sha1::new();
        h.update(b"riptide-live-key");
        h.update(swarm_id);
        Self { key: h.finalize().into() }
    }

    pub fn sign(&self, range: &ChunkRange, hash: &Hash, timestamp: u64) -> Vec<u8> {
        let mut h = Sha1::new();
        h.update(self.key);
        h.update(range.start.to_be_bytes());
        h.update(range.end.to_be_bytes());
        h.update(hash);
        h.update(timestamp.to_be_bytes());
        h.finalize().to_vec()
    }

    pub fn verify(
        &self,
        range: &ChunkRange,
        hash: &Hash,
        timestamp: u64,
        signature: &[u8],
    ) -> bool {
        self.sign(range, hash, timestamp) == signature
    }
}

/// For `range` inside `peak`: its sibling and their shared parent.
fn sibling_and_parent(range: ChunkRange, peak: ChunkRange) -> (ChunkRange, ChunkRange) {
    let width = range.count() as u32;
    let base = peak.start;
    let left_of_pair = (range.start - base) / width % 2 == 0;
    if left_of_pair {
        let sibling = ChunkRange::new(range.start + width, range.end + width);
        (sibling, ChunkRange::new(range.start, sibling.end))
    } else {
        let sibling = ChunkRange::new(range.start - width, range.start - 1);
        (sibling, ChunkRange::new(sibling.start, range.end))
    }
}
