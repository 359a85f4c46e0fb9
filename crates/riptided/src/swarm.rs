//! Swarm state and the pieces the manager operates on: the tswift URL,
//! download status, rate limiting, and the per-swarm transfer record tying
//! storage, tree state, and channels together.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Instant;

use riptide_core::bin::ChunkRange;
use riptide_core::binmap::Binmap;
use riptide_core::merkle::{Hash, HashTree, LiveSigner, Verifier};
use riptide_core::SwarmId;
use riptide_store::live::LiveStorage;
use riptide_store::storage::SwarmStorage;
use thiserror::Error;

/// Download status values reported on INFO lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DlStatus {
    AllocatingDiskspace = 0,
    WaitingForHashcheck = 1,
    Hashchecking = 2,
    Downloading = 3,
    Seeding = 4,
    Stopped = 5,
    StoppedOnError = 6,
}

// ── tswift URLs ──────────────────────────────────────────────────────────────

/// A parsed `tswift:` start URL.
///
/// `tswift://host:port/<hexroot>[/<file>][@<discard>]` dials the tracker;
/// the single-slash form `tswift:/<hexroot>` starts trackerless. A discard
/// window of `-1` declares the swarm live with an unbounded window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmUrl {
    pub tracker: Option<SocketAddr>,
    pub root: SwarmId,
    pub subpath: Option<String>,
    pub live: bool,
    pub discard_window: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("not a tswift url")]
    BadScheme,
    #[error("cannot resolve tracker {0:?}")]
    BadTracker(String),
    #[error("bad root hash {0:?}")]
    BadRoot(String),
}

impl SwarmUrl {
    pub fn parse(url: &str) -> Result<Self, UrlError> {
        let rest = url
            .strip_prefix("tswift:")
            .ok_or(UrlError::BadScheme)?;

        let (tracker, path) = if let Some(after) = rest.strip_prefix("//") {
            let (host, path) = after
                .split_once('/')
                .ok_or_else(|| UrlError::BadRoot(after.to_string()))?;
            let addr = host
                .to_socket_addrs()
                .ok()
                .and_then(|mut it| it.next())
                .ok_or_else(|| UrlError::BadTracker(host.to_string()))?;
            (Some(addr), path)
        } else if let Some(path) = rest.strip_prefix('/') {
            (None, path)
        } else {
            return Err(UrlError::BadScheme);
        };

        // Trailing @<discard> applies to the whole path.
        let (path, discard) = match path.rsplit_once('@') {
            Some((p, d)) => {
                let n: i64 = d
                    .parse()
                    .map_err(|_| UrlError::BadRoot(path.to_string()))?;
                (p, Some(n))
            }
            None => (path, None),
        };

        let (hexroot, subpath) = match path.split_once('/') {
            Some((h, s)) if !s.is_empty() => (h, Some(s.to_string())),
            Some((h, _)) => (h, None),
            None => (path, None),
        };
        let root = riptide_core::parse_swarm_id(hexroot)
            .ok_or_else(|| UrlError::BadRoot(hexroot.to_string()))?;

        let (live, discard_window) = match discard {
            Some(-1) => (true, None),
            Some(n) if n >= 0 => (true, Some(n as u64)),
            Some(_) => (true, None),
            None => (false, None),
        };

        Ok(SwarmUrl {
            tracker,
            root,
            subpath,
            live,
            discard_window,
        })
    }
}

// ── Rate limiting ────────────────────────────────────────────────────────────

/// Token bucket; rate 0 means unlimited.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn unlimited() -> Self {
        Self {
            rate: 0.0,
            tokens: 0.0,
            last: Instant::now(),
        }
    }

    pub fn set_rate(&mut self, bytes_per_sec: f64) {
        self.rate = bytes_per_sec.max(0.0);
        self.tokens = 0.0;
        self.last = Instant::now();
    }

    pub fn is_limited(&self) -> bool {
        self.rate > 0.0
    }

    /// Try to take `n` bytes worth of tokens; refills lazily. Burst is
    /// capped at one second of rate.
    pub fn take(&mut self, n: usize, now: Instant) -> bool {
        if self.rate <= 0.0 {
            return true;
        }
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        if self.tokens >= n as f64 {
            self.tokens -= n as f64;
            true
        } else {
            false
        }
    }
}

// ── Tree state ───────────────────────────────────────────────────────────────

/// A swarm either serves from a complete tree or verifies into a partial
/// one. Live sources keep a growing `Seed` tree; live downloaders a
/// `Leech` verifier fed by signed peaks.
#[derive(Debug)]
pub enum SwarmTree {
    Seed(HashTree),
    Leech(Verifier),
}

impl SwarmTree {
    /// Chunk count as far as this side knows it (0 = not yet discovered).
    pub fn chunk_count(&self) -> u64 {
        match self {
            SwarmTree::Seed(tree) => tree.chunk_count(),
            SwarmTree::Leech(v) => v.chunk_count(),
        }
    }

    /// A hash this side can send in an INTEGRITY record.
    pub fn hash_for(&self, range: &ChunkRange) -> Option<Hash> {
        match self {
            SwarmTree::Seed(tree) => Some(tree.hash_of(*range)),
            SwarmTree::Leech(v) => v.known_hash(range),
        }
    }

    pub fn peak_hashes(&self) -> Vec<(ChunkRange, Hash)> {
        match self {
            SwarmTree::Seed(tree) => tree.peak_hashes(),
            SwarmTree::Leech(v) => v.peak_set().to_vec(),
        }
    }
}

// ── Content backing ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SwarmContent {
    /// Static content backed by file storage.
    Stored(SwarmStorage),
    /// Live chunk log (source or receiver).
    Live(LiveStorage),
    /// Downloader that has not yet learned the content size.
    Pending,
}

// ── The swarm record ─────────────────────────────────────────────────────────

/// Everything the engine tracks per swarm. Channels are referenced by id
/// into the engine's channel registry, never owned here.
#[derive(Debug)]
pub struct Swarm {
    pub id: SwarmId,
    pub chunk_size: usize,
    pub status: DlStatus,
    pub dest_dir: PathBuf,
    /// Single-file content path; multi-file swarms convert under its parent.
    pub content_path: PathBuf,
    pub content: SwarmContent,
    pub tree: SwarmTree,
    pub have: Binmap,
    /// Chunks requested on some channel and not yet received.
    pub requested: Binmap,
    pub channels: Vec<u32>,
    pub tracker: Option<SocketAddr>,
    pub live: bool,
    pub discard_window: Option<u64>,
    pub signer: Option<LiveSigner>,
    /// Latest signed peak set of a live source/receiver:
    /// (range, hash, timestamp, signature).
    pub signed_peaks: Vec<(ChunkRange, Hash, u64, Vec<u8>)>,
    pub up_bucket: TokenBucket,
    pub down_bucket: TokenBucket,
    pub moreinfo: bool,
    /// Exact content byte size, once known (short last chunk observed or
    /// known from attach).
    pub exact_size: Option<u64>,
    // Periodic speed accounting.
    pub bytes_up_total: u64,
    pub bytes_down_total: u64,
    pub up_speed: f64,
    pub down_speed: f64,
    pub last_accounted: (u64, u64),
    pub play_sent: bool,
}

impl Swarm {
    /// Known total content size in bytes ("dynasize"): exact when known,
    /// otherwise chunk-count derived, 0 while undiscovered.
    pub fn dynasize(&self) -> u64 {
        if let Some(size) = self.exact_size {
            return size;
        }
        match &self.content {
            SwarmContent::Stored(s) => s.size(),
            SwarmContent::Live(l) => l.size(),
            SwarmContent::Pending => self.tree.chunk_count() * self.chunk_size as u64,
        }
    }

    /// Sequentially complete bytes from the start ("seqcomp").
    pub fn seq_complete(&self) -> u64 {
        let prefix_chunks = u64::from(self.have.filled_prefix());
        let total = self.dynasize();
        (prefix_chunks * self.chunk_size as u64).min(total)
    }

    /// True once every chunk is present.
    pub fn is_complete(&self) -> bool {
        let count = self.tree.chunk_count();
        count > 0 && self.have.coverage() >= count
    }

    /// Expected length of `chunk`, given what is known about the size.
    pub fn chunk_len(&self, chunk: u32) -> Option<usize> {
        let count = self.tree.chunk_count();
        if count == 0 || u64::from(chunk) >= count {
            return None;
        }
        let total = self.dynasize();
        let start = u64::from(chunk) * self.chunk_size as u64;
        Some(((total - start).min(self.chunk_size as u64)) as usize)
    }

}
