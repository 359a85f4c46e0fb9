//! Multi-file swarm specification.
//!
//! A multi-file swarm's first logical content is a UTF-8 text document:
//! one header line naming the spec itself and its total size, then one
//! `<path> <size>` line per file, lexicographically sorted by path. The
//! swarm's byte stream is the spec followed by every file in that order,
//! so every file's offset is derivable from the spec alone.

use crate::StoreError;

/// The header line's path token, and the on-disk name of the spec.
pub const SPEC_FILENAME: &str = "META-INF-multifilespec.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiFileSpec {
    /// (posix path, size in bytes), sorted by path.
    entries: Vec<(String, u64)>,
}

/// Where a linear swarm offset lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located<'a> {
    /// Inside the spec document itself.
    Spec { offset: u64 },
    /// Inside a content file.
    File {
        path: &'a str,
        offset: u64,
        remaining_in_file: u64,
    },
}

impl MultiFileSpec {
    /// Build from (path, size) pairs; entries are sorted here.
    pub fn from_entries(mut entries: Vec<(String, u64)>) -> Result<Self, StoreError> {
        for (path, _) in &entries {
            if path.starts_with('/') || path.split('/').any(|c| c == ".." || c.is_empty()) {
                return Err(StoreError::BadSpec(format!("unsafe path {path:?}")));
            }
        }
        entries.sort();
        Ok(Self { entries })
    }

    /// Parse the spec document.
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let mut lines = text.lines();
        let header = lines
            .next()
            .ok_or_else(|| StoreError::BadSpec("empty spec".into()))?;
        let (name, size) = header
            .rsplit_once(' ')
            .ok_or_else(|| StoreError::BadSpec("missing header size".into()))?;
        if name != SPEC_FILENAME {
            return Err(StoreError::BadSpec(format!("bad header name {name:?}")));
        }
        let declared: u64 = size
            .parse()
            .map_err(|_| StoreError::BadSpec(format!("bad header size {size:?}")))?;
        let mut entries = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (path, size) = line
                .rsplit_once(' ')
                .ok_or_else(|| StoreError::BadSpec(format!("bad entry {line:?}")))?;
            let size: u64 = size
                .parse()
                .map_err(|_| StoreError::BadSpec(format!("bad size in {line:?}")))?;
            entries.push((path.to_string(), size));
        }
        let spec = Self::from_entries(entries)?;
        if spec.spec_size() != declared {
            return Err(StoreError::BadSpec(format!(
                "declared size {declared} != computed {}",
                spec.spec_size()
            )));
        }
        Ok(spec)
    }

    /// Sniff whether a swarm's first bytes announce a multi-file spec.
    pub fn is_spec_prefix(data: &[u8]) -> bool {
        data.starts_with(SPEC_FILENAME.as_bytes())
            && data.get(SPEC_FILENAME.len()) == Some(&b' ')
    }

    /// Declared total size parsed out of a (possibly partial) first chunk,
    /// if the header line is complete within it.
    pub fn declared_size(data: &[u8]) -> Option<u64> {
        let newline = data.iter().position(|&b| b == b'\n')?;
        let header = std::str::from_utf8(&data[..newline]).ok()?;
        let (name, size) = header.rsplit_once(' ')?;
        (name == SPEC_FILENAME).then(|| size.parse().ok())?
    }

    pub fn entries(&self) -> &[(String, u64)] {
        &self.entries
    }

    /// Serialized spec document.
    pub fn to_text(&self) -> String {
        let mut text = format!("{} {}\n", SPEC_FILENAME, self.spec_size());
        for (path, size) in &self.entries {
            text.push_str(&format!("{path} {size}\n"));
        }
        text
    }

    /// Size of the spec document in bytes. The header contains the total
    /// size including its own decimal digits, so iterate to a fixed point.
    pub fn spec_size(&self) -> u64 {
        let body: u64 = self
            .entries
            .iter()
            .map(|(path, size)| path.len() as u64 + 1 + decimal_len(*size) + 1)
            .sum();
        let fixed_part = SPEC_FILENAME.len() as u64 + 1 + 1; // name, space, newline
        let mut guess = fixed_part + 1 + body;
        loop {
            let total = fixed_part + decimal_len(guess) + body;
            if total == guess {
                return total;
            }
            guess = total;
        }
    }

    /// Total content size: spec plus all files.
    pub fn total_size(&self) -> u64 {
        self.spec_size() + self.entries.iter().map(|(_, s)| s).sum::<u64>()
    }

    /// Locate a linear swarm offset.
    pub fn locate(&self, offset: u64) -> Option<Located<'_>> {
        let spec_size = self.spec_size();
        if offset < spec_size {
            return Some(Located::Spec { offset });
        }
        let mut base = spec_size;
        for (path, size) in &self.entries {
            if offset < base + size {
                return Some(Located::File {
                    path,
                    offset: offset - base,
                    remaining_in_file: base + size - offset,
                });
            }
            base += size;
        }
        None
    }

    /// Byte range `[start, start+len)` of a named file within the swarm.
    pub fn file_range(&self, path: &str) -> Option<(u64, u64)> {
        let mut base = self.spec_size();
        for (entry_path, size) in &self.entries {
            if entry_path == path {
                return Some((base, *size));
            }
            base += size;
        }
        None
    }
}

fn decimal_len(mut n: u64) -> u64 {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}
