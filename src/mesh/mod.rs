//! Identifier universe and perfect-hash column resolution.

pub mod batch;
pub mod chm;
pub mod grid;

use std::path::Path;

use anyhow::{bail, Context, Result};

pub use batch::{Batch, BatchIndex};
pub use chm::{ChmHash, HashError};

/// The full ordered identifier universe with an O(1) id-to-column index.
///
/// Built once at startup and shared read-only (behind an `Arc`) by every
/// pipeline thread for the lifetime of the run.
#[derive(Debug)]
pub struct IdentifierSpace {
    ids: Vec<u32>,
    hash: ChmHash,
}

impl IdentifierSpace {
    /// Build the space and its hash from an ordered identifier list.
    pub fn build(ids: Vec<u32>, seed: u64) -> Result<Self, HashError> {
        let hash = ChmHash::build(&ids, seed)?;
        Ok(Self { ids, hash })
    }

    /// Pair an identifier list with a precomputed hash.
    ///
    /// Every identifier is checked to hash back to its own position, so a
    /// stale or mismatched table is rejected here rather than misplacing
    /// columns later.
    pub fn with_hash(ids: Vec<u32>, hash: ChmHash) -> Result<Self, HashError> {
        if hash.len() != ids.len() {
            return Err(HashError::KeyCountMismatch {
                expected: ids.len(),
                actual: hash.len(),
            });
        }
        for (i, &id) in ids.iter().enumerate() {
            if hash.index(id) != i {
                return Err(HashError::NotInTable(id));
            }
        }
        Ok(Self { ids, hash })
    }

    /// Load the space, using a hash table file when one is configured.
    ///
    /// A configured but unreadable table is an error; it is never silently
    /// replaced by a fresh build.
    pub fn load(ids: Vec<u32>, hash_path: Option<&Path>, seed: u64) -> Result<Self> {
        if ids.is_empty() {
            bail!("identifier list is empty");
        }

        match hash_path {
            Some(path) => {
                let hash = ChmHash::load(path)
                    .with_context(|| format!("loading hash table {}", path.display()))?;
                Self::with_hash(ids, hash)
                    .with_context(|| format!("validating hash table {}", path.display()))
            }
            None => Self::build(ids, seed).context("building identifier hash"),
        }
    }

    /// Column of `id` in the persistent array, or `None` if `id` is not
    /// part of the universe.
    #[inline]
    pub fn global_index(&self, id: u32) -> Option<usize> {
        let idx = self.hash.index(id);
        (self.ids.get(idx) == Some(&id)).then_some(idx)
    }

    /// Identifier stored at column `index`.
    pub fn identifier_at(&self, index: usize) -> Option<u32> {
        self.ids.get(index).copied()
    }

    /// Number of identifiers (`N`).
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the universe is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// All identifiers in column order.
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// The global hash table.
    pub fn hash(&self) -> &ChmHash {
        &self.hash
    }
}

/// Read a newline-separated identifier list. Blank lines and `#` comments
/// are ignored.
pub fn read_id_list(path: &Path) -> Result<Vec<u32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading identifier list {}", path.display()))?;

    let mut ids = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let id = line.parse::<u32>().with_context(|| {
            format!("{}:{}: invalid identifier {line:?}", path.display(), lineno + 1)
        })?;
        ids.push(id);
    }

    Ok(ids)
}
