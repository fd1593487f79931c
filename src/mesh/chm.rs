//! Order-preserving minimal perfect hashing (CHM construction).
//!
//! Each key becomes an edge between two vertices chosen by independently
//! seeded hashes. When the resulting graph is acyclic, vertex values `g`
//! can be assigned so that `(g[h1(k)] + g[h2(k)]) mod n` equals the key's
//! position in the input. Lookups are two hash evaluations and two loads.
//!
//! A built hash serializes to a compact little-endian blob so a large key
//! set can be hashed once and loaded at startup.

use std::collections::HashSet;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Vertex-to-edge ratio. Above 2 the random graph is acyclic with
/// constant probability, so a handful of attempts is enough.
const GRAPH_RATIO: f64 = 2.09;

/// Construction attempts before giving up.
const MAX_ATTEMPTS: usize = 256;

const MAGIC: [u8; 4] = *b"MCHM";
const FORMAT_VERSION: u32 = 1;
/// magic(4) + version(4) + n(4) + m(4) + seed1(8) + seed2(8)
const HEADER_SIZE: usize = 32;

/// Errors from building or loading a perfect hash.
#[derive(Error, Debug)]
pub enum HashError {
    #[error("cannot build a perfect hash over an empty key set")]
    Empty,

    #[error("duplicate key {0}")]
    Duplicate(u32),

    #[error("too many keys: {0}")]
    TooLarge(usize),

    #[error("no acyclic graph found after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error("corrupt hash data: {0}")]
    Corrupt(&'static str),

    #[error("hash data has {actual} keys, expected {expected}")]
    KeyCountMismatch { expected: usize, actual: usize },

    #[error("key {0} does not hash back to its own position")]
    NotInTable(u32),

    #[error("hash data i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// An order-preserving minimal perfect hash over `n` distinct `u32` keys.
#[derive(Clone, PartialEq, Eq)]
pub struct ChmHash {
    n: u32,
    seeds: [u64; 2],
    g: Vec<u32>,
}

impl std::fmt::Debug for ChmHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChmHash")
            .field("n", &self.n)
            .field("m", &self.g.len())
            .finish()
    }
}

impl ChmHash {
    /// Build a hash mapping `keys[i]` to `i`.
    ///
    /// `seed` makes construction deterministic: the same keys and seed
    /// always yield the same table.
    pub fn build(keys: &[u32], seed: u64) -> Result<Self, HashError> {
        if keys.is_empty() {
            return Err(HashError::Empty);
        }
        let n = u32::try_from(keys.len()).map_err(|_| HashError::TooLarge(keys.len()))?;

        let mut seen = HashSet::with_capacity(keys.len());
        for &k in keys {
            if !seen.insert(k) {
                return Err(HashError::Duplicate(k));
            }
        }

        let m = vertex_count(keys.len());
        let mut rng = StdRng::seed_from_u64(seed);

        for _ in 0..MAX_ATTEMPTS {
            let seeds = [rng.gen::<u64>(), rng.gen::<u64>()];
            if let Some(g) = assign(keys, m, seeds) {
                return Ok(Self { n, seeds, g });
            }
        }

        Err(HashError::Exhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Number of keys the hash was built over.
    pub fn len(&self) -> usize {
        self.n as usize
    }

    /// Always false; an empty hash cannot be built.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Position of `key` in the original key list.
    ///
    /// Always in `[0, n)`. For keys outside the build set the result is
    /// arbitrary; callers that may see foreign keys must compare against
    /// the key at the returned position.
    #[inline(always)]
    pub fn index(&self, key: u32) -> usize {
        let m = self.g.len() as u32;
        let a = vertex(key, self.seeds[0], m) as usize;
        let b = vertex(key, self.seeds[1], m) as usize;
        // Both lookups are in range because vertex() reduces modulo m.
        let sum = self.g[a] as u64 + self.g[b] as u64;
        (sum % self.n as u64) as usize
    }

    /// Serialize to the on-disk blob format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.g.len() * 4);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&(self.g.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.seeds[0].to_le_bytes());
        out.extend_from_slice(&self.seeds[1].to_le_bytes());
        for v in &self.g {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse a blob produced by [`ChmHash::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, HashError> {
        if data.len() < HEADER_SIZE {
            return Err(HashError::Corrupt("truncated header"));
        }
        if read_fixed::<4>(data, 0) != MAGIC {
            return Err(HashError::Corrupt("bad magic"));
        }
        if read_u32_le(data, 4) != FORMAT_VERSION {
            return Err(HashError::Corrupt("unsupported version"));
        }

        let n = read_u32_le(data, 8);
        let m = read_u32_le(data, 12) as usize;
        let seeds = [read_u64_le(data, 16), read_u64_le(data, 24)];

        if n == 0 || m <= n as usize {
            return Err(HashError::Corrupt("invalid dimensions"));
        }
        let need = m
            .checked_mul(4)
            .and_then(|body| body.checked_add(HEADER_SIZE))
            .ok_or(HashError::Corrupt("invalid dimensions"))?;
        if data.len() != need {
            return Err(HashError::Corrupt("length does not match dimensions"));
        }

        let mut g = Vec::with_capacity(m);
        for i in 0..m {
            let v = read_u32_le(data, HEADER_SIZE + i * 4);
            if v >= n {
                return Err(HashError::Corrupt("vertex value out of range"));
            }
            g.push(v);
        }

        Ok(Self { n, seeds, g })
    }

    /// Write the blob to `path`.
    pub fn save(&self, path: &Path) -> Result<(), HashError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Read a blob from `path`.
    pub fn load(path: &Path) -> Result<Self, HashError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }
}

fn vertex_count(n: usize) -> u32 {
    // n <= u32::MAX is checked by the caller; the product stays well within f64.
    let m = (n as f64 * GRAPH_RATIO).ceil() as u64;
    m.max(n as u64 + 1).min(u32::MAX as u64) as u32
}

/// Seeded 64-bit finalizer (splitmix64) reduced onto `[0, m)`.
#[inline(always)]
fn vertex(key: u32, seed: u64, m: u32) -> u32 {
    let mut x = (key as u64) ^ seed;
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    (x % m as u64) as u32
}

/// Try to assign vertex values for one pair of seeds.
///
/// Returns `None` if the key graph has a self-loop or a cycle.
fn assign(keys: &[u32], m: u32, seeds: [u64; 2]) -> Option<Vec<u32>> {
    let n = keys.len();
    let vertices = m as usize;

    let mut ends = Vec::with_capacity(n);
    let mut degree = vec![0u32; vertices + 1];
    for &k in keys {
        let a = vertex(k, seeds[0], m);
        let b = vertex(k, seeds[1], m);
        if a == b {
            return None;
        }
        degree[a as usize] += 1;
        degree[b as usize] += 1;
        ends.push((a, b));
    }

    // Compressed adjacency: offsets[v]..offsets[v + 1] indexes `adj`.
    let mut offsets = vec![0usize; vertices + 1];
    for v in 0..vertices {
        offsets[v + 1] = offsets[v] + degree[v] as usize;
    }
    let mut fill = offsets.clone();
    let mut adj = vec![(0u32, 0u32); 2 * n];
    for (edge, &(a, b)) in ends.iter().enumerate() {
        adj[fill[a as usize]] = (b, edge as u32);
        fill[a as usize] += 1;
        adj[fill[b as usize]] = (a, edge as u32);
        fill[b as usize] += 1;
    }

    let n32 = n as u32;
    let mut g = vec![0u32; vertices];
    let mut visited = vec![false; vertices];
    let mut edge_used = vec![false; n];
    let mut stack = Vec::new();

    for root in 0..vertices {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        stack.push(root);

        while let Some(u) = stack.pop() {
            for &(v, edge) in &adj[offsets[u]..offsets[u + 1]] {
                if edge_used[edge as usize] {
                    continue;
                }
                edge_used[edge as usize] = true;

                let v = v as usize;
                if visited[v] {
                    return None;
                }
                visited[v] = true;
                // g[u] + g[v] == edge (mod n)
                g[v] = (edge + n32 - g[u]) % n32;
                stack.push(v);
            }
        }
    }

    Some(g)
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&data[offset..offset + N]);
    buf
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}
