use std::sync::Arc;

use super::chm::{ChmHash, HashError};
use super::IdentifierSpace;

/// A contiguous run of the identifier universe, processed as one unit.
///
/// Batches can only be cut from an [`IdentifierSpace`] by [`Batch::split`],
/// so `global_index(first_identifier) .. + len` is always the batch's exact
/// column span in the output array.
#[derive(Debug, Clone)]
pub struct Batch {
    space: Arc<IdentifierSpace>,
    start: usize,
    len: usize,
}

impl Batch {
    /// Cut the universe into consecutive batches of `size` identifiers.
    /// The final batch may be shorter. A `size` of zero is treated as one.
    pub fn split(space: &Arc<IdentifierSpace>, size: usize) -> impl Iterator<Item = Batch> + '_ {
        let size = size.max(1);
        let total = space.len();
        (0..total).step_by(size).map(move |start| Batch {
            space: Arc::clone(space),
            start,
            len: size.min(total - start),
        })
    }

    /// The batch's identifiers, in universe order.
    pub fn ids(&self) -> &[u32] {
        &self.space.ids()[self.start..self.start + self.len]
    }

    /// Placement anchor: the identifier of the batch's first column.
    pub fn first_identifier(&self) -> u32 {
        self.ids()[0]
    }

    /// Number of identifiers (columns) in the batch.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false for batches produced by [`Batch::split`].
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-batch perfect hash resolving an identifier to its local column.
///
/// Rebuilt for every batch; the key set differs each time.
#[derive(Debug)]
pub struct BatchIndex<'a> {
    keys: &'a [u32],
    hash: ChmHash,
}

impl<'a> BatchIndex<'a> {
    /// Build the index over `keys`. Fails on an empty or duplicated key set.
    pub fn build(keys: &'a [u32], seed: u64) -> Result<Self, HashError> {
        let hash = ChmHash::build(keys, seed)?;
        Ok(Self { keys, hash })
    }

    /// Local column of `id`, or `None` if `id` is not in this batch.
    #[inline]
    pub fn local_index(&self, id: u32) -> Option<usize> {
        let idx = self.hash.index(id);
        (self.keys.get(idx) == Some(&id)).then_some(idx)
    }

    /// Number of keys indexed.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false; an empty index cannot be built.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn space(n: u32) -> Arc<IdentifierSpace> {
        let ids = (0..n).map(|i| 1_000 + i * 7).collect();
        Arc::new(IdentifierSpace::build(ids, 0).unwrap())
    }

    #[test]
    fn test_split_concatenates_to_universe() {
        let space = space(100);
        let batches: Vec<Batch> = Batch::split(&space, 16).collect();

        assert_eq!(batches.len(), 7);
        assert!(batches[..6].iter().all(|b| b.len() == 16));
        assert_eq!(batches[6].len(), 4);

        let joined: Vec<u32> = batches.iter().flat_map(|b| b.ids().to_vec()).collect();
        assert_eq!(joined, space.ids());
    }

    #[test]
    fn test_split_anchor_resolves_to_span_start() {
        let space = space(50);
        let mut expected_offset = 0;
        for batch in Batch::split(&space, 16) {
            assert_eq!(
                space.global_index(batch.first_identifier()),
                Some(expected_offset)
            );
            expected_offset += batch.len();
        }
        assert_eq!(expected_offset, 50);
    }

    #[test]
    fn test_split_exact_multiple() {
        let space = space(32);
        let lens: Vec<usize> = Batch::split(&space, 16).map(|b| b.len()).collect();
        assert_eq!(lens, vec![16, 16]);
    }

    #[test]
    fn test_split_zero_size_is_one() {
        let space = space(3);
        assert_eq!(Batch::split(&space, 0).count(), 3);
    }

    #[test]
    fn test_local_index() {
        let keys = [533_900_011, 533_900_012, 533_900_013, 533_900_014];
        let index = BatchIndex::build(&keys, 0).unwrap();
        assert_eq!(index.len(), 4);
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(index.local_index(k), Some(i));
        }
        assert_eq!(index.local_index(533_900_021), None);
    }

    #[test]
    fn test_local_index_rejects_degenerate_batches() {
        assert!(matches!(BatchIndex::build(&[], 0), Err(HashError::Empty)));
        assert!(matches!(
            BatchIndex::build(&[4, 4], 0),
            Err(HashError::Duplicate(4))
        ));
    }
}
