//! Row store access.
//!
//! A [`Connector`] opens one [`RowSource`] per worker. A source runs the
//! "rows for these identifiers, ordered by instant" query and hands each
//! row's raw binary columns to a callback without copying them.

mod memory;
mod pg;

pub use self::memory::{MemoryConnector, MemorySource};
pub use self::pg::{PgConnector, PgSource};

use thiserror::Error;

/// Errors from connecting to or querying the row store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("connecting to row store: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("result has no {0:?} column")]
    MissingColumn(String),
}

impl SourceError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Query(_) => "query",
            Self::MissingColumn(_) => "missing_column",
        }
    }
}

/// One result row in binary send format. NULL columns arrive as empty
/// slices and fail decoding like any other short field.
#[derive(Debug, Clone, Copy)]
pub struct RawRow<'a> {
    pub identifier: &'a [u8],
    pub instant: &'a [u8],
    pub value: &'a [u8],
}

/// A per-worker connection to the row store.
pub trait RowSource: Send {
    /// Fetch every row whose identifier is in `ids`, ordered by instant,
    /// passing each to `sink`. Returns the number of rows delivered.
    ///
    /// On error no rows may have been delivered, or only some; callers
    /// discard the whole batch either way.
    fn fetch(&mut self, ids: &[u32], sink: &mut dyn FnMut(RawRow<'_>))
        -> Result<usize, SourceError>;
}

/// Opens row sources. Shared by reference across the pipeline's setup.
pub trait Connector: Sync {
    type Source: RowSource;

    /// Open the source used by worker `worker`.
    fn connect(&self, worker: usize) -> Result<Self::Source, SourceError>;
}

/// Column names of the population table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Columns {
    pub identifier: String,
    pub instant: String,
    pub value: String,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            identifier: "mesh_id".into(),
            instant: "datetime".into(),
            value: "population".into(),
        }
    }
}

impl Columns {
    /// Positions of the three columns in a result with `names`.
    pub fn resolve<'n>(
        &self,
        names: impl Iterator<Item = &'n str> + Clone,
    ) -> Result<[usize; 3], SourceError> {
        let find = |wanted: &str| {
            names
                .clone()
                .position(|n| n == wanted)
                .ok_or_else(|| SourceError::MissingColumn(wanted.to_string()))
        };
        Ok([
            find(&self.identifier)?,
            find(&self.instant)?,
            find(&self.value)?,
        ])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_columns_any_order() {
        let cols = Columns::default();
        let names = ["population", "mesh_id", "extra", "datetime"];
        assert_eq!(cols.resolve(names.iter().copied()).unwrap(), [1, 3, 0]);
    }

    #[test]
    fn test_resolve_missing_column() {
        let cols = Columns::default();
        let names = ["mesh_id", "population"];
        let err = cols.resolve(names.iter().copied()).unwrap_err();
        assert_eq!(err, SourceError::MissingColumn("datetime".into()));
        assert_eq!(err.kind(), "missing_column");
    }
}
