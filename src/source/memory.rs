use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{Connector, RawRow, RowSource, SourceError};
use crate::wire::WireDecoder;

#[derive(Debug, Clone)]
struct StoredRow {
    identifier: Vec<u8>,
    instant: Vec<u8>,
    value: Vec<u8>,
}

impl StoredRow {
    fn id(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.identifier.as_slice().try_into().ok()?;
        Some(i32::from_be_bytes(bytes) as u32)
    }

    fn sort_key(&self) -> i64 {
        self.instant
            .as_slice()
            .try_into()
            .map(i64::from_be_bytes)
            .unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<StoredRow>,
    failing_ids: HashSet<u32>,
    fail_all: bool,
    missing_column: Option<String>,
    refused_workers: HashSet<usize>,
    latency: Duration,
}

/// In-memory row store speaking the same binary layout as PostgreSQL.
///
/// Supports failure injection for exercising batch-drop and connect paths.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    encoder: WireDecoder,
    table: Arc<Table>,
}

impl MemoryConnector {
    /// Empty store encoding timestamps for `encoder`'s timeline.
    pub fn new(encoder: WireDecoder) -> Self {
        Self {
            encoder,
            table: Arc::new(Table::default()),
        }
    }

    /// Add a well-formed row.
    pub fn with_row(self, identifier: u32, instant: DateTime<Utc>, value: i32) -> Self {
        let instant = self.encoder.encode_instant(instant).to_vec();
        self.with_raw_row(
            (identifier as i32).to_be_bytes().to_vec(),
            instant,
            value.to_be_bytes().to_vec(),
        )
    }

    /// Add a row with arbitrary column bytes.
    pub fn with_raw_row(mut self, identifier: Vec<u8>, instant: Vec<u8>, value: Vec<u8>) -> Self {
        Arc::make_mut(&mut self.table).rows.push(StoredRow {
            identifier,
            instant,
            value,
        });
        self
    }

    /// Fail any query whose identifier list contains `id`.
    pub fn failing_id(mut self, id: u32) -> Self {
        Arc::make_mut(&mut self.table).failing_ids.insert(id);
        self
    }

    /// Fail every query.
    pub fn failing_all(mut self) -> Self {
        Arc::make_mut(&mut self.table).fail_all = true;
        self
    }

    /// Return results that lack column `name`.
    pub fn missing_column(mut self, name: &str) -> Self {
        Arc::make_mut(&mut self.table).missing_column = Some(name.to_string());
        self
    }

    /// Refuse the connection for worker `worker`.
    pub fn refusing_worker(mut self, worker: usize) -> Self {
        Arc::make_mut(&mut self.table).refused_workers.insert(worker);
        self
    }

    /// Sleep this long in every fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.table).latency = latency;
        self
    }
}

impl Connector for MemoryConnector {
    type Source = MemorySource;

    fn connect(&self, worker: usize) -> Result<MemorySource, SourceError> {
        if self.table.refused_workers.contains(&worker) {
            return Err(SourceError::Connect(format!(
                "connection refused for worker {worker}"
            )));
        }
        Ok(MemorySource {
            table: Arc::clone(&self.table),
            matched: Vec::new(),
        })
    }
}

/// A handle onto a [`MemoryConnector`]'s rows.
#[derive(Debug)]
pub struct MemorySource {
    table: Arc<Table>,
    matched: Vec<usize>,
}

impl RowSource for MemorySource {
    fn fetch(
        &mut self,
        ids: &[u32],
        sink: &mut dyn FnMut(RawRow<'_>),
    ) -> Result<usize, SourceError> {
        let table = &*self.table;
        if !table.latency.is_zero() {
            std::thread::sleep(table.latency);
        }
        if table.fail_all || ids.iter().any(|id| table.failing_ids.contains(id)) {
            return Err(SourceError::Query("injected query failure".into()));
        }
        if let Some(name) = &table.missing_column {
            return Err(SourceError::MissingColumn(name.clone()));
        }

        self.matched.clear();
        self.matched.extend(
            table
                .rows
                .iter()
                .enumerate()
                .filter(|(_, row)| row.id().is_some_and(|id| ids.contains(&id)))
                .map(|(i, _)| i),
        );
        self.matched.sort_by_key(|&i| table.rows[i].sort_key());

        for &i in &self.matched {
            let row = &table.rows[i];
            sink(RawRow {
                identifier: &row.identifier,
                instant: &row.instant,
                value: &row.value,
            });
        }

        Ok(self.matched.len())
    }
}
