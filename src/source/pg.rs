use std::time::Duration;

use ::postgres::types::{FromSql, Type};
use ::postgres::{Client, Config as PgConfig, NoTls, Row, Statement};

use super::{Columns, Connector, RawRow, RowSource, SourceError};

/// Opens one PostgreSQL connection per worker, each with its own prepared
/// population query.
#[derive(Clone)]
pub struct PgConnector {
    config: PgConfig,
    query: String,
    columns: Columns,
}

impl std::fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnector")
            .field("hosts", &self.config.get_hosts())
            .field("dbname", &self.config.get_dbname())
            .field("query", &self.query)
            .finish()
    }
}

impl PgConnector {
    /// Create a connector from a libpq-style `key=value` connection string.
    pub fn new(
        conninfo: &str,
        table: &str,
        columns: Columns,
        connect_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let mut config: PgConfig = conninfo
            .parse()
            .map_err(|e: ::postgres::Error| SourceError::Connect(e.to_string()))?;
        config.connect_timeout(connect_timeout);

        Ok(Self {
            config,
            query: select_query(table, &columns),
            columns,
        })
    }

    /// The SQL each source prepares.
    pub fn query(&self) -> &str {
        &self.query
    }
}

impl Connector for PgConnector {
    type Source = PgSource;

    fn connect(&self, worker: usize) -> Result<PgSource, SourceError> {
        let mut client = self
            .config
            .connect(NoTls)
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        let statement = client
            .prepare(&self.query)
            .map_err(|e| SourceError::Connect(format!("preparing population query: {e}")))?;

        tracing::debug!(worker, "row store connection ready");

        Ok(PgSource {
            client,
            statement,
            columns: self.columns.clone(),
        })
    }
}

/// A worker's connection and prepared statement.
pub struct PgSource {
    client: Client,
    statement: Statement,
    columns: Columns,
}

impl RowSource for PgSource {
    fn fetch(
        &mut self,
        ids: &[u32],
        sink: &mut dyn FnMut(RawRow<'_>),
    ) -> Result<usize, SourceError> {
        // Identifiers are stored as int4.
        let params: Vec<i32> = ids.iter().map(|&id| id as i32).collect();

        let rows = self
            .client
            .query(&self.statement, &[&params])
            .map_err(|e| SourceError::Query(e.to_string()))?;

        let [id_col, time_col, value_col] = self
            .columns
            .resolve(self.statement.columns().iter().map(|c| c.name()))?;

        for row in &rows {
            sink(RawRow {
                identifier: raw_column(row, id_col)?,
                instant: raw_column(row, time_col)?,
                value: raw_column(row, value_col)?,
            });
        }

        Ok(rows.len())
    }
}

/// Build the population query for `table`.
pub fn select_query(table: &str, columns: &Columns) -> String {
    format!(
        "SELECT {id}, {time}, {value} FROM {table} WHERE {id} = ANY($1) ORDER BY {time}",
        id = columns.identifier,
        time = columns.instant,
        value = columns.value,
    )
}

fn raw_column(row: &Row, idx: usize) -> Result<&[u8], SourceError> {
    let raw = row
        .try_get::<_, Option<RawBytes<'_>>>(idx)
        .map_err(|e| SourceError::Query(e.to_string()))?;
    Ok(raw.map_or(&[][..], |r| r.0))
}

/// Borrowed binary column value of any type.
struct RawBytes<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawBytes<'a> {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(RawBytes(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_select_query() {
        let q = select_query("population_00000", &Columns::default());
        assert_eq!(
            q,
            "SELECT mesh_id, datetime, population FROM population_00000 \
             WHERE mesh_id = ANY($1) ORDER BY datetime"
        );
    }

    #[test]
    fn test_new_rejects_bad_conninfo() {
        let err = PgConnector::new(
            "host=localhost port=notaport",
            "t",
            Columns::default(),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "connect");
    }

    #[test]
    fn test_connect_refused() {
        let connector = PgConnector::new(
            "host=127.0.0.1 port=1 user=nobody dbname=none",
            "population_00000",
            Columns::default(),
            Duration::from_secs(1),
        )
        .unwrap();
        let err = connector.connect(0).err().unwrap();
        assert!(matches!(err, SourceError::Connect(_)));
    }
}
