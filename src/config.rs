use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;

use crate::mesh::{grid, read_id_list};
use crate::pipeline::PipelineOptions;
use crate::source::Columns;
use crate::store::ArrayShape;
use crate::timeline::{Timeline, DEFAULT_BUCKETS, DEFAULT_REFERENCE};
use crate::wire::WireDecoder;

/// Environment variables that fill unset row store fields.
pub const ENV_DB_HOST: &str = "MOBAKU_DB_HOST";
pub const ENV_DB_PORT: &str = "MOBAKU_DB_PORT";
pub const ENV_DB_USER: &str = "MOBAKU_DB_USER";
pub const ENV_DB_PASSWORD: &str = "MOBAKU_DB_PASSWORD";
pub const ENV_DB_NAME: &str = "MOBAKU_DB_NAME";

/// Top-level configuration for an ingestion run.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Row store connection and query configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Identifier universe configuration.
    #[serde(default)]
    pub identifiers: IdentifiersConfig,

    /// Hourly timeline configuration.
    #[serde(default)]
    pub timeline: TimelineConfig,

    /// Output array configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Worker pool and queue configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Row store connection and query configuration.
#[derive(Clone, Deserialize)]
pub struct SourceConfig {
    /// Database host. Falls back to MOBAKU_DB_HOST.
    #[serde(default)]
    pub host: String,

    /// Database port. Falls back to MOBAKU_DB_PORT, then 5432.
    #[serde(default)]
    pub port: Option<u16>,

    /// Database user. Falls back to MOBAKU_DB_USER.
    #[serde(default)]
    pub user: String,

    /// Database password. Falls back to MOBAKU_DB_PASSWORD.
    #[serde(default)]
    pub password: String,

    /// Database name. Falls back to MOBAKU_DB_NAME.
    #[serde(default)]
    pub dbname: String,

    /// Population table. Default: "population_00000".
    #[serde(default = "default_table")]
    pub table: String,

    /// Identifier column. Default: "mesh_id".
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Timestamp column. Default: "datetime".
    #[serde(default = "default_time_column")]
    pub time_column: String,

    /// Population value column. Default: "population".
    #[serde(default = "default_value_column")]
    pub value_column: String,

    /// Per-connection timeout. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Identifier universe configuration. Exactly one of `first_mesh` and
/// `path` must be set.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct IdentifiersConfig {
    /// Enumerate every half-mesh cell of this 4-digit 1st-mesh.
    #[serde(default)]
    pub first_mesh: Option<u32>,

    /// Newline-separated identifier list.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Precomputed hash table written by `build-index`.
    #[serde(default)]
    pub hash_path: Option<PathBuf>,

    /// Seed for hash construction. Default: 0.
    #[serde(default)]
    pub hash_seed: u64,
}

/// Hourly timeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineConfig {
    /// Bucket 0 on the source wall clock. Default: "2016-01-01 00:00:00".
    #[serde(default = "default_reference")]
    pub reference: String,

    /// Fixed offset of the source wall clock east of UTC. Default: 9h.
    #[serde(default = "default_utc_offset", with = "humantime_serde")]
    pub utc_offset: Duration,

    /// Number of hourly buckets (`T`). Default: 74160.
    #[serde(default = "default_buckets")]
    pub buckets: usize,
}

/// Output array configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Array file path. Default: "population.mpca".
    #[serde(default = "default_output_path")]
    pub path: PathBuf,

    /// Rows per chunk. Default: 8760 (one year of hours).
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,

    /// Columns per chunk. Default: 16.
    #[serde(default = "default_chunk_cols")]
    pub chunk_cols: usize,

    /// Value of cells never written. Default: 0.
    #[serde(default)]
    pub fill_value: i32,
}

/// Worker pool and queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Producer threads. Default: 32.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Identifiers per batch. Default: 16.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Capacity of the work and output queues. Default: 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// CPU cores to pin producers to, round-robin. Default: none.
    #[serde(default)]
    pub pin_cores: Vec<usize>,

    /// Interval between progress log lines. Default: 10s.
    #[serde(default = "default_progress_interval", with = "humantime_serde")]
    pub progress_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address, e.g. ":9090". Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_table() -> String {
    "population_00000".to_string()
}

fn default_id_column() -> String {
    "mesh_id".to_string()
}

fn default_time_column() -> String {
    "datetime".to_string()
}

fn default_value_column() -> String {
    "population".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reference() -> String {
    DEFAULT_REFERENCE.to_string()
}

fn default_utc_offset() -> Duration {
    Duration::from_secs(9 * 3600)
}

fn default_buckets() -> usize {
    DEFAULT_BUCKETS
}

fn default_output_path() -> PathBuf {
    PathBuf::from("population.mpca")
}

fn default_chunk_rows() -> usize {
    365 * 24
}

fn default_chunk_cols() -> usize {
    16
}

fn default_workers() -> usize {
    32
}

fn default_batch_size() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(10)
}

const DEFAULT_PORT: u16 = 5432;

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            identifiers: IdentifiersConfig::default(),
            timeline: TimelineConfig::default(),
            output: OutputConfig::default(),
            pipeline: PipelineConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            user: String::new(),
            password: String::new(),
            dbname: String::new(),
            table: default_table(),
            id_column: default_id_column(),
            time_column: default_time_column(),
            value_column: default_value_column(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            reference: default_reference(),
            utc_offset: default_utc_offset(),
            buckets: default_buckets(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            chunk_rows: default_chunk_rows(),
            chunk_cols: default_chunk_cols(),
            fill_value: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            pin_cores: Vec::new(),
            progress_interval: default_progress_interval(),
        }
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port())
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("table", &self.table)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

// --- Validation and loading ---

impl Config {
    /// Log filter to use: `cli` when given, else the configured level.
    pub fn log_level<'a>(&'a self, cli: Option<&'a str>) -> &'a str {
        cli.unwrap_or(&self.log_level)
    }

    /// Load configuration from a YAML file, fill unset row store fields
    /// from the environment, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.source.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    ///
    /// Row store credentials are checked separately by
    /// [`SourceConfig::validate_credentials`], since `build-index` never
    /// connects.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("source.id_column", &self.source.id_column),
            ("source.time_column", &self.source.time_column),
            ("source.value_column", &self.source.value_column),
        ] {
            if !is_sql_identifier(value) {
                bail!("{key} must be a plain SQL identifier, got {value:?}");
            }
        }
        if !self.source.table.split('.').all(is_sql_identifier) {
            bail!(
                "source.table must be a plain or schema-qualified SQL identifier, got {:?}",
                self.source.table
            );
        }

        match (self.identifiers.first_mesh, &self.identifiers.path) {
            (Some(_), Some(_)) => {
                bail!("identifiers.first_mesh and identifiers.path are mutually exclusive")
            }
            (None, None) => bail!("one of identifiers.first_mesh or identifiers.path is required"),
            (Some(m), None) if !(1000..=9999).contains(&m) => {
                bail!("identifiers.first_mesh must be a 4-digit mesh code, got {m}")
            }
            _ => {}
        }

        if self.timeline.buckets == 0 {
            bail!("timeline.buckets must be positive");
        }
        self.timeline.build().context("invalid timeline section")?;

        if self.output.path.as_os_str().is_empty() {
            bail!("output.path is required");
        }
        if self.output.chunk_rows == 0 || self.output.chunk_cols == 0 {
            bail!("output.chunk_rows and output.chunk_cols must be positive");
        }

        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be positive");
        }
        if self.pipeline.batch_size == 0 {
            bail!("pipeline.batch_size must be positive");
        }
        if self.pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be positive");
        }
        if self.pipeline.progress_interval.is_zero() {
            bail!("pipeline.progress_interval must be positive");
        }

        Ok(())
    }

    /// Pipeline options for this configuration.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            workers: self.pipeline.workers,
            batch_size: self.pipeline.batch_size,
            queue_capacity: self.pipeline.queue_capacity,
            hash_seed: self.identifiers.hash_seed,
            pin_cores: self.pipeline.pin_cores.clone(),
            progress_interval: self.pipeline.progress_interval,
        }
    }
}

impl SourceConfig {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Fill unset connection fields from `lookup` (normally the process
    /// environment). Fields set in YAML win.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (field, key) in [
            (&mut self.host, ENV_DB_HOST),
            (&mut self.user, ENV_DB_USER),
            (&mut self.password, ENV_DB_PASSWORD),
            (&mut self.dbname, ENV_DB_NAME),
        ] {
            if field.is_empty() {
                if let Some(value) = lookup(key) {
                    *field = value;
                }
            }
        }

        if self.port.is_none() {
            if let Some(value) = lookup(ENV_DB_PORT) {
                let port = value
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("{ENV_DB_PORT} is not a valid port: {value:?}"))?;
                self.port = Some(port);
            }
        }

        Ok(())
    }

    /// Check the fields needed to connect.
    pub fn validate_credentials(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("source.host is required (or set {ENV_DB_HOST})");
        }
        if self.user.is_empty() {
            bail!("source.user is required (or set {ENV_DB_USER})");
        }
        if self.dbname.is_empty() {
            bail!("source.dbname is required (or set {ENV_DB_NAME})");
        }
        Ok(())
    }

    /// Build a libpq-style connection string
    /// (host=.. port=.. dbname=.. user=.. password=..).
    pub fn conninfo(&self) -> String {
        let port = self.port().to_string();
        let pairs = [
            ("host", self.host.as_str()),
            ("port", port.as_str()),
            ("dbname", self.dbname.as_str()),
            ("user", self.user.as_str()),
            ("password", self.password.as_str()),
        ];

        let mut conninfo = String::new();
        for (key, value) in pairs {
            if !conninfo.is_empty() {
                conninfo.push(' ');
            }
            conninfo.push_str(key);
            conninfo.push('=');
            push_conninfo_value(&mut conninfo, value);
        }

        conninfo
    }

    /// Column names the population query selects.
    pub fn columns(&self) -> Columns {
        Columns {
            identifier: self.id_column.clone(),
            instant: self.time_column.clone(),
            value: self.value_column.clone(),
        }
    }
}

impl IdentifiersConfig {
    /// Resolve the ordered identifier universe.
    pub fn load_ids(&self) -> Result<Vec<u32>> {
        match (self.first_mesh, &self.path) {
            (Some(first_mesh), None) => grid::first_mesh_cells(first_mesh),
            (None, Some(path)) => read_id_list(path),
            _ => bail!("exactly one of identifiers.first_mesh or identifiers.path is required"),
        }
    }
}

impl TimelineConfig {
    /// The configured source clock offset.
    pub fn offset(&self) -> Result<FixedOffset> {
        let secs = i32::try_from(self.utc_offset.as_secs())
            .ok()
            .filter(|_| self.utc_offset.subsec_nanos() == 0)
            .context("timeline.utc_offset must be a whole number of seconds")?;

        FixedOffset::east_opt(secs)
            .with_context(|| format!("timeline.utc_offset out of range: {secs}s"))
    }

    /// Build the bucketing timeline.
    pub fn build(&self) -> Result<Timeline> {
        let offset = self.offset()?;
        Timeline::new(&self.reference, offset, self.buckets)
            .with_context(|| format!("parsing timeline.reference {:?}", self.reference))
    }

    /// Row decoder interpreting timestamps on the same clock.
    pub fn decoder(&self) -> Result<WireDecoder> {
        Ok(WireDecoder::new(self.offset()?))
    }
}

impl OutputConfig {
    /// Array shape for `rows` buckets by `cols` identifiers.
    pub fn shape(&self, rows: usize, cols: usize) -> Result<ArrayShape> {
        ArrayShape::new(rows, cols, self.chunk_rows, self.chunk_cols, self.fill_value)
            .context("invalid output array shape")
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Single-quote values that are empty or contain spaces, quotes, or
// backslashes, escaping the latter two.
fn push_conninfo_value(out: &mut String, value: &str) {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        out.push_str(value);
        return;
    }

    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
}
