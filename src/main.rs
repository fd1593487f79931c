use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshpop::config::Config;
use meshpop::export::health::HealthMetrics;
use meshpop::mesh::{grid, IdentifierSpace};
use meshpop::pipeline::Pipeline;
use meshpop::source::PgConnector;
use meshpop::store::ChunkedFile;

/// Ingest hourly mesh population rows into a dense chunked array.
#[derive(Parser)]
#[command(name = "meshpop", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "MESHPOP_CONFIG")]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion pipeline (the default).
    Run,

    /// Build the identifier hash table and write it to disk.
    BuildIndex {
        /// Output path. Defaults to identifiers.hash_path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the half-mesh cell containing a coordinate.
    Cell {
        /// Longitude in degrees.
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Latitude in degrees.
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that need neither logging nor config.
    match &cli.command {
        Some(Command::Version) => {
            println!("meshpop {}", version::full());
            return Ok(());
        }
        Some(Command::Cell { lon, lat }) => return print_cell(*lon, *lat),
        _ => {}
    }

    let config_path = cli
        .config
        .as_deref()
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing.
    let level = cfg.log_level(cli.log_level.as_deref());
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting meshpop",
    );

    match cli.command {
        Some(Command::BuildIndex { output }) => build_index(&cfg, output.as_deref()),
        _ => run(&cfg),
    }
}

fn print_cell(lon: f64, lat: f64) -> Result<()> {
    let Some(id) = grid::cell_at(lon, lat) else {
        bail!("coordinate ({lon}, {lat}) is outside the standard grid");
    };
    let center = grid::cell_center(id).context("computing cell center")?;
    println!("{id}\t{:.6}\t{:.6}", center.lon, center.lat);
    Ok(())
}

fn build_index(cfg: &Config, output: Option<&Path>) -> Result<()> {
    let path = output
        .or(cfg.identifiers.hash_path.as_deref())
        .context("no output path: pass --output or set identifiers.hash_path")?;

    let started = Instant::now();
    let ids = cfg.identifiers.load_ids()?;
    let space = IdentifierSpace::build(ids, cfg.identifiers.hash_seed)
        .context("building identifier hash")?;
    space
        .hash()
        .save(path)
        .with_context(|| format!("writing hash table {}", path.display()))?;

    info!(
        identifiers = space.len(),
        path = %path.display(),
        elapsed = ?started.elapsed(),
        "hash table written",
    );

    Ok(())
}

fn run(cfg: &Config) -> Result<()> {
    let metrics =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

    // The runtime only hosts the metrics server; ingestion runs on plain
    // threads owned by the pipeline.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    // 0. Start health metrics server.
    rt.block_on(metrics.start())
        .context("starting health metrics server")?;

    // 1. Resolve the identifier universe.
    let started = Instant::now();
    let ids = cfg.identifiers.load_ids()?;
    let space = IdentifierSpace::load(
        ids,
        cfg.identifiers.hash_path.as_deref(),
        cfg.identifiers.hash_seed,
    )?;
    let space = Arc::new(space);
    metrics
        .setup_duration
        .with_label_values(&["identifiers"])
        .set(started.elapsed().as_secs_f64());
    info!(identifiers = space.len(), "identifier space ready");

    // 2. Timeline and row decoder share the configured clock offset.
    let timeline = cfg.timeline.build()?;
    let decoder = cfg.timeline.decoder()?;

    // 3. Row store connector. Connections open inside the pipeline.
    cfg.source.validate_credentials()?;
    let connector = PgConnector::new(
        &cfg.source.conninfo(),
        &cfg.source.table,
        cfg.source.columns(),
        cfg.source.connect_timeout,
    )
    .context("configuring row store connection")?;

    // 4. Create the output array.
    let shape = cfg.output.shape(timeline.buckets(), space.len())?;
    let mut store = ChunkedFile::create(&cfg.output.path, shape, space.ids())
        .with_context(|| format!("creating output array {}", cfg.output.path.display()))?;
    info!(
        path = %cfg.output.path.display(),
        rows = shape.rows,
        cols = shape.cols,
        chunk_rows = shape.chunk_rows,
        chunk_cols = shape.chunk_cols,
        "output array created",
    );

    // 5. Run to completion.
    let pipeline = Pipeline::new(
        Arc::clone(&space),
        timeline,
        decoder,
        cfg.pipeline_options(),
        Arc::clone(&metrics),
    );
    let result = pipeline.run(&connector, &mut store);

    rt.block_on(metrics.stop())?;

    let report = result?;
    if !report.is_complete() {
        warn!(
            dropped = report.batches_dropped(),
            batches = report.batches,
            "some batches were dropped; their columns hold the fill value",
        );
    }

    info!("meshpop finished");

    Ok(())
}
