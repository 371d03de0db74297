use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use employer_linkage::config::LinkageConfig;
use employer_linkage::export::write_summary_json;
use employer_linkage::pipeline::{self, DedupOptions, RunMode};
use employer_linkage::db;

/// Employer entity resolution and ownership hierarchy engine
#[derive(Parser)]
#[command(name = "employer-linkage")]
#[command(version)]
struct Cli {
    /// SQLite store
    #[arg(long, global = true, default_value = "linkage.db")]
    db: PathBuf,

    /// TOML configuration (built-in defaults when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run in verbose mode
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the store and its tables
    Init,

    /// Import entity records for one source from CSV
    Import {
        /// Source name (selects the column mapping)
        source: String,
        csv: PathBuf,
    },

    /// Import registry ownership links from CSV
    ImportLinks { csv: PathBuf },

    /// Score, classify and merge duplicates
    Dedup {
        #[arg(long, value_enum, default_value = "dry-run")]
        mode: ModeArg,

        /// Write retained candidate pairs to this CSV (required with `--mode export`)
        #[arg(long, required_if_eq("mode", "export"))]
        export: Option<PathBuf>,

        /// Only consider records from this source
        #[arg(long)]
        source: Option<String>,

        /// Write the run summary as JSON
        #[arg(long)]
        summary: Option<PathBuf>,

        #[arg(long)]
        string_signal_min: Option<f64>,

        #[arg(long)]
        probabilistic_signal_min: Option<f64>,

        #[arg(long)]
        block_prefix_length: Option<usize>,
    },

    /// Build the cross-registry identifier crosswalk
    Crosswalk,

    /// Resolve ultimate parents per identifier space
    Hierarchy,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    DryRun,
    Apply,
    Export,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::DryRun => RunMode::DryRun,
            ModeArg::Apply => RunMode::Apply,
            ModeArg::Export => RunMode::ExportOnly,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let mut config = LinkageConfig::load(cli.config.as_deref())
        .with_context(|| format!("Failed to load config: {:?}", cli.config))?;

    let conn = db::open(&cli.db).with_context(|| format!("Failed to open store: {}", cli.db.display()))?;

    match cli.command {
        Command::Init => {
            println!("✓ Store ready at {} ({} entities)", cli.db.display(), db::entity_count(&conn)?);
        }
        Command::Import { source, csv } => run_import(&conn, &config, &source, &csv)?,
        Command::ImportLinks { csv } => {
            let (report, stored) = pipeline::import_links(&conn, &csv)
                .with_context(|| format!("Failed to import links: {}", csv.display()))?;
            println!("📂 {} link rows read, {} skipped", report.rows, report.skipped);
            println!("✓ {} inserted, {} already present", stored.inserted, stored.duplicates);
        }
        Command::Dedup {
            mode,
            export,
            source,
            summary,
            string_signal_min,
            probabilistic_signal_min,
            block_prefix_length,
        } => {
            if let Some(v) = string_signal_min {
                config.thresholds.default.string_signal_min = v;
            }
            if let Some(v) = probabilistic_signal_min {
                config.thresholds.default.probabilistic_signal_min = v;
            }
            if let Some(v) = block_prefix_length {
                config.blocking.block_prefix_length = v;
            }
            config.validate().context("Invalid threshold overrides")?;

            let mut options = DedupOptions::new(mode.into());
            if let Some(source) = &source {
                options = options.with_source(source);
            }
            if let Some(path) = &export {
                options = options.with_export(path);
            }

            let run = pipeline::run_dedup(&conn, &config, &options).context("Dedup run failed")?;
            println!("{run}");
            if let Some(path) = &summary {
                write_summary_json(path, &run)
                    .with_context(|| format!("Failed to write summary: {}", path.display()))?;
            }
        }
        Command::Crosswalk => {
            let stats = pipeline::run_crosswalk(&conn, &config).context("Crosswalk failed")?;
            println!("🪪 Crosswalk");
            println!("  exact identifier:  {}", stats.exact_identifier);
            println!("  bridge:            {}", stats.bridge);
            println!("  name + state:      {}", stats.name_jurisdiction);
            println!("  ambiguous skipped: {}", stats.ambiguous_skipped);
            println!("  unlinked:          {}", stats.unlinked);
        }
        Command::Hierarchy => {
            let stats = pipeline::run_hierarchy(&conn, &config).context("Hierarchy resolution failed")?;
            println!("🏢 Hierarchy");
            println!("  edges (registry links): {}", stats.edges_from_links);
            println!("  edges (record parents): {}", stats.edges_from_records);
            println!("  cross-space rejected:   {}", stats.cross_space_rejected);
            println!("  unplaced:               {}", stats.unplaced);
            println!("  cycles truncated:       {}", stats.cycles);
            println!("  hop capped:             {}", stats.hop_capped);
        }
    }

    Ok(())
}

fn run_import(conn: &rusqlite::Connection, config: &LinkageConfig, source: &str, csv: &Path) -> Result<()> {
    println!("📂 Loading {} records from {}...", source, csv.display());
    let summary = pipeline::import_entities(conn, config, source, csv)
        .with_context(|| format!("Failed to import file: {}", csv.display()))?;

    let ingest = &summary.ingest;
    println!("✓ Read {} rows", ingest.rows);
    if ingest.missing_id > 0 {
        println!("  ⚠️  {} rows without an id dropped", ingest.missing_id);
    }
    if ingest.missing_name > 0 {
        println!("  ⚠️  {} rows without a usable name", ingest.missing_name);
    }
    if ingest.bad_weight + ingest.bad_parent > 0 {
        println!("  ⚠️  {} unparseable weights, {} unusable parents", ingest.bad_weight, ingest.bad_parent);
    }
    println!("💾 {} inserted, {} already present", summary.stored.inserted, summary.stored.duplicates);
    Ok(())
}
