//! CLI entry point for the defect knowledge base.
//!
//! Thin wrapper over `KnowledgeBase`: loads settings, installs logging, opens
//! the store and dispatches one command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bugscout::display::{
    THEME, create_consistency_table, create_results_table, create_stats_table,
    create_write_report_table, skipped_facets,
};
use bugscout::{
    DefectRecord, Facet, FastEmbedGenerator, KbError, KnowledgeBase, ProfileName, RowId,
    Settings, TextQuery, WeightOverride,
};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use serde::Deserialize;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Find past defect reports similar to a new one
#[derive(Parser)]
#[command(
    name = "bugscout",
    version = env!("CARGO_PKG_VERSION"),
    about = "Multi-facet similarity search over historical defect reports",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set up .bugscout directory with default configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Embed and add defect records from a JSON file (one object or an array)
    Add { file: PathBuf },

    /// Search for similar defects
    #[command(
        after_help = "Examples:\n  bugscout search --summary \"app crashes on login\"\n  bugscout search --summary \"crash\" --log \"NullPointerException\" --limit 10\n  bugscout search --log \"timeout\" --profile mixed --json"
    )]
    Search {
        #[arg(long)]
        summary: Option<String>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        test_steps: Option<String>,
        #[arg(long)]
        expected: Option<String>,
        #[arg(long)]
        actual: Option<String>,
        #[arg(long)]
        log: Option<String>,
        #[arg(long)]
        env: Option<String>,

        /// Number of results (defaults to search.default_results)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Weight profile instead of the one picked from the query
        #[arg(short, long)]
        profile: Option<ProfileName>,

        #[arg(long)]
        json: bool,
    },

    /// Record counts and per-facet index health
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Check that every indexed row has a metadata entry
    Verify {
        #[arg(long)]
        json: bool,
    },

    /// Rebuild facet indices from their current snapshots
    Rebuild {
        /// Only this facet
        #[arg(long)]
        facet: Option<Facet>,
    },

    /// Re-embed every active record and rebuild all indices from scratch
    Reindex,

    /// Exclude a record from search results (row id or identifier)
    Retire { record: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordInput {
    Many(Vec<DefectRecord>),
    One(Box<DefectRecord>),
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("{}", THEME.error_with_icon(&format!("{err:#}")));
        if let Some(kb_err) = err.downcast_ref::<KbError>() {
            for suggestion in kb_err.recovery_suggestions() {
                eprintln!("  {}", THEME.apply(&THEME.dim, suggestion));
            }
        }
        std::process::exit(1);
    }
}

fn load_settings(config: Option<&Path>) -> Result<Settings> {
    let settings = match config {
        Some(path) => Settings::load_from(path).map_err(|e| {
            anyhow::anyhow!("loading configuration from {}: {e}", path.display())
        })?,
        None => Settings::load().map_err(|e| anyhow::anyhow!("loading configuration: {e}"))?,
    };
    Ok(settings)
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bugscout={default_level},warn")));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn open_kb(settings: Settings, with_embedder: bool) -> Result<KnowledgeBase> {
    let embedding = settings.embedding.clone();
    let kb = KnowledgeBase::open(settings).context("opening knowledge base")?;
    if !with_embedder {
        return Ok(kb);
    }

    let generator = FastEmbedGenerator::new(&embedding.model, embedding.cache_dir)
        .map_err(KbError::from)
        .context("loading embedding model")?;
    Ok(kb.with_embedder(Arc::new(generator))?)
}

fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_deref())?;
    init_logging(settings.debug);
    debug!(data_dir = %settings.data_path().display(), "settings loaded");

    match cli.command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("creating configuration file")?;
            println!(
                "{}",
                THEME.success_with_icon(&format!("Created configuration at {}", path.display()))
            );
        }

        Commands::Config => {
            let toml_str =
                toml::to_string_pretty(&settings).context("serializing configuration")?;
            println!("{toml_str}");
        }

        Commands::Add { file } => {
            let raw = std::fs::read_to_string(&file)
                .map_err(|source| KbError::FileRead {
                    path: file.clone(),
                    source,
                })?;
            let records = match serde_json::from_str::<RecordInput>(&raw)
                .with_context(|| format!("parsing records from {}", file.display()))?
            {
                RecordInput::Many(records) => records,
                RecordInput::One(record) => vec![*record],
            };
            if records.is_empty() {
                bail!("{} contains no records", file.display());
            }

            let kb = open_kb(settings, true)?;
            let report = kb.add_records_text(records)?;
            println!("{}", create_write_report_table(&report));
            let added = format!("Added {} record(s)", report.row_ids.len());
            if report.is_complete() {
                println!("{}", THEME.success_with_icon(&added));
            } else {
                println!(
                    "{}",
                    THEME.warning_with_icon(&format!(
                        "{added}, {} facet(s) failed",
                        report.failed_facets().len()
                    ))
                );
            }
        }

        Commands::Search {
            summary,
            code,
            test_steps,
            expected,
            actual,
            log,
            env,
            limit,
            profile,
            json,
        } => {
            let query = TextQuery {
                summary,
                code,
                test_steps,
                expected_result: expected,
                actual_result: actual,
                log_info: log,
                environment: env,
            };
            if query.is_empty() {
                bail!("supply at least one query field, e.g. --summary \"app crashes on login\"");
            }

            let threshold = settings.search.similarity_threshold;
            let limit = limit.unwrap_or(settings.search.default_results);
            let weights = profile.map_or(WeightOverride::Auto, WeightOverride::Profile);

            let kb = open_kb(settings, true)?;
            let response = kb.search_text(&query, &weights, limit)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }

            for line in skipped_facets(&response) {
                eprintln!("{}", THEME.warning_with_icon(&line));
            }
            if response.hits.is_empty() {
                println!("No similar defects found");
                return Ok(());
            }
            if let Some(profile) = response.profile {
                println!("Profile: {}", THEME.apply(&THEME.header, profile));
            }
            println!("{}", create_results_table(&response, threshold));
            let top = &response.hits[0];
            println!(
                "Top match {} at {}",
                THEME.apply(&THEME.identifier, &top.record.identifier),
                THEME.similarity(top.similarity(), threshold)
            );
        }

        Commands::Stats { json } => {
            let kb = open_kb(settings, false)?;
            let stats = kb.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", create_stats_table(&stats));
                for facet in &stats.facets {
                    if let bugscout::FacetHealth::Unavailable { reason } = &facet.health {
                        eprintln!(
                            "{} {}: {reason}",
                            THEME.health(&facet.health),
                            facet.facet
                        );
                    }
                }
            }
        }

        Commands::Verify { json } => {
            let kb = open_kb(settings, false)?;
            let report = kb.verify();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_consistent() {
                println!(
                    "{}",
                    THEME.success_with_icon(&format!(
                        "Checked {} indexed rows, no problems found",
                        report.checked_rows
                    ))
                );
            } else {
                println!("{}", create_consistency_table(&report));
            }
            if !report.is_consistent() {
                bail!("consistency check found problems");
            }
        }

        Commands::Rebuild { facet } => {
            let kb = open_kb(settings, false)?;
            let facets = match facet {
                Some(facet) => [(facet, kb.rebuild_facet(facet))].into_iter().collect(),
                None => kb.rebuild_all(),
            };
            let report = bugscout::WriteReport {
                row_ids: Vec::new(),
                facets,
            };
            println!("{}", create_write_report_table(&report));
            if !report.is_complete() {
                bail!("{} facet(s) failed to rebuild", report.failed_facets().len());
            }
        }

        Commands::Reindex => {
            let kb = open_kb(settings, true)?;
            let report = kb.reindex_from_metadata()?;
            println!("{}", create_write_report_table(&report));
            println!(
                "{}",
                THEME.success_with_icon(&format!(
                    "Re-embedded {} record(s)",
                    report.row_ids.len()
                ))
            );
        }

        Commands::Retire { record } => {
            let kb = open_kb(settings, false)?;
            let row_id = match record.parse::<RowId>() {
                Ok(id) => id,
                Err(_) => kb
                    .find_by_identifier(&record)
                    .map(|(id, _)| id)
                    .with_context(|| format!("no record with identifier '{record}'"))?,
            };
            if kb.retire(row_id)? {
                println!("{}", THEME.success_with_icon(&format!("Retired row {row_id}")));
            } else {
                println!("{}", THEME.warning_with_icon(&format!("Row {row_id} was already retired")));
            }
        }
    }

    Ok(())
}
