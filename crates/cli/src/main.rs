//! dgnsync command-line tool.
//!
//! Converts a root CAD document and its attachments into the target
//! element graph, re-runs incrementally against a changed source, shows the
//! run history and generates / validates configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dgnsync_core::config::AppConfig;
use dgnsync_core::coordinator::{ProgressAction, ProgressMonitor, RunOutcome};
use dgnsync_core::db::Database;
use dgnsync_core::{JobCoordinator, JsonSourceReader, SyncHost};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// dgnsync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "dgnsync",
    version,
    about = "Convert CAD documents into an element graph, incrementally"
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults to
    /// `<config dir>/dgnsync/config.toml`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override `[engine].log_level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Root document, relative to `--source-dir` unless absolute.
    root: String,

    /// Bridge key; defaults to `[engine].bridge_key`.
    #[arg(short, long)]
    bridge: Option<String>,

    /// Directory holding the JSON source documents.
    #[arg(short, long, default_value = ".")]
    source_dir: PathBuf,

    /// Print the run outcome as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert a root document for the first time.
    Convert(RunArgs),

    /// Apply source changes to a previously converted root document.
    Update(RunArgs),

    /// Show jobs and recent runs.
    Status {
        /// Maximum number of runs to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./dgnsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    match cli.command {
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_init(&output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_validate(&config_path)
        }
        command => {
            let config = load_config(&config_path)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.engine.log_level));
            match command {
                Commands::Convert(args) => cmd_run(config, args, false).await,
                Commands::Update(args) => cmd_run(config, args, true).await,
                Commands::Status { limit } => cmd_status(&config, limit),
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("dgnsync").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("dgnsync.toml"))
}

/// Load and validate `path`. A missing file yields the defaults.
fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(AppConfig::default());
    }
    AppConfig::load_and_validate(path).context("failed to load configuration file")
}

fn open_database(config: &AppConfig) -> Result<Database> {
    std::fs::create_dir_all(&config.engine.data_dir).context("failed to create data directory")?;
    let db = Database::new(config.database_path()).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancels the run at the next document or model once Ctrl-C was pressed.
struct InterruptMonitor {
    interrupted: Arc<AtomicBool>,
}

impl InterruptMonitor {
    fn action(&self) -> ProgressAction {
        if self.interrupted.load(Ordering::SeqCst) {
            ProgressAction::Abort
        } else {
            ProgressAction::Continue
        }
    }
}

impl ProgressMonitor for InterruptMonitor {
    fn on_document(&self, path: &str) -> ProgressAction {
        info!(path, "converting document");
        self.action()
    }

    fn on_model(&self, _path: &str, _model: &str) -> ProgressAction {
        self.action()
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_run(config: AppConfig, args: RunArgs, require_job: bool) -> Result<()> {
    let bridge = args
        .bridge
        .clone()
        .unwrap_or_else(|| config.engine.bridge_key.clone());

    if require_job {
        let db = open_database(&config)?;
        let known = match db
            .find_document_by_path(&args.root)
            .context("failed to look up root document")?
        {
            Some(doc) => db
                .find_job(&bridge, doc.id)
                .context("failed to look up job")?
                .is_some(),
            None => false,
        };
        if !known {
            anyhow::bail!(
                "'{}' has not been converted by bridge '{}'; run `dgnsync convert` first",
                args.root,
                bridge
            );
        }
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received, stopping after the current model...");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let root = args.root.clone();
    let reader = Arc::new(JsonSourceReader::new(&args.source_dir));
    let outcome = tokio::task::spawn_blocking(move || -> Result<RunOutcome> {
        let host = SyncHost::open(config, reader).context("failed to open sync host")?;
        let monitor = Arc::new(InterruptMonitor { interrupted });
        let mut job = JobCoordinator::new(&host, &bridge, &root)?.with_monitor(monitor);
        let outcome = job
            .run()
            .with_context(|| format!("run over '{}' failed", root))?;
        Ok(outcome)
    })
    .await
    .context("conversion task panicked")??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    print_outcome(&args.root, &outcome);
    Ok(())
}

fn print_outcome(root: &str, outcome: &RunOutcome) {
    let stats = &outcome.stats;
    println!("Run {} over {}: {}", outcome.token, root, outcome.state);
    println!();
    println!(
        "  Documents : {} converted, {} skipped, {} deleted",
        stats.documents_converted, stats.documents_skipped, stats.documents_deleted
    );
    println!(
        "  Models    : {} converted, {} deleted",
        stats.models_converted, stats.models_deleted
    );
    println!(
        "  Elements  : {} inserted, {} updated, {} unchanged, {} deleted, {} discarded",
        stats.inserted, stats.updated, stats.unchanged, stats.deleted, stats.discarded
    );
    println!(
        "  Schemas   : {} imported, {} merged",
        stats.schemas_imported, stats.schemas_merged
    );
    println!("  Fonts     : {} embedded", stats.fonts_embedded);
    println!("  Changes   : {}", if outcome.had_changes { "yes" } else { "none" });

    if !outcome.diagnostics.is_empty() {
        println!();
        println!("Diagnostics:");
        for diagnostic in &outcome.diagnostics {
            println!("  - {}", diagnostic);
        }
    }
}

fn cmd_status(config: &AppConfig, limit: u32) -> Result<()> {
    let db = open_database(config)?;
    let jobs = db.list_jobs().context("failed to list jobs")?;
    let runs = db.list_runs(limit).context("failed to list runs")?;
    let documents = db.list_documents().context("failed to list documents")?;
    let mapped = db.count_elements().context("failed to count elements")?;
    let discards = db.count_discards().context("failed to count discards")?;

    println!("dgnsync Status");
    println!("==============");
    println!();
    println!("  Database         : {}", config.database_path().display());
    println!("  Jobs             : {}", jobs.len());
    println!("  Documents        : {}", documents.len());
    println!("  Mapped elements  : {}", mapped);
    println!("  Discarded        : {}", discards);
    println!();

    if !jobs.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Job", "Bridge", "Root", "Documents", "Created"]);
        for job in &jobs {
            let root = db
                .get_document(job.root_document_id)
                .context("failed to read root document")?
                .map(|d| d.source_path)
                .unwrap_or_else(|| "—".to_string());
            let documents = db
                .list_job_documents(job.id)
                .context("failed to list job documents")?
                .len();
            table.add_row(vec![
                Cell::new(job.id),
                Cell::new(&job.bridge_key),
                Cell::new(truncate(&root, 48)),
                Cell::new(documents),
                Cell::new(short_time(&job.created_at)),
            ]);
        }
        println!("{}", table);
        println!();
    }

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Run", "Bridge", "Root", "State", "Changes", "Started", "Summary"]);
    for run in &runs {
        let state_cell = match run.state.as_str() {
            "committed" => Cell::new("committed").fg(comfy_table::Color::Green),
            "aborted" => Cell::new("aborted").fg(comfy_table::Color::Red),
            other => Cell::new(other).fg(comfy_table::Color::Yellow),
        };
        table.add_row(vec![
            Cell::new(run.token),
            Cell::new(&run.bridge_key),
            Cell::new(truncate(&run.root_path, 32)),
            state_cell,
            Cell::new(if run.had_changes { "yes" } else { "no" }),
            Cell::new(short_time(&run.started_at)),
            Cell::new(truncate(run.summary.as_deref().unwrap_or(""), 60)),
        ]);
    }
    println!("{}", table);
    println!();
    println!("{} run(s) shown", runs.len());

    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# dgnsync configuration
# Every field is optional; the values below are the defaults.

[engine]
log_level = "info"
data_dir = ".dgnsync"
bridge_key = "default"

[identity]
# Match documents by file name when no GUID matches.
match_basenames = false
# Regular expression stripped from file stems before matching, e.g. "_v\\d+$".
# recipe = "_v\\d+$"

[conversion]
# never | if_different | always
level_copy = "if_different"
merge_definitions = false
clone_duplicate_codes = false
generate_thumbnails = true
# if_used | always | never
default_font_policy = "if_used"

# [conversion.fonts]
# "Courier New" = "always"

# [[conversion.import_rules]]
# file = "site*.dgn"
# name = "default"
# new_name = "%file - Plan"

[geo]
# reprojection | gcs_transform | gcs_transform_with_scaling
method = "gcs_transform_with_scaling"

# [geo.input]
# origin = { x = 0.0, y = 0.0, z = 0.0 }
# azimuth_deg = 0.0
# latitude = 40.0
# longitude = -74.0
# elevation = 0.0
# datum = "WGS84"
# meters_per_unit = 1.0

# Bridge key to file name patterns. Without entries every document belongs
# to every bridge.
[assignments]
# civil = ["road*.dgn", "site*.dgn"]
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Set the bridge key and data directory");
    println!(
        "  2. Validate with: dgnsync validate --config {}",
        output.display()
    );
    println!(
        "  3. Convert a root: dgnsync convert --config {} <root.json>",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => {
            println!("  [OK] All fields are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let conversion = &config.conversion;
    println!();
    println!("Configuration summary:");
    println!("  Bridge key     : {}", config.engine.bridge_key);
    println!("  Data directory : {}", config.engine.data_dir.display());
    println!(
        "  Basename match : {}",
        if config.identity.match_basenames { "on" } else { "off" }
    );
    println!(
        "  Recipe         : {}",
        config.identity.recipe.as_deref().unwrap_or("none")
    );
    println!("  Level copy     : {:?}", conversion.level_copy);
    println!(
        "  Definitions    : {}",
        if conversion.merge_definitions { "merged" } else { "per bridge" }
    );
    println!("  Import rules   : {}", conversion.import_rules.len());
    println!("  Geo method     : {:?}", config.geo.method);
    println!(
        "  Input GCS      : {}",
        if config.geo.input.is_some() { "set" } else { "not set" }
    );
    println!(
        "  Assignments    : {}",
        if config.assignments.is_empty() {
            "every document".to_string()
        } else {
            config.assignments.keys().cloned().collect::<Vec<_>>().join(", ")
        }
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// `YYYY-MM-DD HH:MM:SS` in local time, or the input unchanged.
fn short_time(rfc3339: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|_| rfc3339.to_string())
}
