use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand, ValueEnum};
use dirsweep_core::{
    format_size, load_rc, parse_bool_token, resolve, CancellationToken, ConfigOverrides,
    DeleteError, DeleteOutcome, FolderEntry, ResolvedConfig, ScanReport, SizeBackend, SizeUnit,
    SortBy, Sweeper, OUTPUT_VERSION,
};
use serde::Serialize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "dirsweep",
    version,
    about = "Find heavy, regenerable directories such as node_modules and delete them safely."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Find target folders and report their sizes.
    Scan(ScanArgs),
    /// Find target folders and delete all of them.
    Clean(CleanArgs),
    /// List built-in and configured profiles.
    Profiles(ProfilesArgs),
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliBackendKind {
    Native,
    #[value(name = "pdu-library", alias = "pdu_library", alias = "pdu")]
    PduLibrary,
}

impl From<CliBackendKind> for SizeBackend {
    fn from(value: CliBackendKind) -> Self {
        match value {
            CliBackendKind::Native => SizeBackend::Native,
            CliBackendKind::PduLibrary => SizeBackend::PduLibrary,
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliSortBy {
    None,
    Path,
    Size,
    LastMod,
}

impl From<CliSortBy> for SortBy {
    fn from(value: CliSortBy) -> Self {
        match value {
            CliSortBy::None => SortBy::None,
            CliSortBy::Path => SortBy::Path,
            CliSortBy::Size => SortBy::Size,
            CliSortBy::LastMod => SortBy::LastMod,
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliSizeUnit {
    Auto,
    Mb,
    Gb,
}

impl From<CliSizeUnit> for SizeUnit {
    fn from(value: CliSizeUnit) -> Self {
        match value {
            CliSizeUnit::Auto => SizeUnit::Auto,
            CliSizeUnit::Mb => SizeUnit::Mb,
            CliSizeUnit::Gb => SizeUnit::Gb,
        }
    }
}

#[derive(Debug, Args)]
struct SweepArgs {
    /// Directory to search from. Defaults to the current directory.
    #[arg(short = 'd', long = "directory", value_name = "PATH")]
    directory: Option<PathBuf>,

    /// Folder names to look for (comma separated or repeatable).
    #[arg(short = 't', long = "target", value_name = "NAME", value_delimiter = ',', action = ArgAction::Append)]
    targets: Vec<String>,

    /// Profiles whose targets are searched for (comma separated or repeatable).
    #[arg(short = 'p', long = "profiles", value_name = "NAME", value_delimiter = ',', action = ArgAction::Append, conflicts_with = "targets")]
    profiles: Vec<String>,

    /// Folder names, path fragments or globs to skip (comma separated or repeatable).
    #[arg(short = 'E', long = "exclude", value_name = "PATTERN", value_delimiter = ',', action = ArgAction::Append)]
    exclude: Vec<String>,

    /// Config file to load instead of ~/.dirsweeprc.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Upper bound on concurrent size computations and deletions.
    #[arg(long, value_name = "N")]
    max_simultaneous_search: Option<usize>,

    /// Validate and report deletions without touching the disk.
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true", value_parser = parse_bool_flag)]
    dry_run: Option<bool>,

    /// Drop results that live in sensitive locations (application bundles, app data, hidden home folders).
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true", value_parser = parse_bool_flag)]
    exclude_sensitive: Option<bool>,

    /// Result ordering.
    #[arg(long = "sort", value_name = "ORDER")]
    sort_by: Option<CliSortBy>,

    /// Unit used when printing sizes.
    #[arg(long, value_name = "UNIT")]
    size_unit: Option<CliSizeUnit>,

    /// Size computation backend (`native` or `pdu-library`).
    #[arg(long)]
    backend: Option<CliBackendKind>,
}

#[derive(Debug, Args)]
struct ScanArgs {
    #[command(flatten)]
    sweep: SweepArgs,

    /// Print one JSON document with every result when the scan ends.
    #[arg(long, conflicts_with = "json_stream")]
    json: bool,

    /// Print one JSON line per result as soon as its size is known.
    #[arg(long)]
    json_stream: bool,

    /// Also write the JSON document to this file.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CleanArgs {
    #[command(flatten)]
    sweep: SweepArgs,

    /// Confirm deletion of every folder found.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Args)]
struct ProfilesArgs {
    /// Config file to load instead of ~/.dirsweeprc.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print profiles as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRisk<'a> {
    is_sensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonResult<'a> {
    path: &'a Path,
    target_name: &'a str,
    size: Option<u64>,
    modification_time: Option<DateTime<Utc>>,
    last_modified: Option<DateTime<Utc>>,
    risk_analysis: JsonRisk<'a>,
}

impl<'a> From<&'a FolderEntry> for JsonResult<'a> {
    fn from(entry: &'a FolderEntry) -> Self {
        Self {
            path: &entry.path,
            target_name: &entry.target_name,
            size: entry.size,
            modification_time: entry.modification_time,
            last_modified: entry.last_modified,
            risk_analysis: JsonRisk {
                is_sensitive: entry.risk.is_sensitive,
                reason: entry.risk.reason.as_deref(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonMeta {
    results_count: usize,
    run_duration: u64,
    total_size: u64,
    skipped_sensitive: u64,
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct JsonDocument<'a> {
    version: u32,
    results: Vec<JsonResult<'a>>,
    meta: JsonMeta,
}

#[derive(Debug, Serialize)]
struct JsonStreamLine<'a> {
    version: u32,
    result: JsonResult<'a>,
}

#[derive(Debug, Serialize)]
struct JsonError {
    version: u32,
    error: bool,
    message: String,
    timestamp: String,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan(args) => {
            let json = args.json || args.json_stream;
            let result = build_runtime()?.block_on(run_scan_command(args));
            if json {
                if let Err(err) = &result {
                    print_json_error(err);
                    std::process::exit(1);
                }
            }
            result
        }
        Commands::Clean(args) => build_runtime()?.block_on(run_clean_command(args)),
        Commands::Profiles(args) => run_profiles_command(args),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn parse_bool_flag(value: &str) -> Result<bool, String> {
    parse_bool_token(value).map_err(|err| err.to_string())
}

fn resolve_config(args: SweepArgs) -> Result<ResolvedConfig> {
    let rc = load_rc(args.config.as_deref()).context("failed to load config file")?;
    let overrides = ConfigOverrides {
        root_path: args.directory,
        targets: (!args.targets.is_empty()).then_some(args.targets),
        profiles: (!args.profiles.is_empty()).then_some(args.profiles),
        exclude: args.exclude,
        max_simultaneous_search: args.max_simultaneous_search,
        dry_run: args.dry_run,
        exclude_sensitive_results: args.exclude_sensitive,
        sort_by: args.sort_by.map(Into::into),
        size_unit: args.size_unit.map(Into::into),
        size_backend: args.backend.map(Into::into),
    };
    resolve(rc, overrides).context("invalid configuration")
}

async fn start_sweeper(args: SweepArgs) -> Result<Sweeper> {
    let resolved = resolve_config(args)?;
    let sweeper = Sweeper::new(resolved.config)
        .await
        .context("invalid configuration")?;
    for strategy in sweeper.deleter().availability() {
        debug!(
            strategy = %strategy.name,
            available = strategy.available,
            "deletion strategy"
        );
    }

    let cancel = sweeper.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
    Ok(sweeper)
}

async fn run_scan_command(args: ScanArgs) -> Result<()> {
    let ScanArgs {
        sweep,
        json,
        json_stream,
        output,
    } = args;

    let sweeper = start_sweeper(sweep).await?;
    let unit = sweeper.config().size_unit;
    let live = json_stream || (!json && sweeper.config().sort_by == SortBy::None);
    let printed = CancellationToken::new();
    let printer = live.then(|| spawn_live_printer(&sweeper, json_stream, printed.clone()));

    let report = sweeper
        .scan()
        .await
        .with_context(|| format!("scan of {} failed", sweeper.config().root_path.display()))?;
    printed.cancel();
    if let Some(printer) = printer {
        if let Err(err) = printer.await {
            warn!(error = %err, "result printer stopped early");
        }
    }

    let document = json_document(&report);
    if let Some(path) = &output {
        let payload =
            serde_json::to_string_pretty(&document).context("failed to serialize results")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write results to {}", path.display()))?;
    }

    if json {
        let payload =
            serde_json::to_string_pretty(&document).context("failed to serialize results")?;
        println!("{payload}");
        return Ok(());
    }
    if json_stream {
        return Ok(());
    }

    if !live {
        for entry in &report.entries {
            println!("{}", entry_line(entry, unit));
        }
    }
    print_scan_summary(&report, unit);
    if let Some(path) = &output {
        println!("Results written to {}", path.display());
    }
    Ok(())
}

async fn run_clean_command(args: CleanArgs) -> Result<()> {
    let CleanArgs { sweep, yes } = args;
    let sweeper = start_sweeper(sweep).await?;
    let dry_run = sweeper.config().dry_run;
    if !dry_run && !yes {
        anyhow::bail!("refusing to delete without --yes (use --dry-run to preview)");
    }
    let unit = sweeper.config().size_unit;

    let report = sweeper
        .scan()
        .await
        .with_context(|| format!("scan of {} failed", sweeper.config().root_path.display()))?;
    print_scan_summary(&report, unit);
    if report.cancelled {
        println!("Scan was cancelled; nothing deleted.");
        return Ok(());
    }

    let results = sweeper.delete_all().await;
    let mut failures = 0;
    for (path, result) in &results {
        let size = sweeper
            .status()
            .get(path)
            .and_then(|entry| entry.size)
            .map(|size| format_size(size, unit))
            .unwrap_or_else(|| "?".to_string());
        match result {
            Ok(outcome) => println!("{}", outcome_line(outcome, &size)),
            Err(err) => {
                failures += 1;
                println!("failed     {size:>12}  {}: {}", path.display(), failure_reason(err));
            }
        }
    }

    let counters = sweeper.status().counters();
    println!(
        "{} {} across {} folder(s); {} failure(s).",
        if dry_run { "Would release" } else { "Released" },
        format_size(counters.space_released, unit),
        counters.deleted,
        failures
    );

    if failures > 0 {
        anyhow::bail!("{failures} folder(s) could not be deleted");
    }
    Ok(())
}

fn run_profiles_command(args: ProfilesArgs) -> Result<()> {
    let rc = load_rc(args.config.as_deref()).context("failed to load config file")?;
    let resolved = resolve(rc, ConfigOverrides::default()).context("invalid configuration")?;

    if args.json {
        let profiles: std::collections::BTreeMap<_, _> = resolved.profiles.iter().collect();
        let payload =
            serde_json::to_string_pretty(&profiles).context("failed to serialize profiles")?;
        println!("{payload}");
        return Ok(());
    }

    for (name, profile) in resolved.profiles.iter() {
        println!("{name}: {}", profile.description);
        println!("  {}", profile.targets.join(", "));
    }
    Ok(())
}

/// Prints each result once its size is known. After `done` fires the
/// printer flushes whatever is still queued, then prints any sized entry it
/// has not shown yet, and exits.
fn spawn_live_printer(
    sweeper: &Sweeper,
    json_stream: bool,
    done: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let status = sweeper.status().clone();
    let mut events = status.follow();
    let mut printer = LivePrinter::new(json_stream, sweeper.config().size_unit);

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                received = events.recv() => received,
                _ = done.cancelled() => break,
            };
            let Some(event) = received else {
                break;
            };
            if let Some(line) = status.get(&event.path).and_then(|entry| printer.line(&entry)) {
                println!("{line}");
            }
        }
        for entry in status.entries() {
            if let Some(line) = printer.line(&entry) {
                println!("{line}");
            }
        }
    })
}

/// Renders each sized entry exactly once.
struct LivePrinter {
    json_stream: bool,
    unit: SizeUnit,
    printed: HashSet<PathBuf>,
}

impl LivePrinter {
    fn new(json_stream: bool, unit: SizeUnit) -> Self {
        Self {
            json_stream,
            unit,
            printed: HashSet::new(),
        }
    }

    fn line(&mut self, entry: &FolderEntry) -> Option<String> {
        if entry.size.is_none() || !self.printed.insert(entry.path.clone()) {
            return None;
        }
        if !self.json_stream {
            return Some(entry_line(entry, self.unit));
        }
        let line = JsonStreamLine {
            version: OUTPUT_VERSION,
            result: JsonResult::from(entry),
        };
        match serde_json::to_string(&line) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(error = %err, "failed to serialize result");
                None
            }
        }
    }
}

fn json_document(report: &ScanReport) -> JsonDocument<'_> {
    JsonDocument {
        version: OUTPUT_VERSION,
        results: report.entries.iter().map(JsonResult::from).collect(),
        meta: JsonMeta {
            results_count: report.entries.len(),
            run_duration: report.duration_ms,
            total_size: report.counters.total_size,
            skipped_sensitive: report.skipped_sensitive,
            cancelled: report.cancelled,
        },
    }
}

fn entry_line(entry: &FolderEntry, unit: SizeUnit) -> String {
    let size = entry
        .size
        .map(|size| format_size(size, unit))
        .unwrap_or_else(|| "?".to_string());
    let age = entry
        .last_modified
        .map(|when| format!("{}d", (Utc::now() - when).num_days()))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!("{size:>12}  {age:>5}  {}", entry.path.display());
    if let Some(reason) = entry.risk.reason.as_deref().filter(|_| entry.risk.is_sensitive) {
        line.push_str(&format!("  [sensitive: {reason}]"));
    }
    line
}

fn outcome_line(outcome: &DeleteOutcome, size: &str) -> String {
    match (&outcome.strategy, outcome.dry_run) {
        (_, true) => format!("dry-run    {size:>12}  {}", outcome.path.display()),
        (Some(strategy), false) => format!(
            "deleted    {size:>12}  {} (via {strategy})",
            outcome.path.display()
        ),
        (None, false) => format!("deleted    {size:>12}  {}", outcome.path.display()),
    }
}

fn failure_reason(err: &DeleteError) -> String {
    match err {
        DeleteError::Unsafe { reason, .. } => format!("rejected, {reason}"),
        other => other.to_string(),
    }
}

fn print_scan_summary(report: &ScanReport, unit: SizeUnit) {
    println!(
        "Found {} folder(s) under {} totalling {} in {} ms.",
        report.counters.found,
        report.root.display(),
        format_size(report.counters.total_size, unit),
        report.duration_ms
    );
    if report.skipped_sensitive > 0 {
        println!(
            "Skipped {} result(s) in sensitive locations.",
            report.skipped_sensitive
        );
    }
    if !report.walk.warnings.is_empty() {
        println!(
            "{} director(ies) could not be read; run with RUST_LOG=warn for details.",
            report.walk.warnings.len()
        );
    }
    if report.cancelled {
        println!("Scan was cancelled before it finished.");
    }
}

fn print_json_error(err: &anyhow::Error) {
    let payload = JsonError {
        version: OUTPUT_VERSION,
        error: true,
        message: format!("{err:#}"),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    match serde_json::to_string(&payload) {
        Ok(line) => eprintln!("{line}"),
        Err(_) => eprintln!("{err:#}"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
