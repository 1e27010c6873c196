use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::model::FoundFolder;

/// Directory names that are never descended into. A name listed here is
/// still reported when it is one of the requested targets.
pub const GLOBAL_IGNORE_NAMES: &[&str] = &[
    // version control
    ".git",
    ".svn",
    ".hg",
    ".fossil",
    // operating system metadata
    ".Trash",
    ".Trashes",
    "System Volume Information",
    ".Spotlight-V100",
    ".fseventsd",
    // toolchain managers
    ".nvm",
    ".rvm",
    ".rustup",
    ".pyenv",
    ".rbenv",
    ".asdf",
    ".deno",
    // editors
    ".vscode",
    ".idea",
    ".vs",
    ".settings",
    // sandboxed package roots
    "snap",
    ".flatpak-info",
    // heavy build and dependency output
    "node_modules",
    "__pycache__",
    "target",
    "build",
    "dist",
    ".cache",
    ".venv",
    "venv",
];

pub static GLOBAL_IGNORE: Lazy<HashSet<&'static str>> =
    Lazy::new(|| GLOBAL_IGNORE_NAMES.iter().copied().collect());

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub targets: Vec<String>,
    pub excludes: Vec<String>,
    /// Found folders buffered ahead of the consumer before the walk pauses.
    pub channel_capacity: usize,
    pub cancel: CancellationToken,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            targets: vec!["node_modules".to_string()],
            excludes: Vec::new(),
            channel_capacity: 64,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalkStats {
    pub directories_visited: u64,
    pub found: u64,
    pub skipped: u64,
    pub cancelled: bool,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
}

/// A running walk. Found folders arrive through [`ScanHandle::next`] as the
/// walk produces them; the walk pauses while the buffer is full.
pub struct ScanHandle {
    root: PathBuf,
    found: mpsc::Receiver<FoundFolder>,
    walker: JoinHandle<WalkStats>,
}

impl ScanHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn next(&mut self) -> Option<FoundFolder> {
        self.found.recv().await
    }

    /// Waits for the walk to end. Dropping unread results stops the walk.
    pub async fn finish(self) -> WalkStats {
        drop(self.found);
        match self.walker.await {
            Ok(stats) => stats,
            Err(err) => WalkStats {
                warnings: vec![format!("directory walk aborted: {err}")],
                ..WalkStats::default()
            },
        }
    }
}

/// Validates the root and starts the walk on the current tokio runtime.
pub async fn start_scan(options: ScanOptions) -> Result<ScanHandle, ScanError> {
    let root = validate_root(&options.root).await?;

    let mut warnings = Vec::new();
    let rules = MatchRules::new(&options.targets, &options.excludes, &mut warnings);
    for warning in &warnings {
        warn!("{warning}");
    }

    let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
    let walk_root = root.clone();
    let cancel = options.cancel.clone();
    let walker = tokio::spawn(async move {
        let mut stats = walk(walk_root, &rules, cancel, tx).await;
        warnings.append(&mut stats.warnings);
        stats.warnings = warnings;
        stats
    });

    Ok(ScanHandle {
        root,
        found: rx,
        walker,
    })
}

/// Convenience wrapper that drains a whole walk.
pub async fn scan_all(options: ScanOptions) -> Result<(Vec<FoundFolder>, WalkStats), ScanError> {
    let mut handle = start_scan(options).await?;
    let mut found = Vec::new();
    while let Some(folder) = handle.next().await {
        found.push(folder);
    }
    Ok((found, handle.finish().await))
}

/// The root must exist, be a directory and be listable. Relative roots are
/// resolved against the working directory.
pub async fn validate_root(root: &Path) -> Result<PathBuf, ScanError> {
    let invalid = |reason: String| ScanError::InvalidRoot {
        path: root.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(root)
        .await
        .map_err(|err| invalid(err.to_string()))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    fs::read_dir(root)
        .await
        .map_err(|err| invalid(format!("cannot list directory: {err}")))?;

    if root.is_absolute() {
        return Ok(root.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|err| invalid(err.to_string()))?;
    Ok(cwd.join(root))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Descend,
    Target,
    Skip,
}

#[derive(Debug)]
struct MatchRules {
    targets: HashSet<String>,
    excludes: ExcludeMatcher,
}

impl MatchRules {
    fn new(targets: &[String], excludes: &[String], warnings: &mut Vec<String>) -> Self {
        Self {
            targets: targets.iter().cloned().collect(),
            excludes: ExcludeMatcher::new(excludes, warnings),
        }
    }

    // user exclude > target > global ignore
    fn classify(&self, name: &str, path: &Path) -> Visit {
        if self.excludes.is_excluded(name, path) {
            Visit::Skip
        } else if self.targets.contains(name) {
            Visit::Target
        } else if GLOBAL_IGNORE.contains(name) {
            Visit::Skip
        } else {
            Visit::Descend
        }
    }
}

async fn walk(
    root: PathBuf,
    rules: &MatchRules,
    cancel: CancellationToken,
    tx: mpsc::Sender<FoundFolder>,
) -> WalkStats {
    let started = Instant::now();
    let mut stats = WalkStats::default();
    let mut pending = vec![root.clone()];

    'walk: while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            stats.cancelled = true;
            break;
        }

        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "skipping unreadable directory");
                stats.skipped += 1;
                stats
                    .warnings
                    .push(format!("skipped {}: {err}", dir.display()));
                continue;
            }
        };
        stats.directories_visited += 1;

        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "directory listing interrupted");
                    stats.skipped += 1;
                    break;
                }
            };

            // `file_type` does not follow symlinks, so linked directories
            // are never entered and cannot form cycles.
            let is_dir = match entry.file_type().await {
                Ok(file_type) => file_type.is_dir(),
                Err(err) => {
                    debug!(path = %entry.path().display(), error = %err, "cannot stat entry");
                    false
                }
            };
            if !is_dir {
                continue;
            }

            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match rules.classify(&name, &path) {
                Visit::Skip => {}
                Visit::Descend => pending.push(path),
                Visit::Target => {
                    let modification_time = entry
                        .metadata()
                        .await
                        .ok()
                        .and_then(|metadata| metadata.modified().ok())
                        .map(DateTime::<Utc>::from);
                    debug!(path = %path.display(), target = %name, "found target folder");
                    let folder = FoundFolder {
                        path,
                        target_name: name.into_owned(),
                        modification_time,
                    };

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            stats.cancelled = true;
                            break 'walk;
                        }
                        sent = tx.send(folder) => {
                            if sent.is_err() {
                                debug!("scan consumer went away, stopping walk");
                                break 'walk;
                            }
                            stats.found += 1;
                        }
                    }
                }
            }
        }
    }

    stats.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        root = %root.display(),
        found = stats.found,
        directories = stats.directories_visited,
        skipped = stats.skipped,
        cancelled = stats.cancelled,
        duration_ms = stats.duration_ms,
        "directory walk finished"
    );
    stats
}

/// User exclude list. Plain names match a directory name exactly, plain
/// patterns containing a separator match anywhere in the path, and glob
/// patterns match the full path.
#[derive(Debug)]
struct ExcludeMatcher {
    globset: Option<GlobSet>,
    names: HashSet<String>,
    substrings: Vec<String>,
}

impl ExcludeMatcher {
    fn new(patterns: &[String], warnings: &mut Vec<String>) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut has_globs = false;
        let mut names = HashSet::new();
        let mut substrings = Vec::new();

        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }

            if is_plain_pattern(pattern) {
                if pattern.contains(['/', '\\']) {
                    substrings.push(normalize_separators(pattern));
                } else {
                    names.insert(pattern.to_string());
                }
                continue;
            }

            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    has_globs = true;
                }
                Err(err) => {
                    warnings.push(format!(
                        "invalid exclude glob '{pattern}': {err}; matching it as a plain name."
                    ));
                    names.insert(pattern.to_string());
                }
            }
        }

        let globset = if has_globs {
            match builder.build() {
                Ok(set) => Some(set),
                Err(err) => {
                    warnings.push(format!(
                        "failed to compile exclude glob set: {err}; glob excludes disabled."
                    ));
                    None
                }
            }
        } else {
            None
        };

        Self {
            globset,
            names,
            substrings,
        }
    }

    fn is_excluded(&self, name: &str, path: &Path) -> bool {
        if self.names.contains(name) {
            return true;
        }

        if let Some(globset) = &self.globset {
            if globset.is_match(path) {
                return true;
            }
        }

        if self.substrings.is_empty() {
            return false;
        }
        let normalized = normalize_separators(&path.to_string_lossy());
        self.substrings
            .iter()
            .any(|pattern| normalized.contains(pattern.as_str()))
    }
}

fn is_plain_pattern(pattern: &str) -> bool {
    !pattern
        .chars()
        .any(|ch| matches!(ch, '*' | '?' | '[' | ']' | '{' | '}'))
}

fn normalize_separators(text: &str) -> String {
    text.replace('\\', "/")
}
