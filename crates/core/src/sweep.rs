use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::delete::DeletionStrategyManager;
use crate::error::{ConfigError, DeleteError, ScanError};
use crate::model::{DeleteOutcome, EntryStatus, FolderEntry, StatusCounters};
use crate::newest::{analysis_root, find_newest_file};
use crate::safety::analyze_risk;
use crate::scan::{start_scan, ScanOptions, WalkStats};
use crate::size::{SizeCalculator, SizePermit};
use crate::status::ScanStatus;
use crate::units::human_bytes;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub root: PathBuf,
    pub entries: Vec<FolderEntry>,
    pub counters: StatusCounters,
    pub walk: WalkStats,
    pub skipped_sensitive: u64,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// One run: scanner, size pool, deletion chain and the status registry they
/// all report into. Cloning shares the run.
#[derive(Clone)]
pub struct Sweeper {
    config: Arc<SweepConfig>,
    status: Arc<ScanStatus>,
    sizes: SizeCalculator,
    deleter: Arc<DeletionStrategyManager>,
    delete_slots: Arc<Semaphore>,
    cancel: CancellationToken,
    home: Option<PathBuf>,
}

impl Sweeper {
    /// Uses the built-in deletion chain for the running platform.
    pub async fn new(config: SweepConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let deleter =
            DeletionStrategyManager::for_current_platform(config.targets.clone(), config.dry_run)
                .await;
        Ok(Self::with_manager(config, deleter))
    }

    pub fn with_manager(config: SweepConfig, deleter: DeletionStrategyManager) -> Self {
        let limit = config.max_simultaneous_search.max(1);
        Self {
            sizes: SizeCalculator::new(limit, config.size_backend),
            delete_slots: Arc::new(Semaphore::new(limit)),
            config: Arc::new(config),
            status: Arc::new(ScanStatus::new()),
            deleter: Arc::new(deleter),
            cancel: CancellationToken::new(),
            home: dirs::home_dir(),
        }
    }

    /// Home directory used for risk analysis of found folders.
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn status(&self) -> &Arc<ScanStatus> {
        &self.status
    }

    pub fn sizes(&self) -> &SizeCalculator {
        &self.sizes
    }

    pub fn deleter(&self) -> &DeletionStrategyManager {
        &self.deleter
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the walk, abandons pending size computations and refuses new
    /// deletions. Deletions already running finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Walks the root, registers every found folder and waits until each
    /// size computation has finished or been abandoned.
    pub async fn scan(&self) -> Result<ScanReport, ScanError> {
        let started = Instant::now();
        info!(
            root = %self.config.root_path.display(),
            targets = ?self.config.targets,
            dry_run = self.config.dry_run,
            "starting scan"
        );

        let mut handle = start_scan(ScanOptions {
            root: self.config.root_path.clone(),
            targets: self.config.targets.clone(),
            excludes: self.config.exclude.clone(),
            channel_capacity: self.sizes.limit() * 4,
            cancel: self.cancel.clone(),
        })
        .await?;
        let root = handle.root().to_path_buf();

        let mut measurements = JoinSet::new();
        let mut skipped_sensitive = 0;
        while let Some(found) = handle.next().await {
            let risk = analyze_risk(&found.path, self.home.as_deref());
            if risk.is_sensitive && self.config.exclude_sensitive_results {
                debug!(path = %found.path.display(), reason = ?risk.reason, "skipping sensitive result");
                skipped_sensitive += 1;
                continue;
            }

            let mut entry = FolderEntry::new(found.path.clone(), found.target_name);
            entry.modification_time = found.modification_time;
            entry.risk = risk;
            if let Err(err) = self.status.register_found(entry) {
                debug!(error = %err, "ignoring repeated result");
                continue;
            }

            // Waiting for a slot here also pauses the walk once its buffer
            // fills up.
            let Some(slot) = self.sizes.acquire(&self.cancel).await else {
                break;
            };
            measurements.spawn(measure_entry(
                Arc::clone(&self.status),
                self.sizes.clone(),
                slot,
                found.path,
                self.home.clone(),
                self.cancel.clone(),
            ));
        }

        let walk = handle.finish().await;
        while let Some(joined) = measurements.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "size task aborted");
            }
        }

        let mut entries = self.status.entries();
        self.config.sort_by.sort(&mut entries);
        let report = ScanReport {
            root,
            counters: self.status.counters(),
            entries,
            cancelled: walk.cancelled || self.cancel.is_cancelled(),
            walk,
            skipped_sensitive,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            found = report.counters.found,
            total = %human_bytes(report.counters.total_size),
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "scan finished"
        );
        Ok(report)
    }

    /// Deletes one registered folder through the strategy chain and records
    /// the outcome. Safety failures also end in `ErrorDeleting`.
    pub async fn delete(&self, path: &Path) -> Result<DeleteOutcome, DeleteError> {
        let cancelled = || DeleteError::Cancelled {
            path: path.to_path_buf(),
        };
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let _slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(cancelled()),
            slot = Arc::clone(&self.delete_slots).acquire_owned() => slot.map_err(|_| cancelled())?,
        };

        self.status.mark_deleting(path)?;
        match self.deleter.delete_folder(path).await {
            Ok(outcome) => {
                self.status.mark_deleted(path)?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(status_err) = self.status.mark_error(path) {
                    warn!(path = %path.display(), error = %status_err, "cannot record failed deletion");
                }
                Err(err)
            }
        }
    }

    /// Deletes every entry that is not already being deleted. Results come
    /// back in completion order.
    pub async fn delete_all(&self) -> Vec<(PathBuf, Result<DeleteOutcome, DeleteError>)> {
        let mut deletions = JoinSet::new();
        for entry in self.status.entries() {
            if matches!(
                entry.status,
                EntryStatus::Deleting | EntryStatus::Deleted | EntryStatus::ErrorDeleting
            ) {
                continue;
            }
            let sweeper = self.clone();
            deletions.spawn(async move {
                let result = sweeper.delete(&entry.path).await;
                (entry.path, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = deletions.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "deletion task aborted"),
            }
        }
        results
    }
}

async fn measure_entry(
    status: Arc<ScanStatus>,
    sizes: SizeCalculator,
    slot: SizePermit,
    path: PathBuf,
    home: Option<PathBuf>,
    cancel: CancellationToken,
) {
    if let Err(err) = status.mark_calculating(&path) {
        debug!(error = %err, "entry moved on before sizing");
        return;
    }

    let Some(size) = sizes.measure(&slot, &path, &cancel).await else {
        return;
    };
    match status.update_size_unless(&path, size, &cancel) {
        Ok(true) => debug!(path = %path.display(), size = %human_bytes(size), "size computed"),
        Ok(false) => return,
        Err(err) => debug!(error = %err, "size arrived after entry moved on"),
    }

    if cancel.is_cancelled() {
        return;
    }
    let project = analysis_root(&path, home.as_deref());
    if let Some(newest) = find_newest_file(&project).await {
        if let Err(err) = status.set_last_modified(&path, newest.modified) {
            debug!(error = %err, "cannot record newest file");
        }
    }
}
