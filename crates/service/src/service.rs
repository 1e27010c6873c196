use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use dirsweep_core::{
    load_rc, resolve, CancellationToken, ConfigOverrides, DeleteOutcome, FolderEntry, Profile,
    ScanReport, SizeBackend, SortBy, StatusCounters, StatusEvent, StatusSubscription,
    SweepConfig, SweepSummary, Sweeper,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// How often a running scan copies status notifications into its event log.
const EVENT_PUMP_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Rc file to merge under the request. The home rc file is not read
    /// implicitly.
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub max_simultaneous_search: Option<usize>,
    #[serde(default)]
    pub dry_run: Option<bool>,
    #[serde(default)]
    pub exclude_sensitive_results: Option<bool>,
    #[serde(default)]
    pub sort_by: Option<SortBy>,
    #[serde(default)]
    pub size_backend: Option<SizeBackend>,
    /// Where to write the scan report as JSON once the scan ends.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepSessionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    Started,
    Progress,
    Completed,
    Cancelled,
    Failed,
}

/// One entry of a session's event log. `seq` is per session and strictly
/// increasing; `entry` carries the underlying status notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepEvent {
    pub seq: u64,
    pub session_id: String,
    pub phase: SweepPhase,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<StatusEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSessionSnapshot {
    pub session_id: String,
    pub status: SweepSessionStatus,
    pub root: PathBuf,
    pub dry_run: bool,
    pub error: Option<String>,
    pub total_events: u64,
    pub counters: StatusCounters,
    pub summary: Option<SweepSummary>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSweepResponse {
    pub session_id: String,
    pub status: SweepSessionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteEntryResult {
    pub path: PathBuf,
    pub outcome: Option<DeleteOutcome>,
    pub error: Option<String>,
}

struct SweepSession {
    status: SweepSessionStatus,
    root: PathBuf,
    dry_run: bool,
    error: Option<String>,
    sweeper: Option<Sweeper>,
    receiver: Option<StatusSubscription>,
    report: Option<ScanReport>,
    events: Vec<SweepEvent>,
    cancel: CancellationToken,
}

impl SweepSession {
    fn push(
        &mut self,
        session_id: &str,
        phase: SweepPhase,
        message: Option<String>,
        entry: Option<StatusEvent>,
    ) {
        let seq = self.events.last().map_or(1, |event| event.seq + 1);
        self.events.push(SweepEvent {
            seq,
            session_id: session_id.to_string(),
            phase,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message,
            entry,
        });
    }

    /// Moves pending status notifications into the event log. Notifications
    /// the subscription fell behind on are replayed from the registry.
    fn drain_status(&mut self, session_id: &str) {
        let mut pending = Vec::new();
        if let Some(receiver) = self.receiver.as_mut() {
            while let Some(event) = receiver.try_recv() {
                pending.push(event);
            }
        }
        for event in pending {
            self.push(session_id, SweepPhase::Progress, None, Some(event));
        }
    }
}

static SESSIONS: Lazy<Mutex<HashMap<String, SweepSession>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Resolves the request, registers a session and scans on a background
/// thread. Configuration errors are returned here, before any thread starts.
pub fn start_sweep(request: SweepRequest) -> Result<String> {
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let config = resolve_request(&request)?;
    let cancel = CancellationToken::new();

    {
        let mut sessions = lock_sessions()?;
        if sessions
            .get(&session_id)
            .is_some_and(|session| session.status == SweepSessionStatus::Running)
        {
            bail!("sweep session already running: {session_id}");
        }
        let mut session = SweepSession {
            status: SweepSessionStatus::Running,
            root: config.root_path.clone(),
            dry_run: config.dry_run,
            error: None,
            sweeper: None,
            receiver: None,
            report: None,
            events: Vec::new(),
            cancel: cancel.clone(),
        };
        session.push(
            &session_id,
            SweepPhase::Started,
            Some(format!("scanning {}", config.root_path.display())),
            None,
        );
        sessions.insert(session_id.clone(), session);
    }

    let thread_session_id = session_id.clone();
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                fail_session(&thread_session_id, format!("failed to start runtime: {err}"));
                return;
            }
        };
        runtime.block_on(run_session(thread_session_id, config, request.output, cancel));
    });

    Ok(session_id)
}

async fn run_session(
    session_id: String,
    config: SweepConfig,
    output: Option<PathBuf>,
    cancel: CancellationToken,
) {
    let sweeper = match Sweeper::new(config).await {
        Ok(sweeper) => sweeper,
        Err(err) => {
            fail_session(&session_id, err.to_string());
            return;
        }
    };

    let sweeper_cancel = sweeper.cancel_token();
    tokio::spawn(async move {
        cancel.cancelled().await;
        sweeper_cancel.cancel();
    });

    if let Ok(mut sessions) = lock_sessions() {
        if let Some(session) = sessions.get_mut(&session_id) {
            session.receiver = Some(sweeper.status().follow());
            session.sweeper = Some(sweeper.clone());
        }
    }

    let pump_session_id = session_id.clone();
    let pump = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(EVENT_PUMP_INTERVAL_MS));
        loop {
            tick.tick().await;
            if drain_session(&pump_session_id).is_err() {
                break;
            }
        }
    });

    let result = sweeper
        .scan()
        .await
        .map_err(anyhow::Error::from)
        .and_then(|report| {
            if let Some(path) = &output {
                write_report(&report, path)?;
            }
            Ok(report)
        });
    pump.abort();

    let Ok(mut sessions) = lock_sessions() else {
        return;
    };
    let Some(session) = sessions.get_mut(&session_id) else {
        return;
    };
    session.drain_status(&session_id);
    match result {
        Ok(report) => {
            let cancelled = report.cancelled || session.cancel.is_cancelled();
            let (status, phase) = if cancelled {
                (SweepSessionStatus::Cancelled, SweepPhase::Cancelled)
            } else {
                (SweepSessionStatus::Completed, SweepPhase::Completed)
            };
            info!(
                session_id = %session_id,
                found = report.counters.found,
                cancelled,
                "sweep session finished"
            );
            session.push(
                &session_id,
                phase,
                Some(format!("{} folder(s) found", report.counters.found)),
                None,
            );
            session.status = status;
            session.error = None;
            session.report = Some(report);
        }
        Err(_) if session.cancel.is_cancelled() => {
            session.push(&session_id, SweepPhase::Cancelled, None, None);
            session.status = SweepSessionStatus::Cancelled;
        }
        Err(err) => {
            let message = format!("{err:#}");
            session.push(&session_id, SweepPhase::Failed, Some(message.clone()), None);
            session.status = SweepSessionStatus::Failed;
            session.error = Some(message);
        }
    }
}

pub fn poll_sweep_events(session_id: &str, from_seq: u64) -> Result<Vec<SweepEvent>> {
    let mut sessions = lock_sessions()?;
    let session = session_mut(&mut sessions, session_id)?;
    session.drain_status(session_id);

    Ok(session
        .events
        .iter()
        .filter(|event| event.seq > from_seq)
        .cloned()
        .collect())
}

pub fn get_sweep_session(session_id: &str) -> Result<SweepSessionSnapshot> {
    let mut sessions = lock_sessions()?;
    let session = session_mut(&mut sessions, session_id)?;
    session.drain_status(session_id);

    let (counters, summary) = match &session.sweeper {
        Some(sweeper) => (
            sweeper.status().counters(),
            Some(sweeper.status().summary()),
        ),
        None => (StatusCounters::default(), None),
    };
    Ok(SweepSessionSnapshot {
        session_id: session_id.to_string(),
        status: session.status,
        root: session.root.clone(),
        dry_run: session.dry_run,
        error: session.error.clone(),
        total_events: session.events.len() as u64,
        counters,
        summary,
        duration_ms: session.report.as_ref().map(|report| report.duration_ms),
    })
}

/// Found folders in discovery order with their current state.
pub fn session_entries(session_id: &str) -> Result<Vec<FolderEntry>> {
    let mut sessions = lock_sessions()?;
    let session = session_mut(&mut sessions, session_id)?;
    Ok(session
        .sweeper
        .as_ref()
        .map(|sweeper| sweeper.status().entries())
        .unwrap_or_default())
}

pub fn cancel_sweep(session_id: &str) -> Result<CancelSweepResponse> {
    let mut sessions = lock_sessions()?;
    let session = session_mut(&mut sessions, session_id)?;

    // The session stays `Running` until its thread records the outcome.
    session.cancel.cancel();
    if let Some(sweeper) = &session.sweeper {
        sweeper.cancel();
    }

    Ok(CancelSweepResponse {
        session_id: session_id.to_string(),
        status: session.status,
    })
}

/// Deletes one found folder of the session and blocks until the deletion
/// chain reports back.
pub fn delete_entry(session_id: &str, path: impl AsRef<Path>) -> Result<DeleteOutcome> {
    let path = path.as_ref().to_path_buf();
    let sweeper = session_sweeper(session_id)?;
    let result = deletion_runtime()?.block_on(async { sweeper.delete(&path).await });
    drain_session(session_id)?;
    result.with_context(|| format!("failed to delete {}", path.display()))
}

/// Deletes every found folder that is not already deleted or being deleted.
pub fn delete_all_entries(session_id: &str) -> Result<Vec<DeleteEntryResult>> {
    let sweeper = session_sweeper(session_id)?;
    let results = deletion_runtime()?.block_on(async { sweeper.delete_all().await });
    drain_session(session_id)?;

    Ok(results
        .into_iter()
        .map(|(path, result)| match result {
            Ok(outcome) => DeleteEntryResult {
                path,
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => DeleteEntryResult {
                path,
                outcome: None,
                error: Some(err.to_string()),
            },
        })
        .collect())
}

/// Cancels the session if needed and forgets it.
pub fn close_sweep(session_id: &str) -> Result<()> {
    let mut sessions = lock_sessions()?;
    let session = sessions
        .remove(session_id)
        .ok_or_else(|| anyhow!("sweep session not found: {session_id}"))?;
    session.cancel.cancel();
    Ok(())
}

/// Built-in profiles merged with the ones defined in `config`, if given.
pub fn list_profiles(config: Option<&Path>) -> Result<BTreeMap<String, Profile>> {
    let rc = match config {
        Some(path) => load_rc(Some(path)).context("failed to load config file")?,
        None => None,
    };
    let resolved = resolve(rc, ConfigOverrides::default()).context("invalid configuration")?;
    Ok(resolved
        .profiles
        .iter()
        .map(|(name, profile)| (name.to_string(), profile.clone()))
        .collect())
}

fn resolve_request(request: &SweepRequest) -> Result<SweepConfig> {
    let rc = match &request.config {
        Some(path) => load_rc(Some(path)).context("failed to load config file")?,
        None => None,
    };
    let overrides = ConfigOverrides {
        root_path: request.root.clone(),
        targets: (!request.targets.is_empty()).then(|| request.targets.clone()),
        profiles: (!request.profiles.is_empty()).then(|| request.profiles.clone()),
        exclude: request.exclude.clone(),
        max_simultaneous_search: request.max_simultaneous_search,
        dry_run: request.dry_run,
        exclude_sensitive_results: request.exclude_sensitive_results,
        sort_by: request.sort_by,
        size_unit: None,
        size_backend: request.size_backend,
    };
    Ok(resolve(rc, overrides)
        .context("invalid sweep request")?
        .config)
}

fn write_report(report: &ScanReport, path: &Path) -> Result<()> {
    let payload =
        serde_json::to_string_pretty(report).context("failed to serialize scan report")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write scan report to {}", path.display()))
}

fn deletion_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start deletion runtime")
}

fn session_sweeper(session_id: &str) -> Result<Sweeper> {
    let mut sessions = lock_sessions()?;
    let session = session_mut(&mut sessions, session_id)?;
    session
        .sweeper
        .clone()
        .ok_or_else(|| anyhow!("sweep session has not started scanning yet: {session_id}"))
}

fn drain_session(session_id: &str) -> Result<()> {
    let mut sessions = lock_sessions()?;
    session_mut(&mut sessions, session_id)?.drain_status(session_id);
    Ok(())
}

fn fail_session(session_id: &str, message: String) {
    warn!(session_id, error = %message, "sweep session failed");
    if let Ok(mut sessions) = lock_sessions() {
        if let Some(session) = sessions.get_mut(session_id) {
            session.push(session_id, SweepPhase::Failed, Some(message.clone()), None);
            session.status = SweepSessionStatus::Failed;
            session.error = Some(message);
        }
    }
}

fn session_mut<'a>(
    sessions: &'a mut HashMap<String, SweepSession>,
    session_id: &str,
) -> Result<&'a mut SweepSession> {
    sessions
        .get_mut(session_id)
        .ok_or_else(|| anyhow!("sweep session not found: {session_id}"))
}

fn lock_sessions() -> Result<std::sync::MutexGuard<'static, HashMap<String, SweepSession>>> {
    SESSIONS
        .lock()
        .map_err(|_| anyhow!("sweep session registry lock poisoned"))
}
