//! Shared registry of found folders. `ScanStatus` is the only writer of entry
//! state: producers request transitions through its methods and subscribers
//! receive a [`StatusEvent`] after every mutation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StatusError;
use crate::model::{
    EntryStatus, FolderEntry, StatusCounters, StatusEvent, StatusEventKind, SweepSummary,
    TargetCount,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct StatusInner {
    entries: HashMap<PathBuf, FolderEntry>,
    order: Vec<PathBuf>,
    // Last event published for each path.
    changes: HashMap<PathBuf, (u64, StatusEventKind)>,
    counters: StatusCounters,
    seq: u64,
}

#[derive(Debug)]
pub struct ScanStatus {
    inner: Mutex<StatusInner>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanStatus {
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CAPACITY)
    }

    /// Registry whose notification channel keeps at most `capacity`
    /// undelivered events per subscriber.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(StatusInner::default()),
            events,
        }
    }

    /// Notifications for every mutation from now on. A receiver that falls
    /// more than the channel capacity behind observes `Lagged`; use
    /// [`ScanStatus::follow`] to be caught up instead.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Like [`ScanStatus::subscribe`], but a subscriber that falls behind is
    /// caught up from the registry instead of losing notifications.
    pub fn follow(self: &Arc<Self>) -> StatusSubscription {
        let inner = self.lock();
        StatusSubscription {
            status: Arc::clone(self),
            receiver: self.events.subscribe(),
            last_seq: inner.seq,
            backlog: VecDeque::new(),
        }
    }

    /// Sequence number of the latest published event.
    pub fn seq(&self) -> u64 {
        self.lock().seq
    }

    /// The latest change of every entry that changed after `after`, in `seq`
    /// order. Intermediate changes of the same entry are collapsed and the
    /// counters are the current ones.
    pub fn events_since(&self, after: u64) -> Vec<StatusEvent> {
        let inner = self.lock();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut events: Vec<StatusEvent> = inner
            .order
            .iter()
            .filter_map(|path| {
                let (seq, kind) = *inner.changes.get(path)?;
                let entry = inner.entries.get(path)?;
                (seq > after).then(|| StatusEvent {
                    seq,
                    kind,
                    path: path.clone(),
                    status: entry.status,
                    counters: inner.counters,
                    timestamp: timestamp.clone(),
                })
            })
            .collect();
        events.sort_by_key(|event| event.seq);
        events
    }

    pub fn register_found(&self, entry: FolderEntry) -> Result<(), StatusError> {
        let mut inner = self.lock();
        if inner.entries.contains_key(&entry.path) {
            return Err(StatusError::DuplicateEntry { path: entry.path });
        }

        let path = entry.path.clone();
        let status = entry.status;
        inner.counters.found += 1;
        inner.order.push(path.clone());
        inner.entries.insert(path.clone(), entry);
        debug!(path = %path.display(), "registered found folder");
        self.emit(&mut inner, StatusEventKind::Found, path, status);
        Ok(())
    }

    pub fn mark_calculating(&self, path: &Path) -> Result<(), StatusError> {
        let mut inner = self.lock();
        transition(&mut inner, path, EntryStatus::Calculating)?;
        inner.counters.calculating += 1;
        self.emit(
            &mut inner,
            StatusEventKind::Calculating,
            path.to_path_buf(),
            EntryStatus::Calculating,
        );
        Ok(())
    }

    /// Records the computed size and makes the entry `Live`. A size is
    /// accepted once per entry.
    pub fn update_size(&self, path: &Path, size: u64) -> Result<(), StatusError> {
        let mut inner = self.lock();
        self.apply_size(&mut inner, path, size)
    }

    /// [`ScanStatus::update_size`] unless `cancel` has fired. The token is
    /// checked under the registry lock, so once a caller has cancelled and
    /// read [`ScanStatus::seq`] no later size update can be published.
    /// Returns whether the size was recorded.
    pub fn update_size_unless(
        &self,
        path: &Path,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<bool, StatusError> {
        let mut inner = self.lock();
        if cancel.is_cancelled() {
            return Ok(false);
        }
        self.apply_size(&mut inner, path, size).map(|()| true)
    }

    fn apply_size(&self, inner: &mut StatusInner, path: &Path, size: u64) -> Result<(), StatusError> {
        let entry = entry_mut(inner, path)?;
        if entry.size.is_some() {
            return Err(StatusError::SizeAlreadySet {
                path: path.to_path_buf(),
            });
        }
        let previous = entry.status;
        if !previous.can_advance_to(EntryStatus::Live) {
            return Err(StatusError::InvalidTransition {
                path: path.to_path_buf(),
                from: previous,
                to: EntryStatus::Live,
            });
        }
        entry.size = Some(size);
        entry.status = EntryStatus::Live;

        if previous == EntryStatus::Calculating {
            inner.counters.calculating = inner.counters.calculating.saturating_sub(1);
        }
        inner.counters.total_size = inner.counters.total_size.saturating_add(size);
        self.emit(
            inner,
            StatusEventKind::SizeUpdated,
            path.to_path_buf(),
            EntryStatus::Live,
        );
        Ok(())
    }

    /// Attaches the newest-file timestamp. Not a lifecycle transition, but
    /// still published so sorted views can refresh.
    pub fn set_last_modified(&self, path: &Path, when: DateTime<Utc>) -> Result<(), StatusError> {
        let mut inner = self.lock();
        let entry = entry_mut(&mut inner, path)?;
        entry.last_modified = Some(when);
        let status = entry.status;
        self.emit(
            &mut inner,
            StatusEventKind::Analyzed,
            path.to_path_buf(),
            status,
        );
        Ok(())
    }

    pub fn mark_deleting(&self, path: &Path) -> Result<(), StatusError> {
        let mut inner = self.lock();
        let previous = transition(&mut inner, path, EntryStatus::Deleting)?;
        if previous == EntryStatus::Calculating {
            inner.counters.calculating = inner.counters.calculating.saturating_sub(1);
        }
        inner.counters.deleting += 1;
        self.emit(
            &mut inner,
            StatusEventKind::Deleting,
            path.to_path_buf(),
            EntryStatus::Deleting,
        );
        Ok(())
    }

    /// Credits the entry's size to `space_released`. The transition is
    /// terminal, so the credit happens at most once.
    pub fn mark_deleted(&self, path: &Path) -> Result<(), StatusError> {
        let mut inner = self.lock();
        transition(&mut inner, path, EntryStatus::Deleted)?;
        let released = inner
            .entries
            .get(path)
            .and_then(|entry| entry.size)
            .unwrap_or(0);
        inner.counters.deleting = inner.counters.deleting.saturating_sub(1);
        inner.counters.deleted += 1;
        inner.counters.space_released = inner.counters.space_released.saturating_add(released);
        self.emit(
            &mut inner,
            StatusEventKind::Deleted,
            path.to_path_buf(),
            EntryStatus::Deleted,
        );
        Ok(())
    }

    pub fn mark_error(&self, path: &Path) -> Result<(), StatusError> {
        let mut inner = self.lock();
        transition(&mut inner, path, EntryStatus::ErrorDeleting)?;
        inner.counters.deleting = inner.counters.deleting.saturating_sub(1);
        inner.counters.errors += 1;
        self.emit(
            &mut inner,
            StatusEventKind::DeleteFailed,
            path.to_path_buf(),
            EntryStatus::ErrorDeleting,
        );
        Ok(())
    }

    pub fn counters(&self) -> StatusCounters {
        self.lock().counters
    }

    pub fn get(&self, path: &Path) -> Option<FolderEntry> {
        self.lock().entries.get(path).cloned()
    }

    /// Snapshot of every entry in discovery order.
    pub fn entries(&self) -> Vec<FolderEntry> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|path| inner.entries.get(path).cloned())
            .collect()
    }

    pub fn summary(&self) -> SweepSummary {
        let inner = self.lock();
        let mut by_target: BTreeMap<&str, u64> = BTreeMap::new();
        for entry in inner.entries.values() {
            *by_target.entry(entry.target_name.as_str()).or_default() += 1;
        }

        let mut results_types_count: Vec<TargetCount> = by_target
            .into_iter()
            .map(|(target, count)| TargetCount {
                target: target.to_string(),
                count,
            })
            .collect();
        results_types_count.sort_by(|a, b| b.count.cmp(&a.count).then(a.target.cmp(&b.target)));

        SweepSummary {
            total_size: inner.counters.total_size,
            space_released: inner.counters.space_released,
            results_types_count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Sent while the lock is held so subscribers see events in `seq` order.
    fn emit(&self, inner: &mut StatusInner, kind: StatusEventKind, path: PathBuf, status: EntryStatus) {
        inner.seq += 1;
        inner.changes.insert(path.clone(), (inner.seq, kind));
        let event = StatusEvent {
            seq: inner.seq,
            kind,
            path,
            status,
            counters: inner.counters,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Ordered notifications from a [`ScanStatus`] with lag recovery. Every
/// entry change is delivered, although changes missed while lagging arrive
/// collapsed to the entry's latest one.
#[derive(Debug)]
pub struct StatusSubscription {
    status: Arc<ScanStatus>,
    receiver: broadcast::Receiver<StatusEvent>,
    last_seq: u64,
    backlog: VecDeque<StatusEvent>,
}

impl StatusSubscription {
    /// Waits for the next notification. The subscription keeps the registry
    /// alive, so callers stop it with their own shutdown signal.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => self.resync(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next notification if one is ready.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => self.resync(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn accept(&mut self, event: StatusEvent) -> Option<StatusEvent> {
        if event.seq <= self.last_seq {
            return None;
        }
        self.last_seq = event.seq;
        Some(event)
    }

    fn resync(&mut self, skipped: u64) {
        let missed = self.status.events_since(self.last_seq);
        warn!(skipped, replayed = missed.len(), "status subscriber lagged; replaying from registry");
        if let Some(last) = missed.last() {
            self.last_seq = self.last_seq.max(last.seq);
        }
        self.backlog.extend(missed);
    }
}

fn entry_mut<'a>(inner: &'a mut StatusInner, path: &Path) -> Result<&'a mut FolderEntry, StatusError> {
    inner
        .entries
        .get_mut(path)
        .ok_or_else(|| StatusError::UnknownEntry {
            path: path.to_path_buf(),
        })
}

fn transition(
    inner: &mut StatusInner,
    path: &Path,
    next: EntryStatus,
) -> Result<EntryStatus, StatusError> {
    let entry = entry_mut(inner, path)?;
    let previous = entry.status;
    if !previous.can_advance_to(next) {
        return Err(StatusError::InvalidTransition {
            path: path.to_path_buf(),
            from: previous,
            to: next,
        });
    }
    entry.status = next;
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(path: &str, target: &str) -> FolderEntry {
        FolderEntry::new(PathBuf::from(path), target)
    }

    #[test]
    fn lifecycle_updates_counters_and_credits_space_once() {
        let status = ScanStatus::new();
        let path = Path::new("/app/node_modules");
        status.register_found(found("/app/node_modules", "node_modules")).unwrap();
        status.mark_calculating(path).unwrap();
        assert_eq!(status.counters().calculating, 1);

        status.update_size(path, 5_242_880).unwrap();
        let counters = status.counters();
        assert_eq!(counters.calculating, 0);
        assert_eq!(counters.total_size, 5_242_880);
        assert_eq!(status.get(path).unwrap().status, EntryStatus::Live);

        status.mark_deleting(path).unwrap();
        status.mark_deleted(path).unwrap();
        assert!(status.mark_deleted(path).is_err());

        let counters = status.counters();
        assert_eq!(counters.deleted, 1);
        assert_eq!(counters.deleting, 0);
        assert_eq!(counters.space_released, 5_242_880);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let status = ScanStatus::new();
        status.register_found(found("/a/target", "target")).unwrap();
        let err = status
            .register_found(found("/a/target", "target"))
            .unwrap_err();
        assert_eq!(
            err,
            StatusError::DuplicateEntry {
                path: PathBuf::from("/a/target")
            }
        );
        assert_eq!(status.counters().found, 1);
        assert_eq!(status.entries().len(), 1);
    }

    #[test]
    fn size_is_set_at_most_once() {
        let status = ScanStatus::new();
        let path = Path::new("/a/node_modules");
        status.register_found(found("/a/node_modules", "node_modules")).unwrap();
        status.update_size(path, 10).unwrap();
        assert_eq!(
            status.update_size(path, 20),
            Err(StatusError::SizeAlreadySet {
                path: path.to_path_buf()
            })
        );
        assert_eq!(status.counters().total_size, 10);
    }

    #[test]
    fn transitions_never_move_backwards() {
        let status = ScanStatus::new();
        let path = Path::new("/a/node_modules");
        status.register_found(found("/a/node_modules", "node_modules")).unwrap();
        status.update_size(path, 1).unwrap();
        assert!(matches!(
            status.mark_calculating(path),
            Err(StatusError::InvalidTransition { .. })
        ));
        assert!(matches!(
            status.mark_deleted(path),
            Err(StatusError::InvalidTransition { .. })
        ));
        assert!(matches!(
            status.mark_deleting(Path::new("/missing")),
            Err(StatusError::UnknownEntry { .. })
        ));
    }

    #[test]
    fn failed_deletion_is_counted_without_releasing_space() {
        let status = ScanStatus::new();
        let path = Path::new("/a/node_modules");
        status.register_found(found("/a/node_modules", "node_modules")).unwrap();
        status.update_size(path, 42).unwrap();
        status.mark_deleting(path).unwrap();
        status.mark_error(path).unwrap();

        let counters = status.counters();
        assert_eq!(counters.errors, 1);
        assert_eq!(counters.space_released, 0);
        assert_eq!(status.get(path).unwrap().status, EntryStatus::ErrorDeleting);
    }

    #[test]
    fn every_mutation_is_published_in_order() {
        let status = ScanStatus::new();
        let mut events = status.subscribe();
        let path = Path::new("/a/node_modules");
        status.register_found(found("/a/node_modules", "node_modules")).unwrap();
        status.mark_calculating(path).unwrap();
        status.update_size(path, 7).unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| (event.seq, event.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (1, StatusEventKind::Found),
                (2, StatusEventKind::Calculating),
                (3, StatusEventKind::SizeUpdated),
            ]
        );
    }

    #[test]
    fn lagging_followers_still_see_every_sized_entry() {
        let status = Arc::new(ScanStatus::with_event_capacity(8));
        let mut follower = status.follow();
        for n in 0..50 {
            let path = PathBuf::from(format!("/p{n}/node_modules"));
            status.register_found(FolderEntry::new(path.clone(), "node_modules")).unwrap();
            status.mark_calculating(&path).unwrap();
            status.update_size(&path, n).unwrap();
        }

        let delivered: Vec<StatusEvent> = std::iter::from_fn(|| follower.try_recv()).collect();
        assert!(delivered.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        let sized: std::collections::HashSet<_> = delivered
            .iter()
            .filter(|event| event.kind == StatusEventKind::SizeUpdated)
            .map(|event| event.path.clone())
            .collect();
        assert_eq!(sized.len(), 50);
        assert_eq!(delivered.last().map(|event| event.seq), Some(status.seq()));
    }

    #[test]
    fn events_since_reports_latest_change_per_entry() {
        let status = ScanStatus::new();
        let path = Path::new("/a/node_modules");
        status.register_found(found("/a/node_modules", "node_modules")).unwrap();
        status.register_found(found("/b/target", "target")).unwrap();
        status.update_size(path, 3).unwrap();

        let events = status.events_since(0);
        let seen: Vec<_> = events
            .iter()
            .map(|event| (event.seq, event.kind, event.path.clone()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (2, StatusEventKind::Found, PathBuf::from("/b/target")),
                (3, StatusEventKind::SizeUpdated, path.to_path_buf()),
            ]
        );
        assert!(status.events_since(3).is_empty());
    }

    #[test]
    fn cancelled_size_updates_are_not_recorded() {
        let status = ScanStatus::new();
        let path = Path::new("/a/node_modules");
        status.register_found(found("/a/node_modules", "node_modules")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(status.update_size_unless(path, 9, &cancel), Ok(false));
        assert_eq!(status.get(path).unwrap().size, None);
        assert_eq!(status.seq(), 1);
        assert_eq!(
            status.update_size_unless(path, 9, &CancellationToken::new()),
            Ok(true)
        );
    }

    #[test]
    fn summary_groups_by_target() {
        let status = ScanStatus::new();
        status.register_found(found("/a/node_modules", "node_modules")).unwrap();
        status.register_found(found("/b/node_modules", "node_modules")).unwrap();
        status.register_found(found("/c/.venv", ".venv")).unwrap();
        status.update_size(Path::new("/c/.venv"), 100).unwrap();

        let summary = status.summary();
        assert_eq!(summary.total_size, 100);
        assert_eq!(summary.results_types_count[0].target, "node_modules");
        assert_eq!(summary.results_types_count[0].count, 2);
        assert_eq!(summary.results_types_count[1].target, ".venv");
    }
}
