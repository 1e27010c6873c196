use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::SizeBackend;

#[cfg(feature = "pdu-backend")]
use parallel_disk_usage::{
    data_tree::DataTree,
    fs_tree_builder::FsTreeBuilder,
    get_size::GetApparentSize,
    hardlink::HardlinkIgnorant,
    os_string_display::OsStringDisplay,
    reporter::{ErrorOnlyReporter, ErrorReport},
    size::Bytes,
};

#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Computes folder sizes with at most `limit` computations running at once.
/// Callers beyond the limit wait in FIFO order for a slot.
#[derive(Debug, Clone)]
pub struct SizeCalculator {
    permits: Arc<Semaphore>,
    limit: usize,
    backend: SizeBackend,
    in_flight: Arc<InFlight>,
}

/// A held computation slot. Released on drop.
#[derive(Debug)]
pub struct SizePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<InFlight>,
}

impl Drop for SizePermit {
    fn drop(&mut self) {
        self.in_flight.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SizeCalculator {
    pub fn new(max_simultaneous_search: usize, backend: SizeBackend) -> Self {
        let limit = max_simultaneous_search.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            backend,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn backend(&self) -> SizeBackend {
        self.backend
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.current.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held slots seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }

    /// Waits for a free slot. Returns `None` once `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<SizePermit> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
        };

        let now = self.in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.peak.fetch_max(now, Ordering::SeqCst);
        Some(SizePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Runs one computation inside an already held slot. A cancelled run
    /// yields `None` even if the walk had finished.
    pub async fn measure(
        &self,
        _slot: &SizePermit,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Option<u64> {
        let size = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            size = self.compute(path) => Some(size),
        };
        if cancel.is_cancelled() {
            debug!(path = %path.display(), "discarding size of cancelled run");
            return None;
        }
        size
    }

    pub async fn calculate(&self, path: &Path, cancel: &CancellationToken) -> Option<u64> {
        let slot = self.acquire(cancel).await?;
        self.measure(&slot, path, cancel).await
    }

    async fn compute(&self, path: &Path) -> u64 {
        match self.backend {
            SizeBackend::Native => native_size(path).await,
            SizeBackend::PduLibrary => pdu_size(path).await,
        }
    }
}

/// Sum of the apparent lengths of regular files below `root`. Symlinks are
/// not followed, and entries that vanish or cannot be read count as zero.
pub async fn native_size(root: &Path) -> u64 {
    let mut total: u64 = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) => {
                debug!(path = %dir.display(), error = %err, "size walk skipped directory");
                continue;
            }
        };

        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    debug!(path = %dir.display(), error = %err, "size walk listing interrupted");
                    break;
                }
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total = total.saturating_add(metadata.len());
            }
        }
    }

    total
}

#[cfg(feature = "pdu-backend")]
async fn pdu_size(root: &Path) -> u64 {
    let owned = root.to_path_buf();
    let joined = tokio::task::spawn_blocking(move || {
        let reporter = ErrorOnlyReporter::new(ErrorReport::SILENT);
        let tree: DataTree<OsStringDisplay, Bytes> = FsTreeBuilder {
            root: owned,
            size_getter: GetApparentSize,
            hardlinks_recorder: &HardlinkIgnorant,
            reporter: &reporter,
            max_depth: u64::MAX,
        }
        .into();
        let size: u64 = tree.size().into();
        size
    })
    .await;

    match joined {
        Ok(size) => size,
        Err(err) => {
            warn!(path = %root.display(), error = %err, "pdu size task failed; using native walk");
            native_size(root).await
        }
    }
}

#[cfg(not(feature = "pdu-backend"))]
async fn pdu_size(root: &Path) -> u64 {
    warn!(
        path = %root.display(),
        "pdu-library backend requested but the pdu-backend feature is disabled; using native walk"
    );
    native_size(root).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinSet;

    fn write_file(path: &Path, len: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![1u8; len]).unwrap();
    }

    #[tokio::test]
    async fn native_size_sums_regular_files_recursively() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("node_modules");
        write_file(&root.join("a.bin"), 4_194_304);
        write_file(&root.join("pkg/deep/b.bin"), 1_048_576);

        assert_eq!(native_size(&root).await, 5_242_880);
    }

    #[tokio::test]
    async fn missing_folder_counts_as_zero() {
        let temp = TempDir::new().unwrap();
        assert_eq!(native_size(&temp.path().join("gone")).await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_contribute_nothing() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside.bin");
        write_file(&outside, 1_000);
        let root = temp.path().join("node_modules");
        write_file(&root.join("own.bin"), 10);
        std::os::unix::fs::symlink(&outside, root.join("link.bin")).unwrap();
        std::os::unix::fs::symlink(temp.path(), root.join("loop")).unwrap();

        assert_eq!(native_size(&root).await, 10);
    }

    #[tokio::test]
    async fn slots_beyond_the_limit_wait() {
        let calculator = SizeCalculator::new(2, SizeBackend::Native);
        let cancel = CancellationToken::new();
        let first = calculator.acquire(&cancel).await.unwrap();
        let _second = calculator.acquire(&cancel).await.unwrap();
        assert_eq!(calculator.in_flight(), 2);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), calculator.acquire(&cancel)).await;
        assert!(blocked.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_secs(5), calculator.acquire(&cancel))
            .await
            .unwrap();
        assert!(third.is_some());
        assert_eq!(calculator.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn concurrent_calculations_respect_the_limit() {
        let temp = TempDir::new().unwrap();
        for index in 0..12 {
            write_file(&temp.path().join(format!("p{index}/node_modules/f.bin")), 1_024);
        }

        let calculator = SizeCalculator::new(3, SizeBackend::Native);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for index in 0..12 {
            let calculator = calculator.clone();
            let cancel = cancel.clone();
            let path = temp.path().join(format!("p{index}/node_modules"));
            tasks.spawn(async move { calculator.calculate(&path, &cancel).await });
        }

        let mut total = 0;
        while let Some(result) = tasks.join_next().await {
            total += result.unwrap().unwrap();
        }
        assert_eq!(total, 12 * 1_024);
        assert!(calculator.peak_in_flight() <= 3);
        assert_eq!(calculator.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_calculation_reports_nothing() {
        let temp = TempDir::new().unwrap();
        write_file(&temp.path().join("node_modules/f.bin"), 64);

        let calculator = SizeCalculator::new(1, SizeBackend::Native);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            calculator
                .calculate(&temp.path().join("node_modules"), &cancel)
                .await,
            None
        );
    }

    #[cfg(feature = "pdu-backend")]
    #[tokio::test]
    async fn pdu_backend_sees_at_least_the_file_bytes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("node_modules");
        write_file(&root.join("a.bin"), 2_097_152);

        let calculator = SizeCalculator::new(1, SizeBackend::PduLibrary);
        let size = calculator
            .calculate(&root, &CancellationToken::new())
            .await
            .unwrap();
        assert!(size >= 2_097_152);
    }
}
