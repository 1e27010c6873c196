use std::cmp::Ordering;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const OUTPUT_VERSION: u32 = 1;

/// Lifecycle of a discovered folder. Transitions only move forward and the
/// two deletion outcomes are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Pending,
    Calculating,
    Live,
    Deleting,
    Deleted,
    ErrorDeleting,
}

impl EntryStatus {
    fn rank(self) -> u8 {
        match self {
            EntryStatus::Pending => 0,
            EntryStatus::Calculating => 1,
            EntryStatus::Live => 2,
            EntryStatus::Deleting => 3,
            EntryStatus::Deleted | EntryStatus::ErrorDeleting => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Deleted | EntryStatus::ErrorDeleting)
    }

    /// Terminal states are only reachable from `Deleting`; everything else
    /// may skip ahead but never step back.
    pub fn can_advance_to(self, next: EntryStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return self == EntryStatus::Deleting;
        }
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RiskAnalysis {
    pub is_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RiskAnalysis {
    pub fn safe() -> Self {
        Self::default()
    }

    pub fn sensitive(reason: &str) -> Self {
        Self {
            is_sensitive: true,
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderEntry {
    pub path: PathBuf,
    pub target_name: String,
    /// Bytes; `None` until the size computation for this entry completes.
    pub size: Option<u64>,
    pub modification_time: Option<DateTime<Utc>>,
    /// Newest file found inside the folder, filled after discovery.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    #[serde(default)]
    pub risk: RiskAnalysis,
}

impl FolderEntry {
    pub fn new(path: PathBuf, target_name: impl Into<String>) -> Self {
        Self {
            path,
            target_name: target_name.into(),
            size: None,
            modification_time: None,
            last_modified: None,
            status: EntryStatus::Pending,
            risk: RiskAnalysis::safe(),
        }
    }
}

/// A candidate directory emitted by the scanner, before it is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundFolder {
    pub path: PathBuf,
    pub target_name: String,
    pub modification_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SortBy {
    #[default]
    None,
    Path,
    Size,
    LastMod,
}

impl SortBy {
    pub fn compare(self, a: &FolderEntry, b: &FolderEntry) -> Ordering {
        match self {
            SortBy::None => Ordering::Equal,
            SortBy::Path => a.path.cmp(&b.path),
            SortBy::Size => b
                .size
                .unwrap_or(0)
                .cmp(&a.size.unwrap_or(0))
                .then_with(|| a.path.cmp(&b.path)),
            SortBy::LastMod => match (a.last_modified, b.last_modified) {
                (Some(left), Some(right)) => {
                    left.cmp(&right).then_with(|| a.path.cmp(&b.path))
                }
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (None, None) => a.path.cmp(&b.path),
            },
        }
    }

    pub fn sort(self, entries: &mut [FolderEntry]) {
        if self != SortBy::None {
            entries.sort_by(|a, b| self.compare(a, b));
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizeUnit {
    #[default]
    Auto,
    Mb,
    Gb,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizeBackend {
    #[default]
    Native,
    #[serde(alias = "pdu")]
    PduLibrary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StatusCounters {
    pub found: u64,
    pub calculating: u64,
    pub deleting: u64,
    pub deleted: u64,
    pub errors: u64,
    pub total_size: u64,
    pub space_released: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventKind {
    Found,
    Calculating,
    SizeUpdated,
    Analyzed,
    Deleting,
    Deleted,
    DeleteFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub seq: u64,
    pub kind: StatusEventKind,
    pub path: PathBuf,
    pub status: EntryStatus,
    pub counters: StatusCounters,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetCount {
    pub target: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepSummary {
    pub total_size: u64,
    pub space_released: u64,
    pub results_types_count: Vec<TargetCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub path: PathBuf,
    /// Strategy that removed the folder; `None` for dry runs.
    pub strategy: Option<String>,
    pub dry_run: bool,
}
