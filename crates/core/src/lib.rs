pub mod command;
pub mod config;
pub mod delete;
pub mod error;
pub mod model;
pub mod newest;
pub mod profiles;
pub mod safety;
pub mod scan;
pub mod size;
pub mod status;
pub mod strategy;
pub mod sweep;
pub mod units;

pub use command::{find_program, CommandOutput, CommandRunner, SystemCommandRunner};
pub use config::{
    default_rc_path, load_rc, parse_bool_token, resolve, ConfigOverrides, RcFile, ResolvedConfig,
    SweepConfig, DEFAULT_MAX_SIMULTANEOUS_SEARCH, RC_FILE_NAME,
};
pub use delete::{DeletionStrategyManager, StrategyAvailability};
pub use error::{ConfigError, DeleteError, ScanError, StatusError, StrategyError};
pub use model::{
    DeleteOutcome, EntryStatus, FolderEntry, FoundFolder, RiskAnalysis, SizeBackend, SizeUnit,
    SortBy, StatusCounters, StatusEvent, StatusEventKind, SweepSummary, TargetCount,
    OUTPUT_VERSION,
};
pub use newest::{analysis_root, find_newest_file, NewestFile};
pub use profiles::{builtin_profiles, Profile, ProfileRegistry, ALL_PROFILE, DEFAULT_PROFILE};
pub use safety::{analyze_risk, is_dangerous, is_dangerous_with_home, is_safe_to_delete};
pub use scan::{
    scan_all, start_scan, validate_root, ScanHandle, ScanOptions, WalkStats, GLOBAL_IGNORE,
    GLOBAL_IGNORE_NAMES,
};
pub use size::{native_size, SizeCalculator, SizePermit};
pub use status::{ScanStatus, StatusSubscription};
pub use strategy::{default_strategies, DeletionStrategy, Platform};
pub use sweep::{ScanReport, Sweeper};
pub use tokio_util::sync::CancellationToken;
pub use units::{
    convert_bytes_to_gb, convert_bytes_to_kb, convert_bytes_to_mb, convert_gb_to_mb, format_size,
    human_bytes,
};
