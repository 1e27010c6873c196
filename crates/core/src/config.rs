use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::model::{SizeBackend, SizeUnit, SortBy};
use crate::profiles::{Profile, ProfileRegistry};

pub const RC_FILE_NAME: &str = ".dirsweeprc";
pub const DEFAULT_MAX_SIMULTANEOUS_SEARCH: usize = 6;

/// Immutable settings for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    pub root_path: PathBuf,
    pub targets: Vec<String>,
    pub exclude: Vec<String>,
    pub max_simultaneous_search: usize,
    pub dry_run: bool,
    pub exclude_sensitive_results: bool,
    pub sort_by: SortBy,
    pub size_unit: SizeUnit,
    pub size_backend: SizeBackend,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            targets: vec!["node_modules".to_string()],
            exclude: vec![".git".to_string()],
            max_simultaneous_search: DEFAULT_MAX_SIMULTANEOUS_SEARCH,
            dry_run: false,
            exclude_sensitive_results: false,
            sort_by: SortBy::None,
            size_unit: SizeUnit::Auto,
            size_backend: SizeBackend::Native,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("rootDir", "must not be empty"));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::invalid("targets", "at least one target is required"));
        }
        if self.targets.iter().any(|target| target.trim().is_empty()) {
            return Err(ConfigError::invalid("targets", "targets must not be blank"));
        }
        if self
            .targets
            .iter()
            .any(|target| target.contains(['/', '\\']))
        {
            return Err(ConfigError::invalid(
                "targets",
                "targets are folder names and cannot contain path separators",
            ));
        }
        if self.max_simultaneous_search == 0 {
            return Err(ConfigError::invalid(
                "maxSimultaneousSearch",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Contents of a `.dirsweeprc` file. Every property is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RcFile {
    pub root_dir: Option<PathBuf>,
    pub exclude: Option<Vec<String>>,
    pub targets: Option<Vec<String>>,
    pub sort_by: Option<SortBy>,
    pub size_unit: Option<SizeUnit>,
    pub exclude_sensitive_results: Option<bool>,
    pub dry_run: Option<bool>,
    pub default_profiles: Option<Vec<String>>,
    pub profiles: Option<BTreeMap<String, Profile>>,
    pub max_simultaneous_search: Option<usize>,
}

impl RcFile {
    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let rc: RcFile = serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        rc.validate()?;
        Ok(rc)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(root) = &self.root_dir {
            if root.as_os_str().is_empty() {
                return Err(ConfigError::invalid("rootDir", "must not be empty"));
            }
        }
        if let Some(targets) = &self.targets {
            if targets.is_empty() {
                return Err(ConfigError::invalid("targets", "must not be an empty list"));
            }
        }
        if let Some(profiles) = &self.default_profiles {
            if profiles.is_empty() {
                return Err(ConfigError::invalid(
                    "defaultProfiles",
                    "must not be an empty list",
                ));
            }
        }
        for (name, profile) in self.profiles.iter().flatten() {
            if profile.description.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "profiles",
                    format!("profile '{name}' needs a description"),
                ));
            }
            if profile.targets.is_empty() {
                return Err(ConfigError::invalid(
                    "profiles",
                    format!("profile '{name}' needs at least one target"),
                ));
            }
        }
        if self.max_simultaneous_search == Some(0) {
            return Err(ConfigError::invalid(
                "maxSimultaneousSearch",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

pub fn default_rc_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(RC_FILE_NAME))
}

/// Loads `explicit`, or the rc file in the home directory. Only an explicit
/// path is required to exist.
pub fn load_rc(explicit: Option<&Path>) -> Result<Option<RcFile>, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match default_rc_path() {
            Some(path) => (path, false),
            None => return Ok(None),
        },
    };

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if required {
                return Err(ConfigError::NotFound { path });
            }
            debug!(path = %path.display(), "no rc file");
            return Ok(None);
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    debug!(path = %path.display(), "loaded rc file");
    RcFile::parse(&path, &contents).map(Some)
}

/// Values given on the command line; `None` leaves the lower layer alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub root_path: Option<PathBuf>,
    pub targets: Option<Vec<String>>,
    pub profiles: Option<Vec<String>>,
    pub exclude: Vec<String>,
    pub max_simultaneous_search: Option<usize>,
    pub dry_run: Option<bool>,
    pub exclude_sensitive_results: Option<bool>,
    pub sort_by: Option<SortBy>,
    pub size_unit: Option<SizeUnit>,
    pub size_backend: Option<SizeBackend>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: SweepConfig,
    pub profiles: ProfileRegistry,
}

/// Layers built-in defaults, the rc file and command-line overrides, in
/// that order. Excludes accumulate across layers; everything else is
/// replaced by the highest layer that sets it.
///
/// Targets come from the first of: explicit targets, selected profiles, rc
/// targets, rc default profiles. Explicit targets and profiles cannot be
/// given together.
pub fn resolve(rc: Option<RcFile>, overrides: ConfigOverrides) -> Result<ResolvedConfig, ConfigError> {
    let rc = rc.unwrap_or_default();
    let profiles = ProfileRegistry::with_user_profiles(rc.profiles.clone().unwrap_or_default());
    let mut config = SweepConfig::default();

    if let Some(root) = rc.root_dir {
        config.root_path = root;
    }
    if let Some(exclude) = rc.exclude {
        merge_unique(&mut config.exclude, exclude);
    }
    if let Some(value) = rc.sort_by {
        config.sort_by = value;
    }
    if let Some(value) = rc.size_unit {
        config.size_unit = value;
    }
    if let Some(value) = rc.exclude_sensitive_results {
        config.exclude_sensitive_results = value;
    }
    if let Some(value) = rc.dry_run {
        config.dry_run = value;
    }
    if let Some(value) = rc.max_simultaneous_search {
        config.max_simultaneous_search = value;
    }

    let cli_targets = match (overrides.targets, &overrides.profiles) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(
                "targets",
                "cannot be combined with profiles; pick one",
            ))
        }
        (Some(targets), None) => {
            let mut explicit = Vec::new();
            merge_unique(&mut explicit, targets);
            Some(explicit)
        }
        (None, Some(names)) => Some(profiles.targets_for(names)?),
        (None, None) => None,
    };
    let targets = match (cli_targets, rc.targets, rc.default_profiles) {
        (Some(targets), _, _) => Some(targets),
        (None, Some(targets), _) => Some(targets),
        (None, None, Some(names)) => Some(profiles.targets_for(&names)?),
        (None, None, None) => None,
    };
    if let Some(targets) = targets {
        config.targets = targets;
    }

    if let Some(root) = overrides.root_path {
        config.root_path = root;
    }
    merge_unique(&mut config.exclude, overrides.exclude);
    if let Some(value) = overrides.max_simultaneous_search {
        config.max_simultaneous_search = value;
    }
    if let Some(value) = overrides.dry_run {
        config.dry_run = value;
    }
    if let Some(value) = overrides.exclude_sensitive_results {
        config.exclude_sensitive_results = value;
    }
    if let Some(value) = overrides.sort_by {
        config.sort_by = value;
    }
    if let Some(value) = overrides.size_unit {
        config.size_unit = value;
    }
    if let Some(value) = overrides.size_backend {
        config.size_backend = value;
    }

    config.validate()?;
    Ok(ResolvedConfig { config, profiles })
}

fn merge_unique(into: &mut Vec<String>, values: Vec<String>) {
    let mut seen: HashSet<String> = into.iter().cloned().collect();
    for value in values {
        let value = value.trim().to_string();
        if !value.is_empty() && seen.insert(value.clone()) {
            into.push(value);
        }
    }
}

/// Strict boolean token parser: `true/false`, `1/0`, `yes/no`, `on/off`,
/// case-insensitive. Anything else is rejected.
pub fn parse_bool_token(value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn bool_tokens_are_strict() {
        for token in ["true", "TRUE", "1", "yes", "On"] {
            assert!(parse_bool_token(token).unwrap(), "{token}");
        }
        for token in ["false", "0", "No", "off"] {
            assert!(!parse_bool_token(token).unwrap(), "{token}");
        }
        for token in ["", "maybe", "falsy", "2"] {
            assert!(matches!(
                parse_bool_token(token),
                Err(ConfigError::InvalidBool(_))
            ));
        }
    }

    #[test]
    fn rc_file_parses_camel_case_and_rejects_unknown_properties() {
        let path = Path::new("/tmp/.dirsweeprc");
        let rc = RcFile::parse(
            path,
            r#"{
                "rootDir": "/work",
                "exclude": ["vendor"],
                "sortBy": "last-mod",
                "sizeUnit": "gb",
                "maxSimultaneousSearch": 2,
                "profiles": {
                    "web": { "description": "bundles", "targets": ["bundle"] }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(rc.root_dir, Some(PathBuf::from("/work")));
        assert_eq!(rc.sort_by, Some(SortBy::LastMod));
        assert_eq!(rc.size_unit, Some(SizeUnit::Gb));
        assert_eq!(rc.max_simultaneous_search, Some(2));

        let err = RcFile::parse(path, r#"{ "colour": "blue" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rc_validation_rejects_bad_values() {
        let path = Path::new("rc");
        assert!(matches!(
            RcFile::parse(path, r#"{ "targets": [] }"#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RcFile::parse(path, r#"{ "maxSimultaneousSearch": 0 }"#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RcFile::parse(
                path,
                r#"{ "profiles": { "x": { "description": "", "targets": ["a"] } } }"#
            ),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn explicit_rc_must_exist_but_default_may_not() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.json");
        assert!(matches!(
            load_rc(Some(missing.as_path())),
            Err(ConfigError::NotFound { .. })
        ));

        let present = temp.path().join("rc.json");
        std::fs::write(&present, r#"{ "dryRun": true }"#).unwrap();
        let rc = load_rc(Some(present.as_path())).unwrap().unwrap();
        assert_eq!(rc.dry_run, Some(true));
    }

    #[test]
    fn layers_merge_with_flags_winning_and_excludes_accumulating() {
        let rc = RcFile {
            root_dir: Some(PathBuf::from("/from-rc")),
            exclude: Some(strings(&["vendor", ".git"])),
            targets: Some(strings(&["dist"])),
            max_simultaneous_search: Some(2),
            dry_run: Some(true),
            ..RcFile::default()
        };
        let overrides = ConfigOverrides {
            root_path: Some(PathBuf::from("/from-flag")),
            exclude: strings(&["archive"]),
            dry_run: Some(false),
            ..ConfigOverrides::default()
        };

        let resolved = resolve(Some(rc), overrides).unwrap().config;
        assert_eq!(resolved.root_path, PathBuf::from("/from-flag"));
        assert_eq!(resolved.exclude, strings(&[".git", "vendor", "archive"]));
        assert_eq!(resolved.targets, strings(&["dist"]));
        assert_eq!(resolved.max_simultaneous_search, 2);
        assert!(!resolved.dry_run);
    }

    #[test]
    fn profiles_and_targets_resolve_by_layer() {
        let resolved = resolve(None, ConfigOverrides::default()).unwrap().config;
        assert_eq!(resolved, SweepConfig::default());

        let rc = RcFile {
            default_profiles: Some(strings(&["rust"])),
            ..RcFile::default()
        };
        let resolved = resolve(Some(rc.clone()), ConfigOverrides::default())
            .unwrap()
            .config;
        assert_eq!(resolved.targets, strings(&["target"]));

        let overrides = ConfigOverrides {
            profiles: Some(strings(&["swift"])),
            ..ConfigOverrides::default()
        };
        let resolved = resolve(Some(rc.clone()), overrides).unwrap().config;
        assert_eq!(resolved.targets, strings(&["DerivedData", ".swiftpm"]));

        let overrides = ConfigOverrides {
            targets: Some(strings(&["target", "Pods", "target"])),
            ..ConfigOverrides::default()
        };
        let resolved = resolve(Some(rc), overrides).unwrap().config;
        assert_eq!(resolved.targets, strings(&["target", "Pods"]));

        let overrides = ConfigOverrides {
            profiles: Some(strings(&["cobol"])),
            ..ConfigOverrides::default()
        };
        assert!(matches!(
            resolve(None, overrides),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    fn targets_and_profiles_are_mutually_exclusive() {
        let overrides = ConfigOverrides {
            profiles: Some(strings(&["swift"])),
            targets: Some(strings(&["Pods"])),
            ..ConfigOverrides::default()
        };
        let err = resolve(None, overrides).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref property, .. } if property == "targets"
        ));
    }

    #[test]
    fn targets_with_separators_are_rejected() {
        let overrides = ConfigOverrides {
            targets: Some(strings(&["a/node_modules"])),
            ..ConfigOverrides::default()
        };
        assert!(matches!(
            resolve(None, overrides),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
