//! Deletion gate. Every deletion, dry runs included, must pass both
//! [`is_safe_to_delete`] and `!is_dangerous` before a strategy is touched.
//!
//! All checks here are lexical; nothing touches the filesystem.

use std::path::{Component, Path};

use crate::model::RiskAnalysis;

const UNIX_SYSTEM_PATHS: &[&str] = &[
    "/bin",
    "/boot",
    "/dev",
    "/etc",
    "/home",
    "/lib",
    "/lib32",
    "/lib64",
    "/opt",
    "/private",
    "/proc",
    "/root",
    "/run",
    "/sbin",
    "/srv",
    "/sys",
    "/tmp",
    "/usr",
    "/usr/bin",
    "/usr/lib",
    "/usr/local",
    "/usr/local/lib",
    "/usr/share",
    "/var",
    "/applications",
    "/library",
    "/system",
    "/users",
    "/volumes",
];

const WINDOWS_SYSTEM_PATHS: &[&str] = &[
    "windows",
    "program files",
    "program files (x86)",
    "programdata",
    "users",
];

/// True iff the final segment of `path` is exactly one of `targets`.
pub fn is_safe_to_delete(path: &Path, targets: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    targets.iter().any(|target| target == name)
}

/// Checks `path` against the current user's home directory.
pub fn is_dangerous(path: &Path) -> bool {
    is_dangerous_with_home(path, dirs::home_dir().as_deref())
}

/// True for filesystem roots, the home directory and its ancestors, and
/// well-known system directories. Relative paths and paths containing `..`
/// cannot be verified lexically and are always dangerous.
pub fn is_dangerous_with_home(path: &Path, home: Option<&Path>) -> bool {
    if !path.is_absolute() && !is_unc(path) {
        return true;
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return true;
    }

    let normalized = normalize(path);
    if is_root(&normalized) {
        return true;
    }

    if let Some(home) = home {
        let home = normalize(home);
        if !home.is_empty() && (normalized == home || is_ancestor_of(&normalized, &home)) {
            return true;
        }
    }

    if UNIX_SYSTEM_PATHS.contains(&normalized.as_str()) {
        return true;
    }

    match strip_drive(&normalized) {
        Some(rest) => WINDOWS_SYSTEM_PATHS.contains(&rest),
        None => false,
    }
}

/// Advisory sensitivity check for found folders. A sensitive result is a
/// legitimate target that probably belongs to an installed application.
pub fn analyze_risk(path: &Path, home: Option<&Path>) -> RiskAnalysis {
    let normalized = normalize(path);
    let original = path.to_string_lossy().replace('\\', "/").to_lowercase();

    if let Some(home) = home.map(normalize).filter(|home| !home.is_empty()) {
        let relative = if normalized == home {
            Some("")
        } else {
            normalized
                .strip_prefix(&home)
                .and_then(|rest| rest.strip_prefix('/'))
        };

        if let Some(relative) = relative {
            if under(relative, ".config") {
                return RiskAnalysis::sensitive("Contains user configuration data (~/.config)");
            }
            if under(relative, ".local/share") {
                return RiskAnalysis::sensitive("User data folder (~/.local/share)");
            }
            if under(relative, ".cache") {
                return RiskAnalysis::sensitive("System-wide cache directory (~/.cache)");
            }

            let top_level = relative.split('/').next().unwrap_or_default();
            if top_level.starts_with('.')
                && top_level != "."
                && top_level != ".."
                && top_level != ".npm"
                && top_level != ".pnpm"
            {
                return RiskAnalysis::sensitive("Contains unsafe hidden folder");
            }
        }
    }

    if inside_app_bundle(&normalized) {
        return RiskAnalysis::sensitive("Inside macOS .app package");
    }

    if original.starts_with("//") && has_hidden_segment(&original) {
        return RiskAnalysis::sensitive("Hidden path in network share");
    }

    if normalized.contains("/appdata/roaming") {
        return RiskAnalysis::sensitive("Inside Windows AppData Roaming folder");
    }
    if normalized.contains("/appdata/local") {
        let cache_like = [".cache", ".npm", ".pnpm"]
            .iter()
            .any(|name| normalized.split('/').any(|segment| segment == *name));
        if cache_like {
            return RiskAnalysis::safe();
        }
        return RiskAnalysis::sensitive("Inside Windows AppData Local folder");
    }
    if normalized.contains("program files/") || normalized.contains("program files (x86)/") {
        return RiskAnalysis::sensitive("Inside Program Files folder");
    }

    RiskAnalysis::safe()
}

/// Lowercased, forward-slash form without a trailing separator.
fn normalize(path: &Path) -> String {
    let mut text = path.to_string_lossy().replace('\\', "/").to_lowercase();
    while text.len() > 1 && text.ends_with('/') && !is_drive_root(&text) {
        text.pop();
    }
    text
}

fn is_unc(path: &Path) -> bool {
    let text = path.to_string_lossy();
    text.starts_with("\\\\") || text.starts_with("//")
}

fn is_root(normalized: &str) -> bool {
    normalized == "/" || is_drive_root(normalized) || is_drive_root(&format!("{normalized}/"))
}

fn is_drive_root(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

fn strip_drive(normalized: &str) -> Option<&str> {
    let bytes = normalized.as_bytes();
    if bytes.len() > 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/' {
        Some(&normalized[3..])
    } else {
        None
    }
}

fn is_ancestor_of(candidate: &str, descendant: &str) -> bool {
    let prefix = if candidate.ends_with('/') {
        candidate.to_string()
    } else {
        format!("{candidate}/")
    };
    descendant.starts_with(&prefix)
}

fn under(relative: &str, dir: &str) -> bool {
    relative == dir || relative.starts_with(&format!("{dir}/"))
}

fn inside_app_bundle(normalized: &str) -> bool {
    let segments: Vec<&str> = normalized.split('/').collect();
    segments.windows(3).any(|window| {
        window[0] == "applications" && window[1].ends_with(".app") && window[1].len() > 4
    })
}

fn has_hidden_segment(text: &str) -> bool {
    text.split('/')
        .any(|segment| segment.len() > 1 && segment.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn safe_to_delete_requires_exact_final_segment() {
        let t = targets(&["node_modules"]);
        assert!(is_safe_to_delete(Path::new("/app/node_modules"), &t));
        assert!(is_safe_to_delete(Path::new("/app/node_modules/"), &t));
        assert!(!is_safe_to_delete(Path::new("/app/node_modules2"), &t));
        assert!(!is_safe_to_delete(Path::new("/app/my_node_modules"), &t));
        assert!(!is_safe_to_delete(Path::new("/app/Node_Modules"), &t));
        assert!(!is_safe_to_delete(Path::new("/node_modules/src"), &t));
        assert!(!is_safe_to_delete(Path::new("/"), &t));
        assert!(!is_safe_to_delete(Path::new("/app/node_modules"), &[]));
    }

    #[test]
    fn roots_home_and_system_paths_are_dangerous() {
        let home = PathBuf::from("/home/alex");
        let home = Some(home.as_path());
        assert!(is_dangerous_with_home(Path::new("/"), home));
        assert!(is_dangerous_with_home(Path::new("/home/alex"), home));
        assert!(is_dangerous_with_home(Path::new("/home/alex/"), home));
        assert!(is_dangerous_with_home(Path::new("/home"), home));
        assert!(is_dangerous_with_home(Path::new("/usr"), home));
        assert!(is_dangerous_with_home(Path::new("/etc/"), home));
        assert!(is_dangerous_with_home(Path::new("relative/node_modules"), home));
        assert!(is_dangerous_with_home(
            Path::new("/home/alex/app/../node_modules"),
            home
        ));

        assert!(!is_dangerous_with_home(
            Path::new("/home/alex/app/node_modules"),
            home
        ));
        assert!(!is_dangerous_with_home(Path::new("/srv/www/node_modules"), home));
    }

    #[test]
    fn windows_style_paths_are_normalized() {
        assert!(is_root("c:/"));
        assert!(is_root("c:"));
        assert_eq!(strip_drive("c:/program files"), Some("program files"));
        assert_eq!(normalize(Path::new("C:\\Users\\Alex\\")), "c:/users/alex");
    }

    #[test]
    fn home_hidden_folders_are_sensitive() {
        let home = PathBuf::from("/home/alex");
        let home = Some(home.as_path());

        let risk = analyze_risk(Path::new("/home/alex/.vscode/extensions/node_modules"), home);
        assert!(risk.is_sensitive);
        assert_eq!(risk.reason.as_deref(), Some("Contains unsafe hidden folder"));

        assert!(analyze_risk(Path::new("/home/alex/.config/app/node_modules"), home).is_sensitive);
        assert!(analyze_risk(Path::new("/home/alex/.cache/node_modules"), home).is_sensitive);
        assert!(!analyze_risk(Path::new("/home/alex/.npm/_npx/node_modules"), home).is_sensitive);
        assert!(!analyze_risk(Path::new("/home/alex/code/app/node_modules"), home).is_sensitive);
    }

    #[test]
    fn application_locations_are_sensitive() {
        assert!(
            analyze_risk(
                Path::new("/Applications/Slack.app/Contents/node_modules"),
                None
            )
            .is_sensitive
        );
        assert!(
            analyze_risk(
                Path::new("C:\\Users\\alex\\AppData\\Roaming\\app\\node_modules"),
                None
            )
            .is_sensitive
        );
        assert!(
            !analyze_risk(
                Path::new("C:\\Users\\alex\\AppData\\Local\\.npm\\node_modules"),
                None
            )
            .is_sensitive
        );
        assert!(analyze_risk(Path::new("//server/share/.hidden/node_modules"), None).is_sensitive);
    }
}
