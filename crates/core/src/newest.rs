use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "coverage", "dist"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewestFile {
    pub path: PathBuf,
    pub name: String,
    pub modified: DateTime<Utc>,
}

/// Folder whose files date a found entry: the project folder holding it, or
/// the entry itself when that project folder is the home directory.
pub fn analysis_root(entry: &Path, home: Option<&Path>) -> PathBuf {
    match entry.parent() {
        Some(parent) if !home.is_some_and(|home| same_folder(parent, home)) => {
            parent.to_path_buf()
        }
        _ => entry.to_path_buf(),
    }
}

fn same_folder(a: &Path, b: &Path) -> bool {
    let normalize = |path: &Path| {
        path.to_string_lossy()
            .replace('\\', "/")
            .trim_end_matches('/')
            .to_lowercase()
    };
    normalize(a) == normalize(b)
}

fn is_skipped(name: &std::ffi::OsStr) -> bool {
    let name = name.to_string_lossy().to_lowercase();
    SKIPPED_DIRS.contains(&name.as_str())
}

/// Most recently modified regular file under `root`, skipping dependency
/// and build output folders nested inside it.
pub async fn find_newest_file(root: &Path) -> Option<NewestFile> {
    let root = root.to_path_buf();
    match tokio::task::spawn_blocking(move || newest_file_blocking(&root)).await {
        Ok(newest) => newest,
        Err(err) => {
            debug!(error = %err, "newest-file walk aborted");
            None
        }
    }
}

pub fn newest_file_blocking(root: &Path) -> Option<NewestFile> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_type().is_dir() || !is_skipped(entry.file_name())
        });

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(modified) = entry
            .metadata()
            .ok()
            .and_then(|metadata| metadata.modified().ok())
        else {
            continue;
        };
        if newest.as_ref().map_or(true, |(best, _)| modified > *best) {
            newest = Some((modified, entry.into_path()));
        }
    }

    newest.map(|(modified, path)| NewestFile {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path,
        modified: DateTime::<Utc>::from(modified),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(path: &Path, age: Duration) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn picks_the_most_recent_file_outside_skipped_dirs() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("project");
        touch(&root.join("old.txt"), Duration::from_secs(3_600));
        touch(&root.join("src/fresh.rs"), Duration::from_secs(60));
        touch(&root.join("node_modules/newest.js"), Duration::ZERO);
        touch(&root.join("dist/bundle.js"), Duration::ZERO);

        let newest = find_newest_file(&root).await.unwrap();
        assert_eq!(newest.name, "fresh.rs");
        assert_eq!(newest.path, root.join("src/fresh.rs"));
    }

    #[tokio::test]
    async fn skipped_names_match_regardless_of_case() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("project");
        touch(&root.join("main.js"), Duration::from_secs(3_600));
        touch(&root.join("Node_Modules/newest.js"), Duration::ZERO);
        touch(&root.join("DIST/bundle.js"), Duration::ZERO);

        let newest = find_newest_file(&root).await.unwrap();
        assert_eq!(newest.name, "main.js");
    }

    #[test]
    fn entries_are_dated_by_their_project_folder() {
        let project = Path::new("/work/app");
        let entry = project.join("node_modules");
        assert_eq!(analysis_root(&entry, None), project);
        assert_eq!(analysis_root(&entry, Some(Path::new("/home/me"))), project);
    }

    #[test]
    fn entries_directly_under_home_are_dated_by_themselves() {
        let entry = Path::new("/home/me/node_modules");
        assert_eq!(
            analysis_root(entry, Some(Path::new("/home/me"))),
            entry.to_path_buf()
        );
        assert_eq!(
            analysis_root(entry, Some(Path::new("/HOME/Me/"))),
            entry.to_path_buf()
        );
    }

    #[tokio::test]
    async fn empty_or_missing_folders_have_no_newest_file() {
        let temp = TempDir::new().unwrap();
        assert_eq!(find_newest_file(temp.path()).await, None);
        assert_eq!(find_newest_file(&temp.path().join("missing")).await, None);
    }
}
