use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::command::{CommandOutput, CommandRunner};
use crate::error::StrategyError;

/// One mechanism able to remove a directory tree.
#[async_trait]
pub trait DeletionStrategy: Send + Sync {
    fn name(&self) -> &str;
    async fn is_available(&self) -> bool;
    async fn delete(&self, path: &Path) -> Result<(), StrategyError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Strategy chain for `platform`, highest priority first.
pub fn default_strategies(
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
) -> Vec<Box<dyn DeletionStrategy>> {
    match platform {
        Platform::Unix => vec![
            Box::new(NativeRemove::unix()),
            Box::new(RemoveCommand::new(Arc::clone(&runner))),
            Box::new(FindDelete::new(Arc::clone(&runner))),
            Box::new(RsyncMirror::new(Arc::clone(&runner))),
            Box::new(PerlRemoveTree::new(runner)),
        ],
        Platform::Windows => vec![
            Box::new(NativeRemove::windows()),
            Box::new(RobocopyMirror::new(Arc::clone(&runner))),
            Box::new(PowerShellRemove::new(runner)),
        ],
    }
}

/// In-process recursive removal.
#[derive(Debug, Clone)]
pub struct NativeRemove {
    retries: u32,
    retry_delay: Duration,
    permission_denied_is_fatal: bool,
}

impl NativeRemove {
    pub fn unix() -> Self {
        Self {
            retries: 0,
            retry_delay: Duration::ZERO,
            permission_denied_is_fatal: true,
        }
    }

    /// Open handles on Windows surface as transient access errors, so the
    /// removal is retried a few times with a growing delay.
    pub fn windows() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(100),
            permission_denied_is_fatal: false,
        }
    }
}

#[async_trait]
impl DeletionStrategy for NativeRemove {
    fn name(&self) -> &str {
        "native-remove"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn delete(&self, path: &Path) -> Result<(), StrategyError> {
        let mut attempt = 0;
        loop {
            let err = match fs::remove_dir_all(path).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(StrategyError::NotFound)
                }
                Err(err) => err,
            };

            if err.kind() == io::ErrorKind::PermissionDenied && self.permission_denied_is_fatal {
                return Err(StrategyError::fatal(self.name(), err.to_string()));
            }
            if attempt >= self.retries {
                return Err(StrategyError::recoverable(self.name(), err.to_string()));
            }

            attempt += 1;
            debug!(path = %path.display(), attempt, error = %err, "retrying native removal");
            tokio::time::sleep(self.retry_delay * attempt).await;
        }
    }
}

/// `rm -rf <path>`
pub struct RemoveCommand {
    runner: Arc<dyn CommandRunner>,
}

impl RemoveCommand {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl DeletionStrategy for RemoveCommand {
    fn name(&self) -> &str {
        "rm"
    }

    async fn is_available(&self) -> bool {
        self.runner.is_available("rm").await
    }

    async fn delete(&self, path: &Path) -> Result<(), StrategyError> {
        ensure_present(path).await?;
        let target = path_arg(self.name(), path)?;
        let result = self
            .runner
            .run("rm", &["-rf".to_string(), target])
            .await;
        finish_command(self.name(), path, result, |output| output.success).await
    }
}

/// `find <path> -depth -delete`
pub struct FindDelete {
    runner: Arc<dyn CommandRunner>,
}

impl FindDelete {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl DeletionStrategy for FindDelete {
    fn name(&self) -> &str {
        "find-delete"
    }

    async fn is_available(&self) -> bool {
        self.runner.is_available("find").await
    }

    async fn delete(&self, path: &Path) -> Result<(), StrategyError> {
        ensure_present(path).await?;
        let target = path_arg(self.name(), path)?;
        let args = vec![target, "-depth".to_string(), "-delete".to_string()];
        let result = self.runner.run("find", &args).await;
        finish_command(self.name(), path, result, |output| output.success).await
    }
}

/// Empties the target by mirroring an empty directory onto it with rsync,
/// then removes the emptied directory.
pub struct RsyncMirror {
    runner: Arc<dyn CommandRunner>,
}

impl RsyncMirror {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl DeletionStrategy for RsyncMirror {
    fn name(&self) -> &str {
        "rsync-mirror"
    }

    async fn is_available(&self) -> bool {
        self.runner.is_available("rsync").await
    }

    async fn delete(&self, path: &Path) -> Result<(), StrategyError> {
        ensure_present(path).await?;
        let target = path_arg(self.name(), path)?;
        let empty = EmptyDir::create(self.name()).await?;
        let source = path_arg(self.name(), empty.path())?;

        let args = vec![
            "-a".to_string(),
            "--delete".to_string(),
            format!("{source}/"),
            format!("{target}/"),
        ];
        let result = self.runner.run("rsync", &args).await;
        empty.remove().await;
        finish_command(self.name(), path, result, |output| output.success).await?;
        remove_emptied(self.name(), path).await
    }
}

/// `File::Path::remove_tree` through perl. Anything written to stderr
/// counts as a failure, since `remove_tree` reports per-file problems there
/// and still exits cleanly.
pub struct PerlRemoveTree {
    runner: Arc<dyn CommandRunner>,
}

const PERL_MODULE: &str = "-MFile::Path=remove_tree";
const PERL_REMOVE_SCRIPT: &str = "remove_tree($ARGV[0], { verbose => 0, safe => 0 })";

impl PerlRemoveTree {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl DeletionStrategy for PerlRemoveTree {
    fn name(&self) -> &str {
        "perl-remove-tree"
    }

    async fn is_available(&self) -> bool {
        if !self.runner.is_available("perl").await {
            return false;
        }
        let args = vec![PERL_MODULE.to_string(), "-e".to_string(), "1".to_string()];
        match self.runner.run("perl", &args).await {
            Ok(output) => output.success,
            Err(err) => {
                debug!(error = %err, "perl module check failed");
                false
            }
        }
    }

    async fn delete(&self, path: &Path) -> Result<(), StrategyError> {
        ensure_present(path).await?;
        let target = path_arg(self.name(), path)?;
        let args = vec![
            PERL_MODULE.to_string(),
            "-e".to_string(),
            PERL_REMOVE_SCRIPT.to_string(),
            target,
        ];
        let result = self.runner.run("perl", &args).await;
        finish_command(self.name(), path, result, |output| {
            output.success && output.stderr.is_empty()
        })
        .await
    }
}

/// `robocopy <empty> <path> /MIR`, then removal of the emptied directory.
pub struct RobocopyMirror {
    runner: Arc<dyn CommandRunner>,
}

impl RobocopyMirror {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl DeletionStrategy for RobocopyMirror {
    fn name(&self) -> &str {
        "robocopy-mirror"
    }

    async fn is_available(&self) -> bool {
        self.runner.is_available("robocopy").await
    }

    async fn delete(&self, path: &Path) -> Result<(), StrategyError> {
        ensure_present(path).await?;
        let target = path_arg(self.name(), path)?;
        let empty = EmptyDir::create(self.name()).await?;
        let source = path_arg(self.name(), empty.path())?;

        let args: Vec<String> = [
            source.as_str(),
            target.as_str(),
            "/MIR",
            "/NFL",
            "/NDL",
            "/NJH",
            "/NJS",
            "/NP",
            "/R:1",
            "/W:1",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        let result = self.runner.run("robocopy", &args).await;
        empty.remove().await;
        // robocopy exit codes below 8 all mean the mirror completed.
        finish_command(self.name(), path, result, |output| {
            output.code.is_some_and(|code| (0..8).contains(&code))
        })
        .await?;
        remove_emptied(self.name(), path).await
    }
}

/// `Remove-Item -LiteralPath <path> -Recurse -Force` through PowerShell.
pub struct PowerShellRemove {
    runner: Arc<dyn CommandRunner>,
}

impl PowerShellRemove {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl DeletionStrategy for PowerShellRemove {
    fn name(&self) -> &str {
        "powershell-remove"
    }

    async fn is_available(&self) -> bool {
        self.runner.is_available("powershell").await
    }

    async fn delete(&self, path: &Path) -> Result<(), StrategyError> {
        ensure_present(path).await?;
        let target = path_arg(self.name(), path)?;
        let args = vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            powershell_remove_script(&target),
        ];
        let result = self.runner.run("powershell", &args).await;
        finish_command(self.name(), path, result, |output| output.success).await
    }
}

fn powershell_remove_script(target: &str) -> String {
    format!(
        "Remove-Item -LiteralPath '{}' -Recurse -Force -ErrorAction Stop",
        target.replace('\'', "''")
    )
}

struct EmptyDir {
    path: PathBuf,
}

impl EmptyDir {
    async fn create(strategy: &str) -> Result<Self, StrategyError> {
        let path = std::env::temp_dir().join(format!("dirsweep-empty-{}", Uuid::new_v4()));
        fs::create_dir_all(&path).await.map_err(|err| {
            StrategyError::recoverable(strategy, format!("cannot create empty mirror source: {err}"))
        })?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(self) {
        if let Err(err) = fs::remove_dir(&self.path).await {
            debug!(path = %self.path.display(), error = %err, "failed to clean up empty mirror source");
        }
    }
}

async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

async fn ensure_present(path: &Path) -> Result<(), StrategyError> {
    if exists(path).await {
        Ok(())
    } else {
        Err(StrategyError::NotFound)
    }
}

fn path_arg(strategy: &str, path: &Path) -> Result<String, StrategyError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| StrategyError::recoverable(strategy, "path is not valid UTF-8"))
}

async fn finish_command(
    strategy: &str,
    path: &Path,
    result: io::Result<CommandOutput>,
    succeeded: impl Fn(&CommandOutput) -> bool,
) -> Result<(), StrategyError> {
    let output = match result {
        Ok(output) => output,
        Err(err) => {
            return Err(StrategyError::recoverable(
                strategy,
                format!("failed to launch: {err}"),
            ))
        }
    };
    if succeeded(&output) {
        return Ok(());
    }
    if !exists(path).await {
        return Err(StrategyError::NotFound);
    }

    let message = if output.stderr.is_empty() {
        format!("exited with status {:?}", output.code)
    } else {
        output.stderr
    };
    Err(StrategyError::recoverable(strategy, message))
}

async fn remove_emptied(strategy: &str, path: &Path) -> Result<(), StrategyError> {
    match fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StrategyError::recoverable(strategy, err.to_string())),
    }
}
