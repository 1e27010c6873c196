//! External program execution for shell-backed deletion strategies.

use std::env;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stderr: String,
}

/// Arguments are handed to the program directly, never through a shell.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn is_available(&self, program: &str) -> bool;
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn is_available(&self, program: &str) -> bool {
        let program = program.to_string();
        tokio::task::spawn_blocking(move || find_program(&program, None).is_some())
            .await
            .unwrap_or(false)
    }

    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Resolves `program` to an executable file, searching `search_path` or the
/// process `PATH`. Files without execute permission are not programs.
pub fn find_program(program: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    match search_path {
        Some(paths) => {
            let cwd = env::current_dir().ok()?;
            which::which_in(program, Some(paths), cwd).ok()
        }
        None => which::which(program).ok(),
    }
}
