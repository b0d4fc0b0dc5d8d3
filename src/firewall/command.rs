use std::path::Path;
use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::error::BackendError;

/// Runs `program` to completion and hands back its output, whatever the exit
/// status. Only a failure to spawn is an error here.
pub(super) async fn exec(program: &Path, args: &[String]) -> Result<Output, BackendError> {
    debug!(msg = "Running command", program = %program.display(), ?args);

    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| BackendError::Spawn {
            program: program.display().to_string(),
            source,
        })
}

/// Like [`exec`], but a non-zero exit status is an error.
pub(super) async fn run(program: &Path, args: &[String]) -> Result<(), BackendError> {
    let output = exec(program, args).await?;
    check(program, output)
}

pub(super) fn check(program: &Path, output: Output) -> Result<(), BackendError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(BackendError::Command {
            program: program.display().to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

pub(super) fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.into_iter().map(String::from).collect()
}
