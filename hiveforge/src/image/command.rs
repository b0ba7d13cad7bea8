//! Subprocess helper for the host tools the image builder drives.

use crate::errors::{BuildError, BuildResult};
use std::ffi::OsStr;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a successful command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Runs `program` with `args` and fails with [`BuildError::Command`] on a non-zero exit.
pub async fn run_command<I, S>(program: &str, args: I) -> BuildResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args
        .into_iter()
        .map(|a| a.as_ref().to_os_string())
        .collect();
    let rendered = std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");

    debug!(command = %rendered, "Running command");

    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BuildError::Build(format!("failed to spawn '{program}': {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        return Err(BuildError::Command {
            command: rendered,
            status: output.status.to_string(),
            stderr,
        });
    }

    Ok(CommandOutput { stdout, stderr })
}
