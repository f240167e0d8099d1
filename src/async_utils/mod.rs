//! Asynchronous utilities for use with Tokio.
//!
//! Everything that talks to external processes or the blocking thread pool
//! goes through here, so that the pipeline stages can stay simple.

use std::{
    ffi::OsStr,
    process::{Output, Stdio},
};

use tokio::process::Command;

use crate::{cpu_limit::with_cpu_semaphore, error::CommandFailure, prelude::*};

pub mod io;

/// Run an external command to completion while holding a CPU permit,
/// capturing both of its output streams.
///
/// Returns `Err` only if the process could not be started. Use
/// [`check_for_command_failure`] to inspect the exit status.
#[instrument(level = "debug", skip_all, fields(program = ?program.as_ref()))]
pub async fn run_command<P, I, A>(program: P, args: I) -> std::io::Result<Output>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    with_cpu_semaphore(move || async move { cmd.output().await }).await
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels, and returned as part of the failure.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
) -> Result<(), CommandFailure> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        Ok(())
    } else {
        let combined = [stdout.trim(), stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Err(CommandFailure {
            command: command_name.to_owned(),
            exit_code: output.status.code(),
            output: combined,
        })
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}
