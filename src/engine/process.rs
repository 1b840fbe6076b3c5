//! Locating, spawning and terminating the engine child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::VerifyError;

/// Upper bound on retained engine stderr per attempt.
const STDERR_LIMIT: usize = 16 * 1024;

/// How long to wait for the stderr reader after the child is gone.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// EngineBinary
// ---------------------------------------------------------------------------

/// A resolved, existing engine executable.
#[derive(Debug, Clone)]
pub struct EngineBinary {
    path: PathBuf,
}

impl EngineBinary {
    /// Resolve the engine executable.
    ///
    /// Tries `configured` as given, then `./bin/sing-box`, `./sing-box`, and
    /// finally every `$PATH` entry joined with the configured file name.
    pub fn locate(configured: &str) -> Result<Self, VerifyError> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::locate_from(configured, &cwd)
    }

    /// [`locate`](Self::locate) with relative candidates anchored at `cwd`.
    ///
    /// The returned path always contains a directory component, so spawning
    /// it never falls back to a `$PATH` search.
    fn locate_from(configured: &str, cwd: &Path) -> Result<Self, VerifyError> {
        let configured_path = Path::new(configured);
        let mut candidates = vec![
            cwd.join(configured_path),
            cwd.join("bin").join("sing-box"),
            cwd.join("sing-box"),
        ];

        if let (Some(name), Some(path_var)) = (configured_path.file_name(), std::env::var_os("PATH")) {
            candidates.extend(
                std::env::split_paths(&path_var).map(|dir| cwd.join(dir).join(name)),
            );
        }

        for candidate in candidates {
            if candidate.is_file() {
                debug!(path = %candidate.display(), "located probe engine");
                return Ok(Self { path: candidate });
            }
        }

        Err(VerifyError::EngineNotFound {
            path: configured.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawn the engine with `{config}` in `args` replaced by `config_path`.
    ///
    /// stdout is discarded; stderr is piped for [`capture_stderr`].
    pub(crate) fn spawn(&self, args: &[String], config_path: &Path) -> Result<Child, VerifyError> {
        let config_arg = config_path.to_string_lossy();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace("{config}", &config_arg))
            .collect();

        Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VerifyError::Spawn {
                path: self.path.display().to_string(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Child helpers
// ---------------------------------------------------------------------------

/// Drain `stderr` to completion in the background, keeping the first
/// [`STDERR_LIMIT`] bytes.
pub(crate) fn capture_stderr(mut stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = STDERR_LIMIT.saturating_sub(kept.len());
                    kept.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        String::from_utf8_lossy(&kept).into_owned()
    })
}

/// Wait briefly for the stderr reader to finish and return what it saw.
pub(crate) async fn collect_stderr(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(STDERR_DRAIN, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "stderr reader task failed");
            String::new()
        }
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

/// Kill the child and reap it.
pub(crate) async fn terminate_child(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(exit_code = status.code(), "engine already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "error polling engine status"),
    }

    // `kill` sends SIGKILL and waits, so the child is reaped on return.
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill engine");
    }
}

/// Whether engine stderr reports losing the race for its listen port.
pub(crate) fn is_addr_in_use(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("address already in use") || lower.contains("only one usage of each socket address")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
