//! Probe engine adapter.
//!
//! Drives one external sing-box process per attempt: render the config,
//! write it to a transient file, spawn the engine, wait for its SOCKS
//! inbound to accept connections, and tear everything down afterwards.

pub mod config;
pub mod outbound;
pub mod ports;
pub mod process;

use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::descriptor::EndpointDescriptor;
use crate::error::VerifyError;
use crate::retry::poll_until;

pub use self::config::SingBoxConfig;
pub use self::process::EngineBinary;

/// Pause before relaunching on a fresh port after a bind collision.
const BIND_RETRY_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// EngineInstance
// ---------------------------------------------------------------------------

/// A running engine whose local SOCKS inbound accepts connections.
///
/// Dropping the instance kills the child and deletes the config file;
/// [`EngineInstance::shutdown`] does the same and also reaps the child and
/// hands back its stderr.
#[derive(Debug)]
pub struct EngineInstance {
    child: Child,
    local_port: u16,
    pid: Option<u32>,
    stderr: Option<JoinHandle<String>>,
    config_file: NamedTempFile,
}

impl EngineInstance {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn config_path(&self) -> &Path {
        self.config_file.path()
    }

    /// Kill and reap the engine, remove its config file, and return the
    /// captured stderr.
    pub async fn shutdown(mut self) -> String {
        process::terminate_child(&mut self.child).await;
        let stderr = process::collect_stderr(self.stderr.take()).await;
        debug!(pid = self.pid, local_port = self.local_port, "engine stopped");
        stderr
    }
}

enum Readiness {
    Listening,
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
}

// ---------------------------------------------------------------------------
// EngineAdapter
// ---------------------------------------------------------------------------

/// Launches engine instances for descriptors.
///
/// Holds no per-attempt state, so one adapter is shared by every worker.
#[derive(Debug, Clone)]
pub struct EngineAdapter {
    binary: EngineBinary,
    settings: EngineConfig,
}

impl EngineAdapter {
    pub fn new(binary: EngineBinary, settings: EngineConfig) -> Self {
        Self { binary, settings }
    }

    pub fn binary(&self) -> &EngineBinary {
        &self.binary
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    /// Start an engine for `descriptor` listening on `local_port`.
    ///
    /// If the engine exits early because the port was taken in the meantime,
    /// a fresh port is allocated and the launch repeated, up to
    /// `bind_retries` times.
    pub async fn launch(
        &self,
        descriptor: &EndpointDescriptor,
        local_port: u16,
        attempt_id: &str,
    ) -> Result<EngineInstance, VerifyError> {
        let mut port = local_port;
        let mut retries_left = self.settings.bind_retries;
        loop {
            match self.launch_once(descriptor, port, attempt_id).await {
                Err(VerifyError::EarlyExit { status, stderr, .. })
                    if retries_left > 0 && process::is_addr_in_use(&stderr) =>
                {
                    retries_left -= 1;
                    warn!(
                        attempt_id,
                        local_port = port,
                        %status,
                        "engine lost the port bind race, relaunching on a fresh port"
                    );
                    tokio::time::sleep(BIND_RETRY_BACKOFF).await;
                    port = ports::acquire()?;
                }
                other => return other,
            }
        }
    }

    /// Write the engine config for `descriptor` to a fresh `sb_*.json` file.
    fn write_config(
        &self,
        descriptor: &EndpointDescriptor,
        local_port: u16,
    ) -> Result<NamedTempFile, VerifyError> {
        let config = SingBoxConfig::build(descriptor, local_port, &self.settings)?;
        let mut file = tempfile::Builder::new()
            .prefix("sb_")
            .suffix(".json")
            .tempfile()
            .map_err(VerifyError::ConfigWrite)?;
        serde_json::to_writer(file.as_file_mut(), &config)
            .map_err(|e| VerifyError::ConfigWrite(e.into()))?;
        Ok(file)
    }

    async fn launch_once(
        &self,
        descriptor: &EndpointDescriptor,
        local_port: u16,
        attempt_id: &str,
    ) -> Result<EngineInstance, VerifyError> {
        let config_file = self.write_config(descriptor, local_port)?;
        let mut child = self.binary.spawn(&self.settings.args, config_file.path())?;
        let stderr = child.stderr.take().map(process::capture_stderr);
        let pid = child.id();

        let mut instance = EngineInstance {
            child,
            local_port,
            pid,
            stderr,
            config_file,
        };

        debug!(
            attempt_id,
            pid,
            local_port,
            config = %instance.config_path().display(),
            "engine spawned"
        );

        let interval = self.settings.ready_poll_interval();
        let deadline = self.settings.startup_timeout();
        let child = &mut instance.child;
        let readiness = poll_until(interval, deadline, || {
            let exited = child.try_wait();
            async move {
                match exited {
                    Ok(Some(status)) => ControlFlow::Break(Readiness::Exited(status)),
                    Err(e) => ControlFlow::Break(Readiness::WaitFailed(e)),
                    Ok(None) => {
                        let dial = TcpStream::connect((Ipv4Addr::LOCALHOST, local_port));
                        match tokio::time::timeout(interval, dial).await {
                            Ok(Ok(_)) => ControlFlow::Break(Readiness::Listening),
                            _ => ControlFlow::Continue(()),
                        }
                    }
                }
            }
        })
        .await;

        match readiness {
            Some(Readiness::Listening) => {
                info!(attempt_id, pid, local_port, "engine ready");
                Ok(instance)
            }
            Some(Readiness::Exited(status)) => {
                let stderr = process::collect_stderr(instance.stderr.take()).await;
                debug!(attempt_id, %status, "engine exited before readiness");
                Err(VerifyError::EarlyExit {
                    status: status.to_string(),
                    pid,
                    stderr,
                })
            }
            Some(Readiness::WaitFailed(e)) => {
                let stderr = instance.shutdown().await;
                Err(VerifyError::EarlyExit {
                    status: format!("wait failed: {e}"),
                    pid,
                    stderr,
                })
            }
            None => {
                let stderr = instance.shutdown().await;
                debug!(attempt_id, local_port, "engine startup deadline elapsed");
                Err(VerifyError::StartTimeout {
                    port: local_port,
                    waited_ms: deadline.as_millis() as u64,
                    pid,
                    stderr,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::descriptor::Protocol;

    fn adapter(program: &str, args: &[&str], startup_ms: u64) -> EngineAdapter {
        let settings = EngineConfig {
            path: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            startup_timeout_ms: startup_ms,
            ready_poll_interval_ms: 20,
            ..EngineConfig::default()
        };
        EngineAdapter::new(EngineBinary::locate(program).unwrap(), settings)
    }

    fn candidate() -> EndpointDescriptor {
        EndpointDescriptor::new(Protocol::Vless, "edge.example", 443, "id")
    }

    /// Whether `pid` is still present in the process table (Linux only).
    fn alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[tokio::test]
    async fn test_never_listening_engine_times_out_and_is_killed() {
        let adapter = adapter("sleep", &["30"], 200);
        let port = ports::acquire().unwrap();
        let err = adapter.launch(&candidate(), port, "t1").await.unwrap_err();
        assert!(matches!(err, VerifyError::StartTimeout { port: p, .. } if p == port));

        let pid = err.engine_pid().expect("timed out engine has a pid");
        if cfg!(target_os = "linux") {
            assert!(!alive(pid), "engine {pid} outlived its start timeout");
        }
    }

    #[tokio::test]
    async fn test_early_exit_carries_stderr_and_is_reaped() {
        let adapter = adapter("sh", &["-c", "echo 'FATAL decode config' >&2; exit 1"], 2000);
        let port = ports::acquire().unwrap();
        let err = adapter.launch(&candidate(), port, "t2").await.unwrap_err();
        match &err {
            VerifyError::EarlyExit { stderr, .. } => assert!(stderr.contains("FATAL decode config")),
            other => panic!("expected EarlyExit, got {other:?}"),
        }

        let pid = err.engine_pid().expect("exited engine has a pid");
        if cfg!(target_os = "linux") {
            assert!(!alive(pid), "engine {pid} left as a zombie");
        }
    }

    #[tokio::test]
    async fn test_config_file_removed_after_shutdown() {
        // The stand-in holds the listen port open the way the engine would.
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let adapter = adapter("sh", &["-c", "test -s \"$0\" && sleep 30", "{config}"], 2000);

        let instance = adapter.launch(&candidate(), port, "t3").await.unwrap();
        let config_path = instance.config_path().to_path_buf();
        assert!(config_path.exists());
        let name = config_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sb_") && name.ends_with(".json"));

        instance.shutdown().await;
        assert!(!config_path.exists());
    }

    #[tokio::test]
    async fn test_bind_collision_relaunches_on_fresh_port() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("launched");
        // First launch reports a bind failure, the relaunch stays up long
        // enough to be timed out.
        let script = format!(
            "if [ -e {m} ]; then sleep 30; else touch {m}; echo 'bind: address already in use' >&2; exit 1; fi",
            m = marker.display()
        );
        let adapter = adapter("sh", &["-c", &script], 200);
        let port = ports::acquire().unwrap();
        let err = adapter.launch(&candidate(), port, "t4").await.unwrap_err();
        assert!(matches!(err, VerifyError::StartTimeout { .. }));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_unrenderable_descriptor_is_process_error() {
        let adapter = adapter("sleep", &["30"], 200);
        let d = EndpointDescriptor::new(Protocol::Trojan, "h", 443, "");
        let err = adapter.launch(&d, 1, "t5").await.unwrap_err();
        assert_eq!(err.reason(), crate::error::FailureReason::ProcessError);
    }
}
