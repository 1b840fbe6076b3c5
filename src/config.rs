//! TOML configuration for proxysieve.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration. The file is located through
//! `--config`, then the `PROXYSIEVE_CONFIG` environment variable, then
//! `./proxysieve.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "PROXYSIEVE_CONFIG";

/// Config file picked up from the working directory when nothing else is set.
pub const LOCAL_CONFIG: &str = "proxysieve.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SieveConfig {
    #[serde(default)]
    pub prefilter: PrefilterConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl SieveConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration.
    ///
    /// An explicit path must load; the environment and local fallbacks only
    /// warn when broken and fall through to the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PROXYSIEVE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(path = %local.display(), error = %e, "local config could not be loaded, using defaults");
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Prefilter
// ---------------------------------------------------------------------------

/// Stage-one raw TCP reachability check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefilterConfig {
    /// Per-connect deadline (milliseconds).
    pub connect_timeout_ms: u64,
    /// Ceiling on simultaneous connect attempts.
    pub max_in_flight: usize,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            max_in_flight: 1000,
        }
    }
}

impl PrefilterConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The external probe engine (sing-box) and how it is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path (or bare command name resolved via `$PATH`) to the engine binary.
    pub path: String,
    /// Argument template; `{config}` is replaced by the transient config path.
    pub args: Vec<String>,
    /// How long the engine gets to open its local port (milliseconds).
    pub startup_timeout_ms: u64,
    /// Interval between readiness connect attempts (milliseconds).
    pub ready_poll_interval_ms: u64,
    /// Fresh-port relaunches when the engine loses the bind race.
    pub bind_retries: u32,
    /// Engine-side log level written to the captured stderr.
    pub log_level: String,
    /// Remote DNS server, resolved through the proxy outbound.
    pub dns_server: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: "sing-box".to_string(),
            args: vec![
                "run".to_string(),
                "-c".to_string(),
                "{config}".to_string(),
                "--disable-color".to_string(),
            ],
            startup_timeout_ms: 8000,
            ready_poll_interval_ms: 200,
            bind_retries: 1,
            log_level: "error".to_string(),
            dns_server: "8.8.8.8".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// HTTP latency probe issued through the engine's local inbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Endpoint answering an instant empty 2xx.
    pub url: String,
    /// Total attempts per candidate.
    pub attempts: u32,
    /// Fixed pause between attempts (milliseconds).
    pub backoff_ms: u64,
    /// Per-attempt request deadline (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: "http://www.gstatic.com/generate_204".to_string(),
            attempts: 2,
            backoff_ms: 300,
            request_timeout_ms: 5000,
        }
    }
}

impl ProbeConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker count; also the ceiling on live engine processes.
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: 20 }
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Successes at or above this latency are dropped from the ranking.
    pub max_latency_ms: u64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 3000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging and diagnostic trail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub json: bool,
    /// Append-only JSON-lines log of failed attempts with engine stderr.
    pub diagnostic_log_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            diagnostic_log_path: PathBuf::from("output/debug_errors.jsonl"),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving timestamped exports.
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = SieveConfig::default();

        assert_eq!(cfg.prefilter.connect_timeout_ms, 2000);
        assert_eq!(cfg.prefilter.max_in_flight, 1000);

        assert_eq!(cfg.engine.path, "sing-box");
        assert_eq!(cfg.engine.args, vec!["run", "-c", "{config}", "--disable-color"]);
        assert_eq!(cfg.engine.startup_timeout(), Duration::from_secs(8));
        assert_eq!(cfg.engine.ready_poll_interval(), Duration::from_millis(200));
        assert_eq!(cfg.engine.bind_retries, 1);

        assert_eq!(cfg.probe.url, "http://www.gstatic.com/generate_204");
        assert_eq!(cfg.probe.attempts, 2);
        assert_eq!(cfg.probe.backoff(), Duration::from_millis(300));
        assert_eq!(cfg.probe.request_timeout(), Duration::from_secs(5));

        assert_eq!(cfg.pool.workers, 20);
        assert_eq!(cfg.ranking.max_latency_ms, 3000);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(
            cfg.logging.diagnostic_log_path,
            PathBuf::from("output/debug_errors.jsonl")
        );
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[prefilter]
connect_timeout_ms = 800
max_in_flight = 256

[engine]
path = "/opt/sing-box/sing-box"
args = ["run", "--config", "{config}"]
startup_timeout_ms = 4000
bind_retries = 3

[probe]
url = "http://cp.cloudflare.com/"
attempts = 3

[pool]
workers = 8

[ranking]
max_latency_ms = 1500

[logging]
level = "debug"
json = true
diagnostic_log_path = "/var/log/proxysieve/diag.jsonl"
"#;

        let cfg: SieveConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.prefilter.connect_timeout(), Duration::from_millis(800));
        assert_eq!(cfg.prefilter.max_in_flight, 256);
        assert_eq!(cfg.engine.path, "/opt/sing-box/sing-box");
        assert_eq!(cfg.engine.args[1], "--config");
        assert_eq!(cfg.engine.startup_timeout_ms, 4000);
        assert_eq!(cfg.engine.bind_retries, 3);
        // Unset keys inside a present section fall back to defaults.
        assert_eq!(cfg.engine.ready_poll_interval_ms, 200);
        assert_eq!(cfg.probe.url, "http://cp.cloudflare.com/");
        assert_eq!(cfg.probe.attempts, 3);
        assert_eq!(cfg.probe.backoff_ms, 300);
        assert_eq!(cfg.pool.workers, 8);
        assert_eq!(cfg.ranking.max_latency_ms, 1500);
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: SieveConfig = toml::from_str("").unwrap();
        let defaults = SieveConfig::default();
        assert_eq!(cfg.pool.workers, defaults.pool.workers);
        assert_eq!(cfg.engine.path, defaults.engine.path);
        assert_eq!(cfg.output.dir, defaults.output.dir);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("proxysieve.toml");
        std::fs::write(&path, "[pool]\nworkers = 4\n").unwrap();

        let cfg = SieveConfig::load(&path).unwrap();
        assert_eq!(cfg.pool.workers, 4);

        let cfg = SieveConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.pool.workers, 4);
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = SieveConfig::resolve(Some(Path::new("/nonexistent/proxysieve.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = SieveConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let back: SieveConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.engine.args, back.engine.args);
        assert_eq!(cfg.probe.url, back.probe.url);
    }
}
