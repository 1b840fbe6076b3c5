use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use proxysieve::config::SieveConfig;
use proxysieve::descriptor::{self, EndpointDescriptor};
use proxysieve::diagnostics::DiagnosticLog;
use proxysieve::engine::SingBoxConfig;
use proxysieve::probes::tcp::TcpPrefilter;
use proxysieve::report;
use proxysieve::Pipeline;

#[derive(Parser)]
#[command(
    name = "proxysieve",
    about = "Find the proxy endpoints that actually work, ranked by latency",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prefilter, verify through the engine, rank and export
    Verify {
        /// Files or directories with share links ("-" reads stdin)
        #[arg(default_value = "-")]
        inputs: Vec<PathBuf>,

        /// Probe engine binary (overrides [engine].path)
        #[arg(long)]
        engine: Option<String>,

        /// Worker count (overrides [pool].workers)
        #[arg(long)]
        workers: Option<usize>,

        /// Latency ceiling in ms (overrides [ranking].max_latency_ms)
        #[arg(long)]
        max_latency_ms: Option<u64>,

        /// Export file; defaults to a timestamped file in [output].dir
        #[arg(long)]
        output: Option<PathBuf>,

        /// Skip writing the export file
        #[arg(long)]
        no_export: bool,

        /// Print the summary and ranking as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run only the TCP reachability check and print reachable links
    Prefilter {
        /// Files or directories with share links ("-" reads stdin)
        #[arg(default_value = "-")]
        inputs: Vec<PathBuf>,

        /// Per-connect timeout in ms (overrides [prefilter].connect_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the engine configuration generated for one share link
    RenderConfig {
        /// Share link
        link: String,

        /// Local SOCKS port to place in the config
        #[arg(long, default_value = "1080")]
        port: u16,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Stderr subscriber used while the config file, and with it the log
/// level, is still being resolved.
fn bootstrap_subscriber(json: bool) -> Box<dyn tracing::Subscriber + Send + Sync> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    }
}

/// Decode every share link found in `inputs`.
fn read_inputs(inputs: &[PathBuf]) -> Result<Vec<EndpointDescriptor>> {
    let mut descriptors = Vec::new();
    for input in inputs {
        if input.as_os_str() == "-" {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("failed to read stdin")?;
            descriptors.extend(descriptor::parse::parse_text(&text));
        } else if input.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(input)
                .with_context(|| format!("failed to list {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            files.sort();
            for file in files {
                descriptors.extend(read_file(&file)?);
            }
        } else {
            descriptors.extend(read_file(input)?);
        }
    }
    tracing::info!(count = descriptors.len(), "decoded candidates");
    Ok(descriptors)
}

fn read_file(path: &Path) -> Result<Vec<EndpointDescriptor>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(descriptor::parse::parse_text(&text))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = tracing::subscriber::with_default(bootstrap_subscriber(cli.log_json), || {
        SieveConfig::resolve(cli.config.as_deref())
    })?;
    init_tracing(&config.logging.level, cli.log_json || config.logging.json);

    match cli.command {
        Commands::Verify {
            inputs,
            engine,
            workers,
            max_latency_ms,
            output,
            no_export,
            json,
        } => {
            if let Some(engine) = engine {
                config.engine.path = engine;
            }
            if let Some(workers) = workers {
                config.pool.workers = workers;
            }
            if let Some(ms) = max_latency_ms {
                config.ranking.max_latency_ms = ms;
            }

            let output_dir = config.output.dir.clone();
            let diagnostics_path = config.logging.diagnostic_log_path.clone();
            let pipeline = Pipeline::new(config)?;
            let diagnostics = DiagnosticLog::open(diagnostics_path).await?;
            let pipeline = pipeline.with_diagnostics(Arc::new(diagnostics));
            let candidates = read_inputs(&inputs)?;

            let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
            let show_progress = std::io::stderr().is_terminal();
            let progress_task = tokio::spawn(async move {
                let mut done = 0usize;
                while progress_rx.recv().await.is_some() {
                    done += 1;
                    if show_progress {
                        eprint!("\r  tested: {done}");
                        let _ = std::io::stderr().flush();
                    }
                }
                if show_progress && done > 0 {
                    eprintln!();
                }
            });

            let out = pipeline.run(candidates, Some(progress_tx)).await;
            let _ = progress_task.await;

            if !no_export && !out.ranked.is_empty() {
                let path = report::write_export(&output_dir, output.as_deref(), &out.ranked)?;
                eprintln!("Saved to: {}", path.display());
            }

            if json {
                let body = serde_json::json!({
                    "summary": out.summary,
                    "verdict": out.summary.verdict(),
                    "ranked": out.ranked,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                for r in &out.ranked {
                    println!("[{}ms] {}", r.latency_ms, r.descriptor.original);
                }
                eprintln!("{}", out.summary.render());
            }
        }
        Commands::Prefilter { inputs, timeout_ms } => {
            if let Some(ms) = timeout_ms {
                config.prefilter.connect_timeout_ms = ms;
            }
            let candidates = descriptor::dedup::dedup(read_inputs(&inputs)?);
            let reachable = TcpPrefilter::from_config(&config.prefilter).run(candidates).await;
            for d in &reachable {
                println!("{}", d.original);
            }
        }
        Commands::RenderConfig { link, port } => {
            let d = descriptor::parse::parse_link(&link)
                .context("failed to decode share link")?;
            let rendered = SingBoxConfig::build(&d, port, &config.engine)
                .context("failed to build engine config")?;
            println!("{}", rendered.to_json_pretty()?);
        }
    }

    Ok(())
}
