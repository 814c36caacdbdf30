use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use converter::{
    ConverterConfig, JobHandle, JobId, JobOrchestrator, JobOutcome, JobState, LocalTransport, ProfileRegistry,
    ProgressSink, SourceRef, WorkspaceManager,
};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod inbox;

use inbox::Inbox;

/// Video conversion daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert the given files and exit
    Convert {
        /// Input video files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Encode profile name or alias
        #[arg(short, long, default_value = "mp4")]
        profile: String,

        /// Directory receiving converted files
        #[arg(short, long, default_value = "./converted")]
        outbox: PathBuf,
    },

    /// Watch an inbox directory and convert whatever lands in it
    Watch {
        /// Directory to watch for new videos
        #[arg(short, long)]
        inbox: PathBuf,

        /// Encode profile name or alias
        #[arg(short, long, default_value = "mp4")]
        profile: String,

        /// Directory receiving converted files
        #[arg(short, long, default_value = "./converted")]
        outbox: PathBuf,

        /// Seconds between inbox scans
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,
    },

    /// List the configured encode profiles
    Profiles,

    /// Remove workspaces left behind under the scratch root
    Sweep,
}

/// Logs job progress and outcomes
#[derive(Debug, Default)]
struct LogSink;

impl ProgressSink for LogSink {
    fn on_progress(&self, job: JobId, stage: JobState, fraction: f64) {
        if fraction >= 1.0 {
            info!("Job {}: {} done", job, stage);
        } else {
            debug!("Job {}: {} {:.0}%", job, stage, fraction * 100.0);
        }
    }

    fn on_finished(&self, job: JobId, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Succeeded { output } => info!("✅ Job {}: converted to {}", job, output),
            JobOutcome::Failed(err) => error!("Job {}: {} [{}]", job, err.user_message(), err),
            JobOutcome::Cancelled => warn!("Job {}: cancelled", job),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = ConverterConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    cfg.apply_env_overrides().context("Invalid environment override")?;
    cfg.validate().context("Invalid configuration")?;

    match args.command {
        Command::Profiles => list_profiles(&cfg),
        Command::Sweep => sweep(&cfg),
        Command::Convert { files, profile, outbox } => convert(cfg, files, &profile, &outbox).await,
        Command::Watch {
            inbox,
            profile,
            outbox,
            interval_secs,
        } => watch(cfg, &inbox, &profile, &outbox, Duration::from_secs(interval_secs.max(1))).await,
    }
}

fn log_config(cfg: &ConverterConfig) {
    info!("Configuration loaded:");
    info!("  Scratch root: {}", cfg.scratch_root.display());
    info!("  Max file size: {}", humansize::format_size(cfg.max_file_size_bytes, humansize::DECIMAL));
    info!("  Max concurrent jobs: {}", cfg.max_concurrent_jobs);
    if let Some(per_owner) = cfg.max_jobs_per_owner {
        info!("  Max jobs per owner: {}", per_owner);
    }
    info!("  Encoder: {} (timeout {}s)", cfg.encoder_bin.display(), cfg.encoder_timeout_secs);
    match &cfg.ffprobe_bin {
        Some(bin) => info!("  ffprobe: {}", bin.display()),
        None => info!("  ffprobe: disabled"),
    }
}

fn list_profiles(cfg: &ConverterConfig) -> Result<()> {
    let registry = ProfileRegistry::new(cfg.profiles.clone())?;
    for profile in registry.list() {
        let aliases = if profile.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", profile.aliases.join(", "))
        };
        println!("{}{}", profile.name, aliases);
        println!("    {}", profile.describe());
    }
    Ok(())
}

fn sweep(cfg: &ConverterConfig) -> Result<()> {
    let manager = WorkspaceManager::new(&cfg.scratch_root, 0)?;
    let removed = manager.sweep_orphans()?;
    info!("🧹 Removed {} orphaned workspace(s) from {}", removed, cfg.scratch_root.display());
    Ok(())
}

async fn start(cfg: ConverterConfig, outbox: &Path) -> Result<JobOrchestrator> {
    log_config(&cfg);
    let transport = LocalTransport::new(outbox)
        .with_context(|| format!("Failed to create outbox: {}", outbox.display()))?;
    let orchestrator = JobOrchestrator::new(cfg, Arc::new(transport))?;

    match orchestrator.encoder().detect_version().await {
        Ok(version) => info!("🎬 Encoder version {}", version),
        Err(e) => warn!("⚠️  Encoder not usable, jobs will fail until it is: {:#}", e),
    }
    Ok(orchestrator)
}

/// Source for a local file whose size is already known
fn sized_source(path: &Path, size: u64) -> Result<SourceRef> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Input has no usable file name: {}", path.display()))?;
    Ok(SourceRef::new(path.display().to_string(), file_name).with_declared_size(size))
}

fn local_source(path: &Path) -> Result<SourceRef> {
    let meta = std::fs::metadata(path).with_context(|| format!("Failed to stat input: {}", path.display()))?;
    sized_source(path, meta.len())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Could not install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn convert(cfg: ConverterConfig, files: Vec<PathBuf>, profile: &str, outbox: &Path) -> Result<()> {
    let orchestrator = start(cfg, outbox).await?;
    let sink: Arc<dyn ProgressSink> = Arc::new(LogSink);

    let mut handles: Vec<JobHandle> = Vec::new();
    for file in &files {
        let source = local_source(file)?;
        handles.push(orchestrator.submit(source, profile, Arc::clone(&sink)));
    }

    let all_done = async {
        for handle in &handles {
            handle.wait().await;
        }
    };
    tokio::select! {
        _ = all_done => {}
        _ = shutdown_signal() => {
            warn!("🛑 Interrupted, cancelling conversions...");
            orchestrator.shutdown();
        }
    }
    orchestrator.drain().await;

    let failed = handles
        .iter()
        .filter(|h| h.snapshot().state != JobState::Succeeded)
        .count();
    if failed > 0 {
        bail!("{} of {} conversion(s) did not succeed", failed, handles.len());
    }
    info!("✅ All {} conversion(s) succeeded", handles.len());
    Ok(())
}

async fn watch(cfg: ConverterConfig, inbox_dir: &Path, profile: &str, outbox: &Path, interval: Duration) -> Result<()> {
    let orchestrator = start(cfg, outbox).await?;
    // fail fast on a typo instead of rejecting every file later
    orchestrator.profiles().resolve(profile)?;

    let mut inbox = Inbox::new(inbox_dir)?;
    let sink: Arc<dyn ProgressSink> = Arc::new(LogSink);
    info!("👀 Watching {} (every {}s)", inbox.root().display(), interval.as_secs());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                for arrival in inbox.poll() {
                    match sized_source(&arrival.path, arrival.size) {
                        Ok(source) => {
                            orchestrator.submit(source, profile, Arc::clone(&sink));
                        }
                        Err(e) => warn!("Skipping {}: {:#}", arrival.path.display(), e),
                    }
                }
                let stats = orchestrator.stats();
                if stats.queued > 0 || stats.active > 0 {
                    info!("Job status: {} queued, {} active", stats.queued, stats.active);
                }
            }
        }
    }

    info!("🛑 Shutting down, waiting for running jobs to stop...");
    orchestrator.shutdown();
    orchestrator.drain().await;
    info!("Stopped after {} encoder run(s)", orchestrator.stats().encoder_invocations);
    Ok(())
}
