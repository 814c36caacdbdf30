//! Job orchestration: admission control, the per-job pipeline and its
//! terminal bookkeeping.
//!
//! Submitted jobs wait in a FIFO queue until a slot is free. An admitted job
//! runs download -> validate -> encode -> upload in its own task; whatever
//! happens, its workspace is released before its terminal state is published
//! and the observer hears about the outcome exactly once.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::ConverterConfig;
use crate::encoder::{EncodeRequest, EncoderSupervisor};
use crate::error::{EncodeError, ErrorKind, JobError, TransferError, WorkspaceError};
use crate::ffprobe;
use crate::job::{ConversionJob, JobId, JobOutcome, JobState, RemoteRef, SourceRef};
use crate::profile::{EncodeProfile, ProfileRegistry};
use crate::progress::{ProgressReporter, ProgressSink};
use crate::transfer::{TransferStager, Transport};
use crate::workspace::{Workspace, WorkspaceManager};

/// Counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub queued: usize,
    pub active: usize,
    /// Encoder processes started since the orchestrator was created
    pub encoder_invocations: usize,
}

/// Observer's view of one submitted job
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    status: watch::Receiver<ConversionJob>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Current state of the job
    pub fn snapshot(&self) -> ConversionJob {
        self.status.borrow().clone()
    }

    /// Wait until the job is terminal and return its final snapshot
    pub async fn wait(&self) -> ConversionJob {
        let mut status = self.status.clone();
        if let Ok(job) = status.wait_for(|job| job.state.is_terminal()).await {
            return job.clone();
        }
        // sender gone; the last value is as final as it gets
        let last = status.borrow().clone();
        last
    }
}

/// Book-keeping for one job from submission to its terminal state
struct JobSlot {
    id: JobId,
    owner: Option<String>,
    source: SourceRef,
    profile: EncodeProfile,
    status: watch::Sender<ConversionJob>,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
    /// Set once the artifact is about to be committed; cancellation is refused from then on
    sealed: Mutex<bool>,
}

impl JobSlot {
    fn sealed(&self) -> MutexGuard<'_, bool> {
        self.sealed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pass the point of no return. False if cancellation got in first.
    fn seal(&self) -> bool {
        let mut sealed = self.sealed();
        if self.cancel.is_cancelled() {
            return false;
        }
        *sealed = true;
        true
    }

    /// Signal cancellation unless the job is sealed or already terminal.
    /// A job that accepts the signal is guaranteed to end `Cancelled`.
    fn request_cancel(&self) -> bool {
        let sealed = self.sealed();
        if *sealed || self.status.borrow().state.is_terminal() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    fn finish_unstarted(&self, error: Option<JobError>) {
        finish_unstarted(self.id, &self.status, self.sink.as_ref(), error);
    }
}

/// Move a job that never ran to `Failed` (with `error`) or `Cancelled`
fn finish_unstarted(
    id: JobId,
    status: &watch::Sender<ConversionJob>,
    sink: &dyn ProgressSink,
    error: Option<JobError>,
) {
    let mut job = status.borrow().clone();
    let moved = match error {
        Some(err) => job.fail(err),
        None => job.cancel(),
    };
    if let Err(e) = moved {
        error!("Job {}: {}", id, e);
        return;
    }
    if let Some(outcome) = job.outcome() {
        sink.on_finished(id, &outcome);
    }
    status.send_replace(job);
}

#[derive(Default)]
struct Scheduler {
    queue: VecDeque<Arc<JobSlot>>,
    running: HashMap<JobId, Arc<JobSlot>>,
    per_owner: HashMap<String, usize>,
    shutting_down: bool,
}

impl Scheduler {
    fn owner_has_room(&self, owner: Option<&str>, limit: Option<usize>) -> bool {
        match (owner, limit) {
            (Some(owner), Some(limit)) => self.per_owner.get(owner).copied().unwrap_or(0) < limit,
            _ => true,
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }
}

struct Inner {
    cfg: ConverterConfig,
    profiles: ProfileRegistry,
    workspaces: Arc<WorkspaceManager>,
    stager: TransferStager,
    encoder: EncoderSupervisor,
    runtime: Handle,
    scheduler: Mutex<Scheduler>,
    shutdown: CancellationToken,
    encoder_invocations: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit queued jobs in FIFO order while slots are free.
    /// A job whose owner is at its limit is skipped, not blocking those behind it.
    fn pump(self: &Arc<Self>) {
        let admitted = {
            let mut guard = self.scheduler();
            let sched = &mut *guard;
            let mut admitted = Vec::new();

            while !sched.shutting_down && sched.running.len() < self.cfg.max_concurrent_jobs {
                let limit = self.cfg.max_jobs_per_owner;
                let next = sched
                    .queue
                    .iter()
                    .position(|slot| sched.owner_has_room(slot.owner.as_deref(), limit));
                let Some(slot) = next.and_then(|pos| sched.queue.remove(pos)) else {
                    break;
                };

                if let Some(owner) = &slot.owner {
                    *sched.per_owner.entry(owner.clone()).or_insert(0) += 1;
                }
                sched.running.insert(slot.id, Arc::clone(&slot));
                admitted.push(slot);
            }
            admitted
        };

        for slot in admitted {
            info!("▶️  Job {}: admitted", slot.id);
            let inner = Arc::clone(self);
            self.runtime.spawn(async move { inner.run_job(slot).await });
        }
    }

    /// Give a finished job's slot back and admit whoever is next
    fn release_slot(self: &Arc<Self>, slot: &JobSlot) {
        {
            let mut sched = self.scheduler();
            sched.running.remove(&slot.id);
            if let Some(owner) = &slot.owner {
                if let Some(count) = sched.per_owner.get_mut(owner) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        sched.per_owner.remove(owner);
                    }
                }
            }
        }
        self.pump();
        self.idle.notify_waiters();
    }

    async fn run_job(self: Arc<Self>, slot: Arc<JobSlot>) {
        let (reporter, forwarder) =
            ProgressReporter::spawn(slot.id, Arc::clone(&slot.sink), self.cfg.progress_queue_capacity);

        let pipeline = Pipeline {
            inner: Arc::clone(&self),
            slot: Arc::clone(&slot),
            reporter,
        };
        // a panic inside the pipeline surfaces here instead of taking the slot with it
        let result = match tokio::spawn(pipeline.run()).await {
            Ok(result) => result,
            Err(e) => Err(Interrupt::Failed(JobError::internal(format!("job pipeline aborted: {}", e)))),
        };

        // every reporter clone is gone now; let queued progress reach the sink first
        if let Err(e) = forwarder.await {
            warn!("Job {}: progress forwarder failed: {}", slot.id, e);
        }

        let mut job = slot.status.borrow().clone();
        let moved = match result {
            Ok(output) => job.succeed(output),
            Err(Interrupt::Cancelled) => job.cancel(),
            Err(Interrupt::Failed(err)) => job.fail(err),
        };
        if let Err(e) = moved {
            error!("Job {}: {}", slot.id, e);
        }

        match &job.outcome() {
            Some(outcome) => {
                match outcome {
                    JobOutcome::Succeeded { output } => info!("✅ Job {}: delivered {}", slot.id, output),
                    JobOutcome::Failed(err) => error!("❌ Job {}: {}", slot.id, err),
                    JobOutcome::Cancelled => info!("🛑 Job {}: cancelled", slot.id),
                }
                slot.sink.on_finished(slot.id, outcome);
            }
            None => error!("Job {}: finished without a terminal state", slot.id),
        }
        slot.status.send_replace(job);

        self.release_slot(&slot);
    }
}

/// Why a pipeline stopped early
enum Interrupt {
    Cancelled,
    Failed(JobError),
}

impl From<JobError> for Interrupt {
    fn from(err: JobError) -> Self {
        Interrupt::Failed(err)
    }
}

impl From<WorkspaceError> for Interrupt {
    fn from(err: WorkspaceError) -> Self {
        Interrupt::Failed(err.into())
    }
}

impl From<TransferError> for Interrupt {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => Interrupt::Cancelled,
            other => Interrupt::Failed(other.into()),
        }
    }
}

impl From<EncodeError> for Interrupt {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::Cancelled => Interrupt::Cancelled,
            other => Interrupt::Failed(other.into()),
        }
    }
}

/// One admitted job's stages
struct Pipeline {
    inner: Arc<Inner>,
    slot: Arc<JobSlot>,
    reporter: ProgressReporter,
}

impl Pipeline {
    async fn run(self) -> Result<RemoteRef, Interrupt> {
        self.check_cancel()?;

        let workspaces = Arc::clone(&self.inner.workspaces);
        let id = self.slot.id;
        let workspace = tokio::task::spawn_blocking(move || workspaces.allocate(id))
            .await
            .map_err(|e| JobError::internal(format!("workspace allocation aborted: {}", e)))??;
        let path = workspace.path().to_path_buf();
        self.slot.status.send_modify(|job| job.workspace_path = Some(path));

        let result = self.stages(&workspace).await;

        let released = tokio::task::spawn_blocking(move || workspace.release()).await;
        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Job {}: {}", id, e),
            Err(e) => warn!("Job {}: workspace release aborted: {}", id, e),
        }

        result
    }

    async fn stages(&self, workspace: &Workspace) -> Result<RemoteRef, Interrupt> {
        let cfg = &self.inner.cfg;
        let slot = &self.slot;

        // Downloading
        self.enter(JobState::Downloading)?;
        let extension = slot.source.extension().unwrap_or_else(|| "bin".to_string());
        let source_path = workspace.file(&format!("source.{}", extension));
        let bytes = self
            .inner
            .stager
            .download(&slot.source, &source_path, cfg.max_file_size_bytes, &slot.cancel, |done, total| {
                self.byte_progress(JobState::Downloading, done, total)
            })
            .await?;
        self.complete(JobState::Downloading).await;
        info!("📥 Job {}: downloaded {}", slot.id, humansize::format_size(bytes, humansize::DECIMAL));

        // Validating
        self.check_cancel()?;
        self.enter(JobState::Validating)?;
        let duration = ffprobe::validate_source(cfg.ffprobe_bin.as_deref(), &source_path).await?;
        self.complete(JobState::Validating).await;

        // Encoding
        self.check_cancel()?;
        self.enter(JobState::Encoding)?;
        self.inner.encoder_invocations.fetch_add(1, Ordering::SeqCst);
        info!("🎬 Job {}: encoding with {}", slot.id, slot.profile.name);
        let artifact = self
            .inner
            .encoder
            .run(
                EncodeRequest {
                    input: &source_path,
                    profile: &slot.profile,
                    workspace: workspace.path(),
                    duration_hint: duration,
                    deadline: cfg.encoder_timeout(),
                },
                &slot.cancel,
                self.fraction_progress(JobState::Encoding),
            )
            .await?;
        self.complete(JobState::Encoding).await;
        if let Err(e) = tokio::fs::remove_file(&source_path).await {
            debug!("Job {}: could not remove staged source early: {}", slot.id, e);
        }

        // Uploading
        self.check_cancel()?;
        self.enter(JobState::Uploading)?;
        let file_name = format!("{}.{}", slot.source.stem(), slot.profile.container.extension());
        let remote = self
            .inner
            .stager
            .upload(
                &artifact,
                &file_name,
                cfg.max_file_size_bytes,
                &slot.cancel,
                |done, total| self.byte_progress(JobState::Uploading, done, total),
                || slot.seal(),
            )
            .await?;
        self.complete(JobState::Uploading).await;

        Ok(remote)
    }

    fn check_cancel(&self) -> Result<(), Interrupt> {
        if self.slot.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn enter(&self, stage: JobState) -> Result<(), Interrupt> {
        let mut moved = Ok(());
        self.slot.status.send_modify(|job| moved = job.transition(stage));
        moved.map_err(|e| Interrupt::Failed(JobError::internal(e.to_string())))?;
        debug!("Job {}: {}", self.slot.id, stage);
        self.reporter.report(stage, 0.0);
        Ok(())
    }

    fn byte_progress(&self, stage: JobState, done: u64, total: Option<u64>) {
        if let Some(total) = total.filter(|t| *t > 0) {
            let fraction = self.reporter.report(stage, done as f64 / total as f64);
            record_fraction(&self.slot, stage, fraction);
        }
    }

    /// Progress callback that can outlive the borrow of `self`
    fn fraction_progress(&self, stage: JobState) -> impl FnMut(f64) + Send + 'static {
        let reporter = self.reporter.clone();
        let slot = Arc::clone(&self.slot);
        move |fraction| {
            let fraction = reporter.report(stage, fraction);
            record_fraction(&slot, stage, fraction);
        }
    }

    async fn complete(&self, stage: JobState) {
        let fraction = self.reporter.complete(stage).await;
        record_fraction(&self.slot, stage, fraction);
    }
}

fn record_fraction(slot: &JobSlot, stage: JobState, fraction: f64) {
    slot.status.send_if_modified(|job| {
        if job.state == stage && job.progress.fraction != fraction {
            job.progress.fraction = fraction;
            true
        } else {
            false
        }
    });
}

/// Accepts conversion requests and runs them under the configured limits
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    /// Build an orchestrator; must be called from within a Tokio runtime.
    /// Workspaces left behind by a previous run are swept here.
    pub fn new(cfg: ConverterConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let workspaces = WorkspaceManager::new(&cfg.scratch_root, cfg.min_free_bytes)
            .context("Failed to prepare scratch root")?;
        Self::with_workspace_manager(cfg, transport, Arc::new(workspaces))
    }

    pub fn with_workspace_manager(
        cfg: ConverterConfig,
        transport: Arc<dyn Transport>,
        workspaces: Arc<WorkspaceManager>,
    ) -> Result<Self> {
        cfg.validate()?;
        let runtime = Handle::try_current().context("JobOrchestrator needs a Tokio runtime")?;
        let profiles = ProfileRegistry::new(cfg.profiles.clone())?;

        let swept = workspaces.sweep_orphans().context("Failed to sweep scratch root")?;
        if swept > 0 {
            info!("🧹 Removed {} orphaned workspace(s) under {}", swept, workspaces.root().display());
        }

        let stager = TransferStager::new(transport, cfg.transfer_chunk_bytes, cfg.progress_interval());
        let encoder = EncoderSupervisor::new(&cfg.encoder_bin, cfg.kill_grace());

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                profiles,
                workspaces,
                stager,
                encoder,
                runtime,
                scheduler: Mutex::new(Scheduler::default()),
                shutdown: CancellationToken::new(),
                encoder_invocations: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.inner.cfg
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.inner.profiles
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.inner.workspaces.root().to_path_buf()
    }

    pub fn encoder(&self) -> &EncoderSupervisor {
        &self.inner.encoder
    }

    /// Checks that need no download: known profile, video input, declared size
    fn preflight(&self, source: &SourceRef, profile: &str) -> Result<EncodeProfile, JobError> {
        let profile = self.inner.profiles.resolve(profile)?.clone();

        if !source.looks_like_video() {
            return Err(JobError::validation(format!(
                "unsupported format: {} ({})",
                source.file_name,
                source.mime_type.as_deref().unwrap_or("no MIME type")
            )));
        }

        let limit = self.inner.cfg.max_file_size_bytes;
        if let Some(declared) = source.declared_size.filter(|size| *size > limit) {
            return Err(TransferError::SizeLimitExceeded {
                limit,
                observed: declared,
            }
            .into());
        }

        Ok(profile)
    }

    /// Submit a conversion. Returns at once; jobs that fail pre-flight checks
    /// come back already terminal and never take a slot.
    pub fn submit(&self, source: SourceRef, profile: &str, sink: Arc<dyn ProgressSink>) -> JobHandle {
        let job = ConversionJob::new(source.clone(), profile);
        let id = job.id;
        let (status, receiver) = watch::channel(job);
        let handle = JobHandle { id, status: receiver };

        let profile = match self.preflight(&source, profile) {
            Ok(profile) => profile,
            Err(err) => {
                warn!("🚫 Job {}: rejected {}: {}", id, source.file_name, err);
                finish_unstarted(id, &status, sink.as_ref(), Some(err));
                return handle;
            }
        };

        let slot = Arc::new(JobSlot {
            id,
            owner: source.owner.clone(),
            source,
            profile,
            status,
            cancel: self.inner.shutdown.child_token(),
            sink,
            sealed: Mutex::new(false),
        });

        let accepted = {
            let mut sched = self.inner.scheduler();
            if !sched.shutting_down {
                sched.queue.push_back(Arc::clone(&slot));
            }
            !sched.shutting_down
        };
        if !accepted {
            slot.finish_unstarted(Some(JobError::new(ErrorKind::Resource, "converter is shutting down")));
            return handle;
        }

        info!("📋 Job {}: queued {} for {}", id, slot.source.file_name, slot.profile.name);
        self.inner.pump();
        handle
    }

    /// Request cancellation. Returns true only when the job will end `Cancelled`;
    /// false when it is unknown, terminal, or already committing its artifact.
    pub fn cancel(&self, id: JobId) -> bool {
        let queued = {
            let mut sched = self.inner.scheduler();
            if let Some(slot) = sched.running.get(&id) {
                let accepted = slot.request_cancel();
                if accepted {
                    info!("🛑 Job {}: cancellation requested", id);
                } else {
                    debug!("Job {}: too late to cancel", id);
                }
                return accepted;
            }
            match sched.queue.iter().position(|slot| slot.id == id) {
                Some(pos) => sched.queue.remove(pos),
                None => None,
            }
        };

        match queued {
            Some(slot) => {
                info!("🛑 Job {}: cancelled while queued", id);
                slot.finish_unstarted(None);
                self.inner.idle.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Stop admitting work, cancel queued jobs and signal running ones.
    /// Await [`JobOrchestrator::drain`] to wait for them to wind down.
    pub fn shutdown(&self) {
        let queued: Vec<Arc<JobSlot>> = {
            let mut sched = self.inner.scheduler();
            if sched.shutting_down {
                return;
            }
            sched.shutting_down = true;
            sched.queue.drain(..).collect()
        };
        info!("🛑 Shutting down: {} queued job(s) dropped", queued.len());

        self.inner.shutdown.cancel();
        for slot in queued {
            slot.finish_unstarted(None);
        }
        self.inner.idle.notify_waiters();
    }

    /// Wait until no job is queued or running
    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.scheduler().is_idle() {
                return;
            }
            idle.await;
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        let sched = self.inner.scheduler();
        OrchestratorStats {
            queued: sched.queue.len(),
            active: sched.running.len(),
            encoder_invocations: self.inner.encoder_invocations.load(Ordering::SeqCst),
        }
    }
}
