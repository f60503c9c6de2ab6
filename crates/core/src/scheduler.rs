//! Batch scheduler: turns an accepted set of `InputFile`s into a stream of
//! completed or definitively failed `Job`s.
//!
//! A single planner loop sizes dispatch batches from the live resource
//! envelope (see [`crate::resource_monitor`]) and hands jobs to a
//! semaphore-bounded worker pool. Each worker owns exactly one job's
//! lifecycle: building the encoder invocation, running it, forwarding
//! progress, and routing the outcome through retry/backoff or a terminal
//! state. The planner never touches a job's mutable fields directly except
//! to force pending/running jobs to `Cancelled` on shutdown.

use crate::encoder::{
    build_invocation, probe, run_invocation, BuiltInvocation, InvocationSpec, MediaProbeError,
    RunError,
};
use crate::resource_monitor::{ResourceMonitor, ResourceState};
use hlsenc_config::Config;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::intake::InputFile;

/// One encoding task for one `InputFile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Backoff,
    Succeeded,
    Failed,
    Cancelled,
}

/// Why a job's most recent attempt did not succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    MediaProbeError(String),
    EncoderFailure { exit_code: i32, stderr_tail: String },
    EncoderAborted,
    FilesystemError(String),
}

impl FailureKind {
    /// Whether this failure is eligible for retry under `retryable_exit_codes`.
    /// `cancelled` short-circuits to `false`: an abort caused by user
    /// cancellation is never retried.
    fn retryable(&self, retryable_exit_codes: &[i32], cancelled: bool) -> bool {
        if cancelled {
            return false;
        }
        match self {
            FailureKind::EncoderFailure { exit_code, .. } => {
                retryable_exit_codes.contains(exit_code)
            }
            FailureKind::EncoderAborted => true,
            FailureKind::MediaProbeError(_) | FailureKind::FilesystemError(_) => false,
        }
    }
}

/// One encoding task for one accepted input file.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub input: InputFile,
    pub output_dir: PathBuf,
    pub attempt: u32,
    pub state: JobState,
    pub started_at: Option<Instant>,
    /// Accumulated progress fraction in `[0, 1]` for the current attempt.
    pub progress_fraction: f64,
    pub last_progress_at: Option<Instant>,
    pub last_failure: Option<FailureKind>,
    /// Wall time of the most recent attempt.
    pub last_attempt_wall_time: Duration,
}

impl Job {
    fn new(input: InputFile, output_root: &std::path::Path) -> Self {
        let base = input
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            id: Uuid::new_v4(),
            output_dir: output_root.join(&base),
            input,
            attempt: 0,
            state: JobState::Pending,
            started_at: None,
            progress_fraction: 0.0,
            last_progress_at: None,
            last_failure: None,
            last_attempt_wall_time: Duration::ZERO,
        }
    }

    /// The canonical output directory name, e.g. `100-1`, used by File
    /// Intake's post-run organization step.
    pub fn output_dir_name(&self) -> String {
        self.output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub type SharedJob = Arc<Mutex<Job>>;

/// A contiguous slice of the pending job list dispatched together. Not a
/// synchronization barrier: jobs within a batch are independent and may
/// finish in any order or interleave with jobs from later batches.
#[derive(Debug, Clone)]
pub struct Batch {
    pub job_ids: Vec<Uuid>,
    pub planned_size: usize,
    pub created_at: Instant,
    pub resource_state: ResourceState,
}

/// A merged point-in-time view across all jobs in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateSnapshot {
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    pub cancelled: usize,
    pub overall_fraction: f64,
}

/// Parameters the scheduler needs, distilled from the loaded [`Config`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    /// When `false`, the planner dispatches up to `worker_count` constantly
    /// and ignores `ResourceState` entirely (no batching, no critical pause).
    pub batch_processing_enabled: bool,
    pub fixed_batch_size: Option<usize>,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retryable_exit_codes: Vec<i32>,
    pub cancel_grace: Duration,
    pub encoder: hlsenc_config::VideoEncoder,
    pub fps: u32,
    pub include_audio: bool,
    pub bitrates: [String; 4],
    pub audio_bitrates: Vec<String>,
    pub hls_time_secs: u32,
}

impl SchedulerConfig {
    /// Derives worker pool capacity `W = max(1, floor(cpu_count * 0.75))`
    /// unless `max_parallel_jobs` overrides it.
    pub fn from_config(cfg: &Config) -> Result<Self, hlsenc_config::ConfigError> {
        let worker_count = match cfg.max_parallel_jobs {
            Some(n) => n.max(1) as usize,
            None => ((num_cpus::get() as f64) * 0.75).floor().max(1.0) as usize,
        };

        Ok(Self {
            worker_count,
            batch_processing_enabled: cfg.batch_processing.enabled,
            fixed_batch_size: cfg.batch_processing.batch_size.map(|n| n as usize),
            max_attempts: cfg.retry.max_attempts,
            retry_base_delay: Duration::from_millis(cfg.retry.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(cfg.retry.retry_max_delay_ms),
            retryable_exit_codes: cfg.retry.retryable_exit_codes.clone(),
            cancel_grace: Duration::from_millis(cfg.retry.cancel_grace_ms),
            encoder: cfg.resolve_encoder()?,
            fps: cfg.fps,
            include_audio: cfg.include_audio,
            bitrates: [
                cfg.bitrates.p1080.clone(),
                cfg.bitrates.p720.clone(),
                cfg.bitrates.p480.clone(),
                cfg.bitrates.p360.clone(),
            ],
            audio_bitrates: cfg.audio_bitrates.clone(),
            hls_time_secs: cfg.hls_time_secs,
        })
    }
}

/// Drives the bounded worker pool over an accepted set of inputs.
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    monitor: Arc<ResourceMonitor>,
}

/// Exponential backoff used while `ResourceState` is `Critical`: the
/// planner does not dispatch at all until it clears, waiting
/// 100ms -> 2s.
const CRITICAL_BACKOFF_START: Duration = Duration::from_millis(100);
const CRITICAL_BACKOFF_CAP: Duration = Duration::from_secs(2);

impl Scheduler {
    pub fn new(config: SchedulerConfig, monitor: Arc<ResourceMonitor>) -> Self {
        Self {
            config: Arc::new(config),
            monitor,
        }
    }

    /// Runs every input to completion (or cancellation), returning the
    /// final job records. `progress_tx` receives an aggregate snapshot at
    /// most every 250ms and on every state change.
    pub async fn run(
        &self,
        inputs: Vec<InputFile>,
        output_root: PathBuf,
        cancel: CancellationToken,
        progress_tx: watch::Sender<AggregateSnapshot>,
    ) -> Vec<SharedJob> {
        let jobs: Vec<SharedJob> = inputs
            .into_iter()
            .map(|input| Arc::new(Mutex::new(Job::new(input, &output_root))))
            .collect();
        let mut pending: VecDeque<SharedJob> = jobs.iter().cloned().collect();

        let semaphore = Arc::new(Semaphore::new(self.config.worker_count));
        let outstanding = Arc::new(AtomicUsize::new(0));
        let backoff_outstanding = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<SharedJob>();

        let mut critical_backoff = CRITICAL_BACKOFF_START;
        let mut last_emit = Instant::now();

        loop {
            // Drain anything that came back from a backoff timer first so
            // it's visible to this planning pass's batch-size decision.
            while let Ok(job) = requeue_rx.try_recv() {
                pending.push_back(job);
            }

            if cancel.is_cancelled() {
                break;
            }

            if pending.is_empty() {
                if outstanding.load(Ordering::SeqCst) == 0
                    && backoff_outstanding.load(Ordering::SeqCst) == 0
                {
                    break;
                }
                emit_if_due(&jobs, &progress_tx, &mut last_emit).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = done_rx.recv() => {}
                    Some(job) = requeue_rx.recv() => { pending.push_back(job); }
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                continue;
            }

            let worst = if self.config.batch_processing_enabled {
                let snapshot = self.monitor.current().await;
                snapshot.worst_state()
            } else {
                ResourceState::Normal
            };

            if worst == ResourceState::Critical {
                emit_if_due(&jobs, &progress_tx, &mut last_emit).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(critical_backoff) => {
                        critical_backoff = (critical_backoff * 2).min(CRITICAL_BACKOFF_CAP);
                    }
                }
                continue;
            }
            critical_backoff = CRITICAL_BACKOFF_START;

            let base_size = match worst {
                ResourceState::Normal => self.config.worker_count.min(pending.len()),
                ResourceState::Warning => (self.config.worker_count / 2).max(1),
                ResourceState::Critical => unreachable!(),
            };
            let planned = if self.config.batch_processing_enabled {
                match self.config.fixed_batch_size {
                    Some(fixed) => fixed.min(base_size),
                    None => base_size,
                }
            } else {
                self.config.worker_count.min(pending.len())
            };
            let dispatch_count = planned.min(pending.len());

            if dispatch_count == 0 {
                emit_if_due(&jobs, &progress_tx, &mut last_emit).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = done_rx.recv() => {}
                    Some(job) = requeue_rx.recv() => { pending.push_back(job); }
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                continue;
            }

            let mut batch_ids = Vec::with_capacity(dispatch_count);
            for _ in 0..dispatch_count {
                let Some(job_arc) = pending.pop_front() else {
                    break;
                };
                batch_ids.push(job_arc.lock().await.id);

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                outstanding.fetch_add(1, Ordering::SeqCst);

                let config = Arc::clone(&self.config);
                let done_tx = done_tx.clone();
                let requeue_tx = requeue_tx.clone();
                let cancel = cancel.clone();
                let outstanding = Arc::clone(&outstanding);
                let backoff_outstanding = Arc::clone(&backoff_outstanding);

                tokio::spawn(async move {
                    run_one_attempt(
                        job_arc,
                        config,
                        cancel,
                        done_tx.clone(),
                        requeue_tx,
                        backoff_outstanding,
                    )
                    .await;
                    drop(permit);
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    let _ = done_tx.send(());
                });
            }

            let _batch = Batch {
                job_ids: batch_ids,
                planned_size: planned,
                created_at: Instant::now(),
                resource_state: worst,
            };

            emit_if_due(&jobs, &progress_tx, &mut last_emit).await;
        }

        if cancel.is_cancelled() {
            for job in pending.drain(..) {
                let mut g = job.lock().await;
                if matches!(g.state, JobState::Pending | JobState::Backoff) {
                    g.state = JobState::Cancelled;
                }
            }

            let grace = self.config.cancel_grace + Duration::from_secs(2);
            let _ = tokio::time::timeout(grace, async {
                while outstanding.load(Ordering::SeqCst) > 0
                    || backoff_outstanding.load(Ordering::SeqCst) > 0
                {
                    done_rx.recv().await;
                }
            })
            .await;

            for job in &jobs {
                let mut g = job.lock().await;
                if !matches!(
                    g.state,
                    JobState::Succeeded | JobState::Failed | JobState::Cancelled
                ) {
                    g.state = JobState::Cancelled;
                }
            }
        }

        let final_snapshot = aggregate(&jobs).await;
        let _ = progress_tx.send(final_snapshot);

        jobs
    }
}

async fn emit_if_due(
    jobs: &[SharedJob],
    tx: &watch::Sender<AggregateSnapshot>,
    last_emit: &mut Instant,
) {
    if last_emit.elapsed() >= Duration::from_millis(250) {
        let snap = aggregate(jobs).await;
        let _ = tx.send(snap);
        *last_emit = Instant::now();
    }
}

async fn aggregate(jobs: &[SharedJob]) -> AggregateSnapshot {
    let mut snap = AggregateSnapshot::default();
    let mut fraction_sum = 0.0;
    for job in jobs {
        let g = job.lock().await;
        match g.state {
            JobState::Succeeded => snap.completed += 1,
            JobState::Failed => snap.failed += 1,
            JobState::Running | JobState::Backoff => snap.running += 1,
            JobState::Pending => snap.pending += 1,
            JobState::Cancelled => snap.cancelled += 1,
        }
        fraction_sum += g.progress_fraction;
    }
    snap.overall_fraction = if jobs.is_empty() {
        1.0
    } else {
        fraction_sum / jobs.len() as f64
    };
    snap
}

/// Runs one attempt of `job_arc` to completion: prepares the output
/// directory, probes the input, builds and runs the encoder invocation,
/// and routes the outcome through retry/backoff or a terminal state.
async fn run_one_attempt(
    job_arc: SharedJob,
    config: Arc<SchedulerConfig>,
    cancel: CancellationToken,
    done_tx: mpsc::UnboundedSender<()>,
    requeue_tx: mpsc::UnboundedSender<SharedJob>,
    backoff_outstanding: Arc<AtomicUsize>,
) {
    let (input_path, output_dir) = {
        let mut g = job_arc.lock().await;
        g.state = JobState::Running;
        g.attempt += 1;
        g.started_at = Some(Instant::now());
        g.progress_fraction = 0.0;
        (g.input.path.clone(), g.output_dir.clone())
    };

    macro_rules! finalize_and_return {
        ($failure:expr, $cancelled:expr) => {{
            finalize(
                &job_arc,
                $failure,
                $cancelled,
                &config,
                &requeue_tx,
                &backoff_outstanding,
            )
            .await;
            return;
        }};
    }

    if output_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&output_dir) {
            finalize_and_return!(FailureKind::FilesystemError(e.to_string()), false);
        }
    }
    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        finalize_and_return!(FailureKind::FilesystemError(e.to_string()), false);
    }

    let probe_result = match tokio::task::spawn_blocking({
        let input_path = input_path.clone();
        move || probe(&input_path)
    })
    .await
    {
        Ok(Ok(p)) => p,
        Ok(Err(MediaProbeError::Io(e))) => {
            finalize_and_return!(FailureKind::FilesystemError(e.to_string()), false);
        }
        Ok(Err(e)) => {
            finalize_and_return!(FailureKind::MediaProbeError(e.to_string()), false);
        }
        Err(join_err) => {
            finalize_and_return!(
                FailureKind::MediaProbeError(format!("probe task panicked: {join_err}")),
                false
            );
        }
    };

    let spec = InvocationSpec {
        input_path,
        output_dir: output_dir.clone(),
        encoder: config.encoder.clone(),
        fps: config.fps,
        include_audio: config.include_audio,
        has_audio_stream: probe_result.has_audio,
        bitrates: config.bitrates.clone(),
        audio_bitrates: config.audio_bitrates.clone(),
        hls_time_secs: config.hls_time_secs,
    };
    let built: BuiltInvocation = build_invocation(&spec);

    let mut handle = match run_invocation(&built, config.cancel_grace).await {
        Ok(h) => h,
        Err(e) => {
            let cancelled = cancel.is_cancelled();
            finalize_and_return!(run_error_to_failure(e), cancelled);
        }
    };

    let duration = probe_result.duration_secs.max(f64::EPSILON);
    loop {
        tokio::select! {
            progress = handle.next_progress() => {
                match progress {
                    Some(event) => {
                        let mut g = job_arc.lock().await;
                        let fraction = (event.elapsed_secs / duration).min(1.0);
                        if fraction > g.progress_fraction {
                            g.progress_fraction = fraction;
                        }
                        g.last_progress_at = Some(Instant::now());
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => {
                handle.cancel();
            }
        }
    }

    let started_at = { job_arc.lock().await.started_at };
    let outcome = handle.wait().await;
    let wall_time = started_at.map(|s| s.elapsed()).unwrap_or_default();

    match outcome {
        Ok(_) => {
            let mut g = job_arc.lock().await;
            g.state = JobState::Succeeded;
            g.progress_fraction = 1.0;
            g.last_attempt_wall_time = wall_time;
        }
        Err(e) => {
            let was_cancelled = cancel.is_cancelled();
            let failure = run_error_to_failure(e);
            {
                let mut g = job_arc.lock().await;
                g.last_attempt_wall_time = wall_time;
            }
            finalize(
                &job_arc,
                failure,
                was_cancelled,
                &config,
                &requeue_tx,
                &backoff_outstanding,
            )
            .await;
        }
    }

    let _ = done_tx;
}

fn run_error_to_failure(e: RunError) -> FailureKind {
    match e {
        RunError::EncoderFailure {
            exit_code,
            stderr_tail,
        } => FailureKind::EncoderFailure {
            exit_code,
            stderr_tail,
        },
        RunError::EncoderAborted => FailureKind::EncoderAborted,
        RunError::Io(e) => FailureKind::FilesystemError(e.to_string()),
    }
}

/// Routes a failed attempt to `Cancelled` (if the run was cancelled),
/// `Backoff` -> re-`Pending` (if retryable and attempts remain), or
/// terminal `Failed`. Retry scheduling spawns a detached timer task that
/// re-enqueues the job onto `requeue_tx` once the backoff delay elapses.
async fn finalize(
    job_arc: &SharedJob,
    failure: FailureKind,
    was_cancelled: bool,
    config: &Arc<SchedulerConfig>,
    requeue_tx: &mpsc::UnboundedSender<SharedJob>,
    backoff_outstanding: &Arc<AtomicUsize>,
) {
    if was_cancelled {
        let mut g = job_arc.lock().await;
        g.state = JobState::Cancelled;
        g.last_failure = Some(failure);
        return;
    }

    let attempt = { job_arc.lock().await.attempt };
    let retryable =
        attempt < config.max_attempts && failure.retryable(&config.retryable_exit_codes, false);

    if !retryable {
        let mut g = job_arc.lock().await;
        g.state = JobState::Failed;
        g.last_failure = Some(failure);
        return;
    }

    {
        let mut g = job_arc.lock().await;
        g.state = JobState::Backoff;
        g.last_failure = Some(failure);
    }

    let delay = (config.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(config.retry_max_delay);

    backoff_outstanding.fetch_add(1, Ordering::SeqCst);
    let job_arc = Arc::clone(job_arc);
    let requeue_tx = requeue_tx.clone();
    let backoff_outstanding = Arc::clone(backoff_outstanding);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut g = job_arc.lock().await;
        if g.state == JobState::Backoff {
            g.state = JobState::Pending;
            drop(g);
            let _ = requeue_tx.send(job_arc);
        }
        backoff_outstanding.fetch_sub(1, Ordering::SeqCst);
    });
}
