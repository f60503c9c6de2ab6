//! Run Coordinator: the thin top-level that composes the Resource Monitor,
//! File Intake, and Batch Scheduler for one invocation and reduces their
//! combined output into a single [`Report`].

use crate::intake::{self, IntakeError};
use crate::resource_monitor::ResourceMonitor;
use crate::scheduler::{AggregateSnapshot, FailureKind, JobState, Scheduler, SchedulerConfig};
use hlsenc_config::{Config, ConfigError};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// The encoder binaries a run needs reachable before any Job is created.
const REQUIRED_BINARIES: &[&str] = &["ffmpeg", "ffprobe"];

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("required encoder binary '{binary}' is not reachable: {detail}")]
    EncoderBinaryMissing { binary: String, detail: String },

    #[error("file intake failed: {0}")]
    Intake(#[from] IntakeError),
}

/// Final disposition of one InputFile's Job, after all retries exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub input_path: PathBuf,
    pub state: JobState,
    pub attempts: u32,
    pub last_attempt_wall_time: Duration,
    pub failure: Option<FailureKind>,
}

/// Per-InputFile outcomes for one run, plus the rejected-at-intake list.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub entries: Vec<ReportEntry>,
    pub intake_rejections: Vec<String>,
    pub cancelled: bool,
}

impl Report {
    pub fn all_succeeded(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.state == JobState::Succeeded)
    }

    pub fn any_failed(&self) -> bool {
        self.entries.iter().any(|e| e.state == JobState::Failed)
    }
}

/// Runs `binary -version` (or `--version` for encoders that prefer it) and
/// treats any successfully-spawned process as a reachability signal; the
/// exit status is not inspected since some builds return non-zero for
/// `-version` while still being perfectly usable.
fn check_binary_available(binary: &str) -> Result<(), CoordinatorError> {
    Command::new(binary)
        .arg("-version")
        .output()
        .map(|_| ())
        .map_err(|e| CoordinatorError::EncoderBinaryMissing {
            binary: binary.to_string(),
            detail: e.to_string(),
        })
}

/// Verifies every binary in [`REQUIRED_BINARIES`] is reachable. Run before
/// any Job is dispatched; a missing binary must short-circuit the whole run.
pub fn preflight() -> Result<(), CoordinatorError> {
    for binary in REQUIRED_BINARIES {
        check_binary_available(binary)?;
    }
    Ok(())
}

/// Composes Resource Monitor, File Intake, and Batch Scheduler for one run.
pub struct Coordinator {
    config: Config,
    skip_preflight: bool,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            skip_preflight: false,
        }
    }

    /// Builds a coordinator that skips the binary-reachability preflight.
    /// For testing only: a missing encoder then surfaces as a per-Job
    /// failure instead of exit code 4.
    pub fn new_without_checks(config: Config) -> Self {
        Self {
            config,
            skip_preflight: true,
        }
    }

    /// Runs the whole pipeline: preflight, intake, scheduling, and output
    /// reorganization. `progress_tx` receives aggregate snapshots throughout;
    /// callers that don't care about live progress may drop the receiver.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        progress_tx: watch::Sender<AggregateSnapshot>,
    ) -> Result<Report, CoordinatorError> {
        if !self.skip_preflight {
            preflight()?;
        }

        let input_dir = Path::new(&self.config.input_folder);
        let output_dir = Path::new(&self.config.output_folder);
        std::fs::create_dir_all(output_dir).map_err(|e| CoordinatorError::Intake(e.into()))?;

        let (accepted, rejected) = intake::intake(input_dir, &self.config.intake)?;
        let intake_rejections: Vec<String> = rejected.iter().map(|e| e.to_string()).collect();

        if accepted.is_empty() {
            let _ = progress_tx.send(AggregateSnapshot::default());
            return Ok(Report {
                entries: Vec::new(),
                intake_rejections,
                cancelled: cancel.is_cancelled(),
            });
        }

        let monitor = Arc::new(ResourceMonitor::new(Duration::from_secs(5)));
        let critical = self.config.batch_processing.max_memory_percent / 100.0;
        monitor
            .set_thresholds_memory(critical * 0.875, critical)
            .await;
        monitor.start().await;

        let scheduler_config = SchedulerConfig::from_config(&self.config)?;
        let scheduler = Scheduler::new(scheduler_config, Arc::clone(&monitor));

        let jobs = scheduler
            .run(accepted, output_dir.to_path_buf(), cancel.clone(), progress_tx)
            .await;

        monitor.stop().await;

        let mut entries = Vec::with_capacity(jobs.len());
        let mut completed_dir_names = Vec::new();
        for job in &jobs {
            let g = job.lock().await;
            if g.state == JobState::Succeeded {
                completed_dir_names.push(g.output_dir_name());
            }
            entries.push(ReportEntry {
                input_path: g.input.path.clone(),
                state: g.state.clone(),
                attempts: g.attempt,
                last_attempt_wall_time: g.last_attempt_wall_time,
                failure: g.last_failure.clone(),
            });
        }

        intake::organize_outputs(output_dir, &completed_dir_names, &self.config.intake)?;

        Ok(Report {
            entries,
            intake_rejections,
            cancelled: cancel.is_cancelled(),
        })
    }
}

/// Maps a run's outcome onto the five-way exit code table: 0 all Jobs
/// succeeded, 1 at least one Job failed, 2 cancelled, 3 configuration
/// rejected before any Job dispatched, 4 encoder binary unavailable.
pub fn exit_code_for(result: &Result<Report, CoordinatorError>) -> i32 {
    match result {
        Err(CoordinatorError::EncoderBinaryMissing { .. }) => 4,
        Err(CoordinatorError::Config(_)) | Err(CoordinatorError::Intake(_)) => 3,
        Ok(report) if report.cancelled => 2,
        Ok(report) if report.any_failed() => 1,
        Ok(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_encoder_missing_is_4() {
        let err = CoordinatorError::EncoderBinaryMissing {
            binary: "ffmpeg".to_string(),
            detail: "not found".to_string(),
        };
        assert_eq!(exit_code_for(&Err(err)), 4);
    }

    #[test]
    fn test_exit_code_config_rejected_is_3() {
        let err = CoordinatorError::Config(ConfigError::UnknownEncoder("bogus".to_string()));
        assert_eq!(exit_code_for(&Err(err)), 3);
    }

    #[test]
    fn test_exit_code_cancelled_is_2() {
        let report = Report {
            entries: vec![ReportEntry {
                input_path: PathBuf::from("/in/1-1.mp4"),
                state: JobState::Cancelled,
                attempts: 1,
                last_attempt_wall_time: Duration::ZERO,
                failure: None,
            }],
            intake_rejections: Vec::new(),
            cancelled: true,
        };
        assert_eq!(exit_code_for(&Ok(report)), 2);
    }

    #[test]
    fn test_exit_code_any_failed_is_1() {
        let report = Report {
            entries: vec![ReportEntry {
                input_path: PathBuf::from("/in/1-1.mp4"),
                state: JobState::Failed,
                attempts: 3,
                last_attempt_wall_time: Duration::ZERO,
                failure: Some(FailureKind::EncoderAborted),
            }],
            intake_rejections: Vec::new(),
            cancelled: false,
        };
        assert_eq!(exit_code_for(&Ok(report)), 1);
    }

    #[test]
    fn test_exit_code_all_succeeded_is_0() {
        let report = Report {
            entries: vec![ReportEntry {
                input_path: PathBuf::from("/in/1-1.mp4"),
                state: JobState::Succeeded,
                attempts: 1,
                last_attempt_wall_time: Duration::ZERO,
                failure: None,
            }],
            intake_rejections: Vec::new(),
            cancelled: false,
        };
        assert_eq!(exit_code_for(&Ok(report)), 0);
    }

    #[test]
    fn test_exit_code_empty_report_is_0() {
        let report = Report::default();
        assert_eq!(exit_code_for(&Ok(report)), 0);
    }
}
