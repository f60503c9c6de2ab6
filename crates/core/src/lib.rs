//! hlsenc-core
//!
//! Drives an external FFmpeg/FFprobe toolchain to package source video into
//! HLS (master playlist + four resolution variants), coordinating a
//! resource-aware batch scheduler over a bounded worker pool.

pub mod coordinator;
pub mod encoder;
pub mod intake;
pub mod resource_monitor;
pub mod scheduler;

pub use coordinator::{exit_code_for, Coordinator, CoordinatorError, Report, ReportEntry};
pub use encoder::{
    build_invocation, probe, run_invocation, BuiltInvocation, InvocationSpec, MediaProbeError,
    ProgressEvent, RunError, RunHandle, RunOutcome,
};
pub use intake::{InputFile, IntakeError};
pub use resource_monitor::{
    worst_of, ResourceMonitor, ResourceSample, ResourceState, ResourceStateSnapshot, Thresholds,
};
pub use scheduler::{
    AggregateSnapshot, Batch, FailureKind, Job, JobState, Scheduler, SchedulerConfig, SharedJob,
};
