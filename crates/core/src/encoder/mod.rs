//! Encoder driver: builds FFmpeg invocations, probes inputs, and runs
//! encodes with streamed progress and cancellation.

pub mod invocation;
pub mod probe;
pub mod run;

pub use invocation::{build_invocation, BuiltInvocation, InvocationSpec};
pub use probe::{probe, MediaProbeError, ProbeResult};
pub use run::{run as run_invocation, ProgressEvent, RunError, RunHandle, RunOutcome};
