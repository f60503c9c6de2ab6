//! CLI entry point for hlsenc
//!
//! Parses command line arguments, loads configuration, and runs one
//! Coordinator pass over the configured input/output directories.

use clap::Parser;
use hlsenc_config::Config;
use hlsenc_core::{exit_code_for, Coordinator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// hlsenc - batch HLS packaging driven by FFmpeg
#[derive(Parser, Debug)]
#[command(name = "hlsenc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Input directory override; defaults to the config file's input_folder
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory override; defaults to the config file's output_folder
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Skip the FFmpeg/FFprobe preflight check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    println!("hlsenc starting...");
    println!("Config file: {}", args.config.display());

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::from(3);
        }
    };

    if let Some(input) = &args.input {
        config.input_folder = input.display().to_string();
    }
    if let Some(output) = &args.output {
        config.output_folder = output.display().to_string();
    }

    println!("Input directory: {}", config.input_folder);
    println!("Output directory: {}", config.output_folder);

    let coordinator = if args.skip_checks {
        println!("WARNING: Skipping startup checks (--skip-checks enabled)");
        Coordinator::new_without_checks(config)
    } else {
        Coordinator::new(config)
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("received interrupt, cancelling outstanding jobs...");
            signal_cancel.cancel();
        }
    });

    let (progress_tx, mut progress_rx) =
        tokio::sync::watch::channel(hlsenc_core::AggregateSnapshot::default());
    tokio::spawn(async move {
        while progress_rx.changed().await.is_ok() {
            let snap = *progress_rx.borrow();
            println!(
                "progress: {} completed, {} failed, {} running, {} pending, {} cancelled ({:.0}%)",
                snap.completed,
                snap.failed,
                snap.running,
                snap.pending,
                snap.cancelled,
                snap.overall_fraction * 100.0
            );
        }
    });

    let result = coordinator.run(cancel, progress_tx).await;

    let code = exit_code_for(&result);
    match result {
        Ok(report) => {
            for rejection in &report.intake_rejections {
                eprintln!("intake rejected: {}", rejection);
            }
            for entry in &report.entries {
                if entry.state != hlsenc_core::JobState::Succeeded {
                    eprintln!(
                        "{}: {:?} after {} attempt(s): {:?}",
                        entry.input_path.display(),
                        entry.state,
                        entry.attempts,
                        entry.failure
                    );
                }
            }
            println!("done, exit code {code}");
        }
        Err(e) => {
            eprintln!("run failed: {}", e);
        }
    }

    ExitCode::from(code as u8)
}
