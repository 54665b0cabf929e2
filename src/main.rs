//! # Streaming Benchmark - Main Entry Point
//!
//! One invocation launches the workers of one role as tasks, `num_pairs`
//! senders or `num_pairs * receivers_per_sender` receivers, and optionally
//! the coordinator alongside them:
//!
//! ```text
//! streaming-bench receiver -n 2 -r 2 --coordinator-ip 10.0.0.1
//! streaming-bench sender   -n 2 -r 2 --coordinator --bind-ip 10.0.0.1
//! ```
//!
//! ## Exit Codes
//!
//! - `0`: every case ran (individual pairs may still have failed cases)
//! - `1`: a fatal error: registration timeout, loss of the control channel,
//!   or a worker that terminated on an error
//! - `130`: the operator interrupted the run; it stopped between cases

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use streaming_bench::{
    cli::{Args, Role},
    config::BenchmarkSettings,
    coordinator::Coordinator,
    logging,
    results::{load_completed_cases, OutputPaths, ResultAggregator},
    worker::Worker,
    VERSION,
};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_level);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let settings = BenchmarkSettings::from_args(&args)?;
    info!(
        "Starting streaming-bench {} ({} workers{})",
        VERSION,
        args.role,
        if args.coordinator { " + coordinator" } else { "" }
    );

    // Bind the coordinator first so local workers find it on their first try.
    let coordinator = if args.coordinator {
        Some(prepare_coordinator(&settings).await?)
    } else {
        None
    };

    let worker_count = match args.role {
        Role::Sender => settings.workers.num_pairs,
        Role::Receiver => settings.workers.expected_receivers(),
    };
    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let worker = Worker::new(args.role, &settings);
        let span = info_span!("worker", id = %worker.id());
        workers.push(tokio::spawn(worker.run().instrument(span)));
    }

    let mut failed = false;
    let mut cancelled = false;

    if let Some((coordinator, mut aggregator)) = coordinator {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current case");
                let _ = cancel_tx.send(true);
            }
        });

        match coordinator
            .run(&mut aggregator, cancel_rx)
            .instrument(info_span!("coordinator"))
            .await
        {
            Ok(summary) => cancelled = summary.cancelled,
            Err(e) => {
                error!("Coordinator failed: {}", e);
                failed = true;
            }
        }

        aggregator
            .finalize(&settings)
            .context("Failed to finalize results")?;
        aggregator.print_summary();
    }

    for handle in workers {
        match handle.await {
            Ok(Ok(outcome)) => info!(
                "Worker {} finished: {} cases run, {} failed",
                outcome.identity.id, outcome.cases_run, outcome.cases_failed
            ),
            Ok(Err(e)) => {
                error!("Worker failed: {}", e);
                failed = true;
            }
            Err(e) => {
                error!("Worker task panicked: {}", e);
                failed = true;
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else if cancelled {
        ExitCode::from(EXIT_CANCELLED)
    } else {
        ExitCode::SUCCESS
    })
}

/// Set up output, snapshot the settings and bind the control listeners
async fn prepare_coordinator(settings: &BenchmarkSettings) -> Result<(Coordinator, ResultAggregator)> {
    let run_dir = settings.output.run_dir(chrono::Local::now());
    let paths = OutputPaths::new(&run_dir, &settings.output);
    let aggregator = ResultAggregator::with_output(paths.clone())?;
    settings.save(&paths.config)?;

    let mut coordinator = Coordinator::bind(settings).await?;
    if let Some(previous) = &settings.output.resume_from {
        let completed = load_completed_cases(previous, settings.workers.num_pairs)?;
        info!(
            "Resuming from {}: {} cases already complete",
            previous.display(),
            completed.len()
        );
        coordinator.skip_completed(completed);
    }

    info!(
        "Test matrix has {} cases, results go to {}",
        coordinator.matrix().len(),
        run_dir.display()
    );
    Ok((coordinator, aggregator))
}
