//! # Streaming Benchmark Harness Library
//!
//! A distributed throughput benchmark for message streaming. A coordinator
//! drives a fleet of sender and receiver workers through a matrix of test
//! cases and records how many messages, and how many bytes per second, each
//! sender/receiver pair moved.
//!
//! ## Delivery Patterns
//!
//! - **Work queue**: each message goes to exactly one of the pair's
//!   receivers; a full receiver pushes back on the sender
//! - **Fan-out**: every receiver gets every message; a full receiver
//!   silently misses messages, which shows up as `pct_received < 1.0`
//!
//! ## Architecture Overview
//!
//! The library is organized into several key modules:
//!
//! - `coordinator`: worker registry, ready/completion barriers and the
//!   control loop that walks the test matrix
//! - `worker`: the worker state machine following coordinator commands
//! - `session`: the TCP data plane that actually moves the messages
//! - `protocol`: typed control messages and their frame codec
//! - `matrix`: test case generation from the settings' option lists
//! - `results`: per-pair result records, CSV/JSON output and the summary table
//! - `config` and `cli`: layered settings from defaults, a JSON file and the CLI
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use streaming_bench::{BenchmarkSettings, Coordinator, ResultAggregator, Role, Worker};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut settings = BenchmarkSettings::default();
//!     settings.test_matrix.short = true;
//!
//!     let coordinator = Coordinator::bind(&settings).await?;
//!     let sender = tokio::spawn(Worker::new(Role::Sender, &settings).run());
//!     let receiver = tokio::spawn(Worker::new(Role::Receiver, &settings).run());
//!
//!     let (_cancel_tx, cancel) = tokio::sync::watch::channel(false);
//!     let mut results = ResultAggregator::in_memory();
//!     let summary = coordinator.run(&mut results, cancel).await?;
//!     sender.await??;
//!     receiver.await??;
//!
//!     println!("{} cases, {} records", summary.cases_run, summary.records);
//!     Ok(())
//! }
//! ```
//!
//! ## Control and Data Planes
//!
//! Control traffic (registration, case configuration, barriers, results)
//! uses length-prefixed bincode frames over two coordinator listeners.
//! Benchmark data flows directly between the workers of a pair over their
//! own TCP connections, so the coordinator never sits on the measured path.

/// Command-line interface
///
/// Provides argument parsing using clap. Every option also reads a
/// `STREAMING_BENCH_*` environment variable.
pub mod cli;

/// Layered, validated settings
pub mod config;

/// Coordinator: registry, barriers and the orchestration loop
pub mod coordinator;

/// Error types shared by the coordinator, workers and sessions
pub mod error;

/// Colorized tracing output
pub mod logging;

/// Test matrix generation
pub mod matrix;

/// Per-session counters and throughput math
pub mod metrics;

/// Control messages and frame codec
pub mod protocol;

/// Result records and output files
///
/// Handles the per-case CSV append, the final JSON document, resume support
/// and the console summary table.
pub mod results;

/// Data-plane sessions
pub mod session;

/// Formatting, validation and table helpers
pub mod utils;

/// Worker state machine
pub mod worker;

// Re-export key types for convenient library usage

pub use cli::{Args, Pattern, Role};

pub use config::BenchmarkSettings;

pub use coordinator::{Coordinator, RunSummary};

pub use error::{BenchError, FailureKind, SessionError};

pub use matrix::{TestCase, TestMatrix};

pub use results::{ResultAggregator, ResultRecord};

pub use session::{DataPlane, Endpoint, TcpDataPlane};

pub use worker::{Worker, WorkerOutcome};

/// Current version of the harness, recorded in results metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// These defaults reproduce the reference harness setup: the sweep of
/// message sizes from 64 B to 10 MiB, 100,001 messages per case, and high
/// water marks of 100 on both sides.
pub mod defaults {
    use std::time::Duration;

    /// Coordinator request/reply (router) port
    pub const ROUTER_PORT: u16 = 5555;

    /// Coordinator broadcast port
    pub const BROADCAST_PORT: u16 = 5556;

    /// First data-plane port; pairs take consecutive ports from here
    pub const DATA_PORT_START: u16 = 6000;

    /// Message sizes swept by a full run
    pub const MESSAGE_SIZES: [usize; 10] = [
        64, 256, 1024, 4096, 16384, 65536, 262144, 1048576, 4194304, 10485760,
    ];

    /// Message sizes of a `--short` run
    pub const SHORT_MESSAGE_SIZES: [usize; 2] = [64, 256];

    /// Messages per case
    ///
    /// The odd count means a work-queue case never splits perfectly evenly
    /// across an even number of receivers.
    pub const MESSAGE_COUNT: u64 = 100_001;

    /// Sizes above this are dropped from the matrix
    pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

    /// Send and receive high-water mark
    pub const HWM: usize = 100;

    pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);

    pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

    /// Fixed part of the completion deadline
    pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

    /// Slowest transfer rate the completion deadline allows for (10 MiB/s)
    pub const MIN_RATE_BYTES_PER_SEC: u64 = 10 * 1024 * 1024;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// A receiver stops counting after this long without data
    pub const RECV_INACTIVITY_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Settle time between opening an endpoint and answering READY
    pub const SETUP_DELAY: Duration = Duration::from_secs(1);

    pub const OUTPUT_DIR: &str = "out";

    pub const RESULTS_FILE: &str = "results.csv";

    pub const JSON_FILE: &str = "results.json";

    /// Settings snapshot written next to the results
    pub const CONFIG_FILE: &str = "config.json";
}
