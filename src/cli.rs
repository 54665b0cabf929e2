use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Streaming Bench - coordinated throughput benchmark for streaming transports
///
/// Every process launches one or more workers of the given role. Exactly one
/// process per run also carries `--coordinator`.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Role of the workers launched by this process
    #[clap(value_enum)]
    pub role: Role,

    /// Also run the coordinator in this process
    #[clap(long, env = "STREAMING_BENCH_COORDINATOR")]
    pub coordinator: bool,

    /// Number of sender/receiver groups
    #[clap(short = 'n', long, env = "STREAMING_BENCH_NUM_PAIRS", help_heading = "Topology")]
    pub num_pairs: Option<usize>,

    /// Receivers attached to each sender
    #[clap(short = 'r', long, env = "STREAMING_BENCH_RECEIVERS_PER_SENDER", help_heading = "Topology")]
    pub receivers_per_sender: Option<usize>,

    /// Senders bind the data ports and receivers connect (default: receivers bind)
    #[clap(long, env = "STREAMING_BENCH_SENDER_BIND", help_heading = "Topology")]
    pub sender_bind: bool,

    /// IP address of the coordinator
    #[clap(long, env = "STREAMING_BENCH_COORDINATOR_IP", help_heading = "Network")]
    pub coordinator_ip: Option<IpAddr>,

    /// Local address data and control listeners bind to
    #[clap(long, env = "STREAMING_BENCH_BIND_IP", help_heading = "Network")]
    pub bind_ip: Option<IpAddr>,

    /// Address this process advertises to its data-plane peers
    #[clap(long, env = "STREAMING_BENCH_ADVERTISE_IP", help_heading = "Network")]
    pub advertise_ip: Option<IpAddr>,

    /// Coordinator request/reply port
    #[clap(long, env = "STREAMING_BENCH_ROUTER_PORT", help_heading = "Network")]
    pub router_port: Option<u16>,

    /// Coordinator broadcast port
    #[clap(long, env = "STREAMING_BENCH_BROADCAST_PORT", help_heading = "Network")]
    pub broadcast_port: Option<u16>,

    /// First port of the data-plane port range
    #[clap(long, env = "STREAMING_BENCH_DATA_PORT_START", help_heading = "Network")]
    pub data_port_start: Option<u16>,

    /// Use the reduced test matrix
    #[clap(long, env = "STREAMING_BENCH_SHORT", help_heading = "Test Matrix")]
    pub short: bool,

    /// Transport patterns to test
    #[clap(long, value_enum, value_delimiter = ',', env = "STREAMING_BENCH_PATTERNS", help_heading = "Test Matrix")]
    pub patterns: Option<Vec<Pattern>>,

    /// Message sizes in bytes
    #[clap(long, value_delimiter = ',', env = "STREAMING_BENCH_MESSAGE_SIZES", help_heading = "Test Matrix")]
    pub message_sizes: Option<Vec<usize>>,

    /// Message counts per case
    #[clap(long, value_delimiter = ',', env = "STREAMING_BENCH_MESSAGE_COUNTS", help_heading = "Test Matrix")]
    pub message_counts: Option<Vec<u64>>,

    /// Sizes above this are dropped from the matrix
    #[clap(long, env = "STREAMING_BENCH_MAX_MESSAGE_SIZE", help_heading = "Test Matrix")]
    pub max_message_size: Option<usize>,

    /// Zero-copy settings to test (true,false)
    #[clap(long, value_delimiter = ',', env = "STREAMING_BENCH_ZERO_COPY", help_heading = "Test Matrix")]
    pub zero_copy: Option<Vec<bool>>,

    /// Send high-water marks (0 = unbounded)
    #[clap(long, value_delimiter = ',', env = "STREAMING_BENCH_SEND_HWM", help_heading = "Test Matrix")]
    pub send_hwm: Option<Vec<usize>>,

    /// Receive high-water marks (0 = unbounded)
    #[clap(long, value_delimiter = ',', env = "STREAMING_BENCH_RECV_HWM", help_heading = "Test Matrix")]
    pub recv_hwm: Option<Vec<usize>>,

    /// Deadline for the registry to fill (e.g. "30s")
    #[clap(long, value_parser = parse_duration, env = "STREAMING_BENCH_REGISTRATION_TIMEOUT", help_heading = "Timeouts")]
    pub registration_timeout: Option<Duration>,

    /// Deadline for READY acknowledgements per case
    #[clap(long, value_parser = parse_duration, env = "STREAMING_BENCH_READY_TIMEOUT", help_heading = "Timeouts")]
    pub ready_timeout: Option<Duration>,

    /// Base completion deadline per case, extended by the case size
    #[clap(long, value_parser = parse_duration, env = "STREAMING_BENCH_COMPLETION_TIMEOUT", help_heading = "Timeouts")]
    pub completion_timeout: Option<Duration>,

    /// Receiver inactivity timeout
    #[clap(long, value_parser = parse_duration, env = "STREAMING_BENCH_RECV_TIMEOUT", help_heading = "Timeouts")]
    pub recv_timeout: Option<Duration>,

    /// Data-plane connect/accept timeout
    #[clap(long, value_parser = parse_duration, env = "STREAMING_BENCH_CONNECT_TIMEOUT", help_heading = "Timeouts")]
    pub connect_timeout: Option<Duration>,

    /// Settle delay between socket setup and READY
    #[clap(long, value_parser = parse_duration, env = "STREAMING_BENCH_SETUP_DELAY", help_heading = "Timeouts")]
    pub setup_delay: Option<Duration>,

    /// JSON settings file, overridden by flags and environment
    #[clap(short = 'c', long, env = "STREAMING_BENCH_CONFIG", help_heading = "Output")]
    pub config: Option<PathBuf>,

    /// Directory for results and the settings snapshot
    #[clap(short = 'o', long, env = "STREAMING_BENCH_OUTPUT_DIR", help_heading = "Output")]
    pub output_dir: Option<PathBuf>,

    /// Write directly into the output directory instead of a timestamped subdirectory
    #[clap(long, env = "STREAMING_BENCH_NO_TIMESTAMP", help_heading = "Output")]
    pub no_timestamp: bool,

    /// Existing results CSV whose completed cases are skipped
    #[clap(long, env = "STREAMING_BENCH_RESUME_FROM", help_heading = "Output")]
    pub resume_from: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[clap(long, value_enum, default_value_t = LogLevel::Info, env = "STREAMING_BENCH_LOG_LEVEL")]
    pub log_level: LogLevel,
}

/// Worker role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
pub enum Role {
    /// Produces messages
    #[clap(name = "sender")]
    Sender,

    /// Consumes messages
    #[clap(name = "receiver")]
    Receiver,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// Data-plane delivery pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
pub enum Pattern {
    /// Each message goes to exactly one receiver; full queues block the sender
    #[clap(name = "work-queue")]
    WorkQueue,

    /// Every message is offered to every receiver; full queues drop
    #[clap(name = "fan-out")]
    FanOut,
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::WorkQueue => write!(f, "work-queue"),
            Pattern::FanOut => write!(f, "fan-out"),
        }
    }
}

impl std::str::FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Pattern as ValueEnum>::from_str(s, true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    #[clap(name = "trace")]
    Trace,
    #[clap(name = "debug")]
    Debug,
    #[clap(name = "info")]
    Info,
    #[clap(name = "warn")]
    Warn,
    #[clap(name = "error")]
    Error,
}

impl LogLevel {
    /// Directive string for `EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h", "250ms")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(num / 1000.0),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

/// Render a duration the way `parse_duration` reads it back
pub fn format_duration_setting(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}
