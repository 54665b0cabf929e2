//! # Benchmark Settings
//!
//! One validated settings object is built at startup and shared by reference
//! with the matrix generator, the coordinator and every worker. Values are
//! layered in this order, later layers winning:
//!
//! 1. Built-in defaults from [`crate::defaults`]
//! 2. An optional JSON settings file (`--config`)
//! 3. Command-line flags and their `STREAMING_BENCH_*` environment variables
//!
//! Durations are written as human-readable strings ("30s", "250ms") in JSON so
//! the file format matches the command line.

use crate::cli::{format_duration_setting, parse_duration, Args, Pattern};
use crate::defaults;
use crate::matrix::TestCase;
use crate::utils::{validate_message_size, validate_port, validate_positive_list};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSettings {
    pub network: NetworkSettings,
    pub test_matrix: TestMatrixSettings,
    pub workers: WorkerSettings,
    pub timeouts: TimeoutSettings,
    pub output: OutputSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub coordinator_ip: IpAddr,
    /// Local address listeners bind to
    pub bind_ip: IpAddr,
    /// Address advertised to data-plane peers; falls back to `bind_ip`
    pub advertise_ip: Option<IpAddr>,
    /// 0 picks an ephemeral port
    pub router_port: u16,
    /// 0 picks an ephemeral port
    pub broadcast_port: u16,
    pub data_port_start: u16,
    /// Senders listen and receivers connect when set
    pub sender_bind: bool,
    /// SO_RCVBUF/SO_SNDBUF for data sockets, left to the OS when unset
    pub socket_buffer_size: Option<usize>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            coordinator_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: None,
            router_port: defaults::ROUTER_PORT,
            broadcast_port: defaults::BROADCAST_PORT,
            data_port_start: defaults::DATA_PORT_START,
            sender_bind: false,
            socket_buffer_size: None,
        }
    }
}

impl NetworkSettings {
    /// Coordinator request/reply endpoint as seen by workers
    pub fn router_addr(&self) -> SocketAddr {
        SocketAddr::new(self.coordinator_ip, self.router_port)
    }

    /// Address workers hand to their data-plane peers
    pub fn advertised_ip(&self) -> IpAddr {
        match self.advertise_ip {
            Some(ip) => ip,
            None if self.bind_ip.is_unspecified() => self.coordinator_ip,
            None => self.bind_ip,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestMatrixSettings {
    /// Replace every list below with the reduced literal matrix
    pub short: bool,
    pub patterns: Vec<Pattern>,
    pub message_sizes: Vec<usize>,
    pub message_counts: Vec<u64>,
    pub max_message_size: usize,
    pub zero_copy: Vec<bool>,
    pub send_hwm: Vec<usize>,
    pub recv_hwm: Vec<usize>,
}

impl Default for TestMatrixSettings {
    fn default() -> Self {
        Self {
            short: false,
            patterns: vec![Pattern::WorkQueue],
            message_sizes: defaults::MESSAGE_SIZES.to_vec(),
            message_counts: vec![defaults::MESSAGE_COUNT],
            max_message_size: defaults::MAX_MESSAGE_SIZE,
            zero_copy: vec![true, false],
            send_hwm: vec![defaults::HWM],
            recv_hwm: vec![defaults::HWM],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub num_pairs: usize,
    pub receivers_per_sender: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            num_pairs: 1,
            receivers_per_sender: 1,
        }
    }
}

impl WorkerSettings {
    /// Registry target size: one sender plus its receivers per pair
    pub fn expected_workers(&self) -> usize {
        self.num_pairs * (1 + self.receivers_per_sender)
    }

    pub fn expected_receivers(&self) -> usize {
        self.num_pairs * self.receivers_per_sender
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    #[serde(with = "duration_text")]
    pub registration: Duration,
    #[serde(with = "duration_text")]
    pub ready: Duration,
    /// Fixed part of the completion deadline
    #[serde(with = "duration_text")]
    pub completion: Duration,
    /// Slowest acceptable rate; scales the completion deadline with case size
    pub min_rate_bytes_per_sec: u64,
    #[serde(with = "duration_text")]
    pub connect: Duration,
    #[serde(with = "duration_text")]
    pub recv_inactivity: Duration,
    #[serde(with = "duration_text")]
    pub setup_delay: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            registration: defaults::REGISTRATION_TIMEOUT,
            ready: defaults::READY_TIMEOUT,
            completion: defaults::COMPLETION_TIMEOUT,
            min_rate_bytes_per_sec: defaults::MIN_RATE_BYTES_PER_SEC,
            connect: defaults::CONNECT_TIMEOUT,
            recv_inactivity: defaults::RECV_INACTIVITY_TIMEOUT,
            setup_delay: defaults::SETUP_DELAY,
        }
    }
}

impl TimeoutSettings {
    /// Completion deadline for one case: the fixed margin plus the time the
    /// case's offered bytes take at the minimum acceptable rate.
    pub fn completion_deadline(&self, case: &TestCase, receivers_per_sender: usize) -> Duration {
        let bytes = case.offered_bytes(receivers_per_sender);
        let rate = self.min_rate_bytes_per_sec.max(1);
        self.completion + self.connect + Duration::from_secs_f64(bytes as f64 / rate as f64)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub output_dir: PathBuf,
    /// Put each run in a `YYYYmmdd_HHMMSS` subdirectory
    pub add_timestamp: bool,
    pub results_file: String,
    pub json_file: String,
    pub config_file: String,
    pub resume_from: Option<PathBuf>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(defaults::OUTPUT_DIR),
            add_timestamp: true,
            results_file: defaults::RESULTS_FILE.to_string(),
            json_file: defaults::JSON_FILE.to_string(),
            config_file: defaults::CONFIG_FILE.to_string(),
            resume_from: None,
        }
    }
}

impl OutputSettings {
    /// Directory this run writes to
    pub fn run_dir(&self, started_at: chrono::DateTime<chrono::Local>) -> PathBuf {
        if self.add_timestamp {
            self.output_dir
                .join(started_at.format("%Y%m%d_%H%M%S").to_string())
        } else {
            self.output_dir.clone()
        }
    }
}

impl BenchmarkSettings {
    /// Build settings from defaults, the optional JSON file and CLI/env values
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply_args(args);
        settings.validate()?;
        Ok(settings)
    }

    /// Load a JSON settings file; missing sections fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    /// Write the settings snapshot that accompanies a results file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }

    fn apply_args(&mut self, args: &Args) {
        let network = &mut self.network;
        if let Some(ip) = args.coordinator_ip {
            network.coordinator_ip = ip;
        }
        if let Some(ip) = args.bind_ip {
            network.bind_ip = ip;
        }
        if args.advertise_ip.is_some() {
            network.advertise_ip = args.advertise_ip;
        }
        if let Some(port) = args.router_port {
            network.router_port = port;
        }
        if let Some(port) = args.broadcast_port {
            network.broadcast_port = port;
        }
        if let Some(port) = args.data_port_start {
            network.data_port_start = port;
        }
        if args.sender_bind {
            network.sender_bind = true;
        }

        let matrix = &mut self.test_matrix;
        if args.short {
            matrix.short = true;
        }
        if let Some(patterns) = &args.patterns {
            matrix.patterns = patterns.clone();
        }
        if let Some(sizes) = &args.message_sizes {
            matrix.message_sizes = sizes.clone();
        }
        if let Some(counts) = &args.message_counts {
            matrix.message_counts = counts.clone();
        }
        if let Some(max) = args.max_message_size {
            matrix.max_message_size = max;
        }
        if let Some(zero_copy) = &args.zero_copy {
            matrix.zero_copy = zero_copy.clone();
        }
        if let Some(hwm) = &args.send_hwm {
            matrix.send_hwm = hwm.clone();
        }
        if let Some(hwm) = &args.recv_hwm {
            matrix.recv_hwm = hwm.clone();
        }

        if let Some(n) = args.num_pairs {
            self.workers.num_pairs = n;
        }
        if let Some(n) = args.receivers_per_sender {
            self.workers.receivers_per_sender = n;
        }

        let timeouts = &mut self.timeouts;
        if let Some(d) = args.registration_timeout {
            timeouts.registration = d;
        }
        if let Some(d) = args.ready_timeout {
            timeouts.ready = d;
        }
        if let Some(d) = args.completion_timeout {
            timeouts.completion = d;
        }
        if let Some(d) = args.recv_timeout {
            timeouts.recv_inactivity = d;
        }
        if let Some(d) = args.connect_timeout {
            timeouts.connect = d;
        }
        if let Some(d) = args.setup_delay {
            timeouts.setup_delay = d;
        }

        if let Some(dir) = &args.output_dir {
            self.output.output_dir = dir.clone();
        }
        if args.no_timestamp {
            self.output.add_timestamp = false;
        }
        if args.resume_from.is_some() {
            self.output.resume_from = args.resume_from.clone();
        }
    }

    /// Check every field the run depends on
    pub fn validate(&self) -> Result<()> {
        let network = &self.network;
        for (name, port) in [
            ("router", network.router_port),
            ("broadcast", network.broadcast_port),
        ] {
            if port != 0 {
                validate_port(port).with_context(|| format!("Invalid {} port", name))?;
            }
        }
        if network.router_port != 0 && network.router_port == network.broadcast_port {
            anyhow::bail!("Router and broadcast ports must differ");
        }
        validate_port(network.data_port_start).context("Invalid data port start")?;

        let workers = &self.workers;
        if workers.num_pairs == 0 {
            anyhow::bail!("Number of pairs must be at least 1");
        }
        if workers.receivers_per_sender == 0 {
            anyhow::bail!("Receivers per sender must be at least 1");
        }
        let data_ports = if network.sender_bind {
            workers.num_pairs
        } else {
            workers.expected_receivers()
        };
        let last_port = network.data_port_start as usize + data_ports - 1;
        if last_port > u16::MAX as usize {
            anyhow::bail!(
                "Data port range {}..={} does not fit in the port space",
                network.data_port_start,
                last_port
            );
        }

        let matrix = &self.test_matrix;
        if !matrix.short {
            if matrix.patterns.is_empty() {
                anyhow::bail!("Pattern list cannot be empty");
            }
            if matrix.zero_copy.is_empty() {
                anyhow::bail!("Zero-copy list cannot be empty");
            }
            validate_positive_list("message sizes", &matrix.message_sizes)?;
            validate_positive_list("message counts", &matrix.message_counts)?;
            if matrix.send_hwm.is_empty() || matrix.recv_hwm.is_empty() {
                anyhow::bail!("High-water mark lists cannot be empty");
            }
            for &size in &matrix.message_sizes {
                validate_message_size(size)?;
            }
        }
        validate_message_size(matrix.max_message_size).context("Invalid max message size")?;
        if !matrix.short
            && matrix
                .message_sizes
                .iter()
                .all(|&size| size > matrix.max_message_size)
        {
            anyhow::bail!(
                "Every message size exceeds the max message size of {} bytes",
                matrix.max_message_size
            );
        }

        let timeouts = &self.timeouts;
        for (name, value) in [
            ("registration", timeouts.registration),
            ("ready", timeouts.ready),
            ("completion", timeouts.completion),
            ("connect", timeouts.connect),
            ("receive inactivity", timeouts.recv_inactivity),
        ] {
            if value.is_zero() {
                anyhow::bail!("The {} timeout must be greater than zero", name);
            }
        }

        Ok(())
    }
}

/// Serde adapter storing a `Duration` as "30s"/"250ms" text
mod duration_text {
    use super::{format_duration_setting, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration_setting(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
