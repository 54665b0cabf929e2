//! Runs a coordinator and its workers as tasks on loopback.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use streaming_bench::cli::{Pattern, Role};
use streaming_bench::config::{BenchmarkSettings, TestMatrixSettings};
use streaming_bench::coordinator::{Coordinator, RunSummary};
use streaming_bench::error::BenchError;
use streaming_bench::results::{ResultAggregator, ResultRecord};
use streaming_bench::session::{DataPlane, TcpDataPlane};
use streaming_bench::worker::{Worker, WorkerOutcome};
use tokio::sync::watch;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Small single-case settings with ephemeral control ports
pub fn settings(num_pairs: usize, receivers_per_sender: usize, data_port_start: u16) -> BenchmarkSettings {
    let mut settings = BenchmarkSettings::default();
    settings.network.coordinator_ip = LOCALHOST;
    settings.network.bind_ip = LOCALHOST;
    settings.network.router_port = 0;
    settings.network.broadcast_port = 0;
    settings.network.data_port_start = data_port_start;

    settings.workers.num_pairs = num_pairs;
    settings.workers.receivers_per_sender = receivers_per_sender;

    settings.test_matrix = TestMatrixSettings {
        short: false,
        patterns: vec![Pattern::WorkQueue],
        message_sizes: vec![1024],
        message_counts: vec![1000],
        max_message_size: 1024 * 1024,
        zero_copy: vec![false],
        send_hwm: vec![100],
        recv_hwm: vec![100],
    };

    settings.timeouts.registration = Duration::from_secs(10);
    settings.timeouts.ready = Duration::from_secs(5);
    settings.timeouts.completion = Duration::from_secs(10);
    settings.timeouts.connect = Duration::from_secs(5);
    settings.timeouts.recv_inactivity = Duration::from_secs(2);
    settings.timeouts.setup_delay = Duration::from_millis(20);
    settings.output.add_timestamp = false;
    settings
}

pub struct ScenarioRun {
    pub result: Result<RunSummary, BenchError>,
    pub records: Vec<ResultRecord>,
    pub workers: Vec<Result<WorkerOutcome, BenchError>>,
}

pub async fn run_scenario(settings: &BenchmarkSettings, senders: usize, receivers: usize) -> ScenarioRun {
    run_scenario_with(settings, senders, receivers, Arc::new(TcpDataPlane)).await
}

/// Launch `senders` and `receivers` workers against a fresh coordinator
pub async fn run_scenario_with(
    settings: &BenchmarkSettings,
    senders: usize,
    receivers: usize,
    data_plane: Arc<dyn DataPlane>,
) -> ScenarioRun {
    let (_cancel, cancel_rx) = watch::channel(false);
    run_scenario_into(
        settings,
        senders,
        receivers,
        data_plane,
        cancel_rx,
        ResultAggregator::in_memory(),
    )
    .await
}

/// Like `run_scenario_with`, recording into `aggregator` and stopping when
/// `cancel` turns true
pub async fn run_scenario_into(
    settings: &BenchmarkSettings,
    senders: usize,
    receivers: usize,
    data_plane: Arc<dyn DataPlane>,
    cancel: watch::Receiver<bool>,
    mut aggregator: ResultAggregator,
) -> ScenarioRun {
    let coordinator = Coordinator::bind(settings).await.expect("coordinator binds");
    let mut worker_settings = settings.clone();
    worker_settings.network.router_port = coordinator.router_addr().port();

    let roles = std::iter::repeat(Role::Sender)
        .take(senders)
        .chain(std::iter::repeat(Role::Receiver).take(receivers));
    let handles: Vec<_> = roles
        .map(|role| {
            let worker = Worker::with_data_plane(role, &worker_settings, data_plane.clone());
            tokio::spawn(worker.run())
        })
        .collect();

    let result = coordinator.run(&mut aggregator, cancel).await;

    let mut workers = Vec::new();
    for handle in handles {
        let outcome = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("worker finishes after SHUTDOWN")
            .expect("worker task does not panic");
        workers.push(outcome);
    }

    ScenarioRun {
        result,
        records: aggregator.records().cloned().collect(),
        workers,
    }
}

/// Checks every record must satisfy regardless of scenario
pub fn assert_record_invariants(records: &[ResultRecord]) {
    let mut last_case = None;
    for record in records {
        assert!(record.messages_received <= record.messages_sent);
        assert!(
            record.messages_received + record.sender_dropped + record.receiver_dropped
                <= record.messages_sent
        );
        assert!((0.0..=1.0).contains(&record.pct_received));
        if record.elapsed_seconds > 0.0 {
            let expected = record.bytes_transferred as f64 * 8.0 / record.elapsed_seconds;
            assert!((record.throughput_bps - expected).abs() <= expected * 1e-9);
        }
        if let Some(last) = last_case {
            assert!(record.case_index >= last);
        }
        last_case = Some(record.case_index);
    }
}
