//! # Coordinator
//!
//! Drives a whole benchmark run from one async control loop:
//!
//! 1. Accept registrations until the registry is full and every worker is
//!    subscribed to the broadcast channel.
//! 2. For every case in the matrix: broadcast `CASE_CONFIG`, wait at the
//!    ready barrier, broadcast `START` to the pairs that made it, wait at the
//!    completion barrier, let workers that were late to the ready barrier
//!    catch up, and hand one record per pair to the aggregator.
//! 3. Broadcast `SHUTDOWN`.
//!
//! Every wait has a deadline. A worker that misses one, reports an error or
//! drops its connection fails its pair for that case only; the run carries on
//! with the next case. Only a registration timeout or the loss of every
//! worker ends the run early.

pub mod barrier;
pub mod control;
pub mod registry;

pub use barrier::{Arrival, Latch, LatchOutcome};
pub use control::{ConnectionId, ControlPlane, Inbound};
pub use registry::WorkerRegistry;

use crate::config::BenchmarkSettings;
use crate::error::{BenchError, FailureKind};
use crate::matrix::{CaseParams, TestCase, TestMatrix};
use crate::metrics::SessionMetrics;
use crate::protocol::{ControlMessage, PairAssignment, WorkerIdentity};
use crate::results::{ResultAggregator, ResultRecord};
use crate::utils::{format_bits_rate, format_duration};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// How long subscribers get to flush `SHUTDOWN` before the listeners close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cases_run: usize,
    /// Cases skipped because a resumed results file already had them
    pub cases_skipped: usize,
    pub records: usize,
    pub failed_records: usize,
    /// The operator stopped the run between cases
    pub cancelled: bool,
}

pub struct Coordinator {
    settings: BenchmarkSettings,
    matrix: TestMatrix,
    control: ControlPlane,
    completed: HashSet<CaseParams>,
}

impl Coordinator {
    /// Validate `settings`, build the test matrix and bind both control listeners
    pub async fn bind(settings: &BenchmarkSettings) -> Result<Self, BenchError> {
        settings
            .validate()
            .map_err(|e| BenchError::InvalidConfig(format!("{:#}", e)))?;
        let matrix = TestMatrix::generate(&settings.test_matrix);
        if matrix.is_empty() {
            return Err(BenchError::InvalidConfig(
                "the test matrix is empty after filtering".to_string(),
            ));
        }
        let control = ControlPlane::bind(&settings.network).await?;

        Ok(Self {
            settings: settings.clone(),
            matrix,
            control,
            completed: HashSet::new(),
        })
    }

    pub fn router_addr(&self) -> SocketAddr {
        self.control.router_addr()
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.control.broadcast_addr()
    }

    pub fn matrix(&self) -> &TestMatrix {
        &self.matrix
    }

    /// Skip cases whose parameters a previous run already completed
    pub fn skip_completed(&mut self, completed: HashSet<CaseParams>) {
        self.completed = completed;
    }

    /// Run the whole matrix, recording into `aggregator`. Setting `cancel`
    /// to true stops the run before the next case.
    pub async fn run(
        mut self,
        aggregator: &mut ResultAggregator,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunSummary, BenchError> {
        let started = std::time::Instant::now();
        let mut state = RunState::new(&self.settings, self.control.broadcast_addr().port());
        let result = self.execute(&mut state, aggregator, &mut cancel).await;

        if let Err(e) = self.control.broadcast(&ControlMessage::Shutdown) {
            warn!("Failed to broadcast SHUTDOWN: {}", e);
        }
        self.control.shutdown(SHUTDOWN_GRACE).await;

        match &result {
            Ok(summary) => info!(
                "Run finished in {}: {} cases, {} records ({} failed){}",
                format_duration(started.elapsed()),
                summary.cases_run,
                summary.records,
                summary.failed_records,
                if summary.cancelled { ", cancelled" } else { "" }
            ),
            Err(e) => warn!("Run aborted: {}", e),
        }
        result
    }

    async fn execute(
        &mut self,
        state: &mut RunState,
        aggregator: &mut ResultAggregator,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<RunSummary, BenchError> {
        self.register_workers(state).await?;
        state.registry.close();
        let assignments = state
            .registry
            .assignments(&self.settings.network)
            .ok_or_else(|| {
                BenchError::ControlChannelLost("registry closed without a full set of workers".to_string())
            })?;
        for pair in &assignments {
            info!(
                "Pair {}: sender {} -> receivers [{}] on ports {:?}",
                pair.pair_id,
                pair.sender.id,
                pair.receivers
                    .iter()
                    .map(|r| r.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                pair.ports()
            );
        }

        let cases: Vec<TestCase> = self.matrix.remaining(&self.completed).cloned().collect();
        let mut summary = RunSummary {
            cases_skipped: self.matrix.len() - cases.len(),
            ..Default::default()
        };
        if summary.cases_skipped > 0 {
            info!("Skipping {} cases already in the resumed results", summary.cases_skipped);
        }

        for case in &cases {
            if *cancel.borrow() {
                warn!("Run cancelled before case {}", case.index);
                summary.cancelled = true;
                break;
            }
            let records = self.run_case(state, case, &assignments).await?;
            aggregator
                .record_case(records)
                .map_err(|e| BenchError::Output(format!("{:#}", e)))?;
            summary.cases_run += 1;
        }

        summary.records = aggregator.len();
        summary.failed_records = aggregator.failed_count();
        Ok(summary)
    }

    /// Wait until the registry is full and every worker is subscribed (or gone).
    async fn register_workers(&mut self, state: &mut RunState) -> Result<(), BenchError> {
        let timeout = self.settings.timeouts.registration;
        let deadline = Instant::now() + timeout;
        info!(
            "Waiting for {} workers on {} (broadcast {})",
            state.registry.target(),
            self.control.router_addr(),
            self.control.broadcast_addr()
        );

        while !(state.registry.is_full() && state.all_subscribed()) {
            tokio::select! {
                event = self.control.recv() => {
                    let event = event.ok_or_else(|| {
                        BenchError::ControlChannelLost("control plane stopped".to_string())
                    })?;
                    state.handle(event);
                }
                _ = sleep_until(deadline) => {
                    return Err(BenchError::RegistrationTimeout {
                        expected: state.registry.target(),
                        registered: state.registry.len(),
                        attached: state.attached_count(),
                        timeout,
                    });
                }
            }
        }

        info!("All {} workers registered and subscribed", state.registry.len());
        Ok(())
    }

    async fn run_case(
        &mut self,
        state: &mut RunState,
        case: &TestCase,
        assignments: &[PairAssignment],
    ) -> Result<Vec<ResultRecord>, BenchError> {
        if state.all_lost() {
            return Err(BenchError::ControlChannelLost("every worker is gone".to_string()));
        }
        let ready_timeout = self.settings.timeouts.ready;
        let completion = self
            .settings
            .timeouts
            .completion_deadline(case, self.settings.workers.receivers_per_sender);
        info!("Case {}/{}: {}", case.index + 1, self.matrix.len(), case);

        self.control.broadcast(&ControlMessage::CaseConfig {
            case: case.clone(),
            assignments: assignments.to_vec(),
        })?;
        let mut ready = Latch::new(state.live_workers(), Instant::now() + ready_timeout);
        self.collect(state, &mut ready, case.index, |message| match message {
            ControlMessage::Ready { worker_id, .. } => Some((worker_id, Arrival::Arrived(()))),
            ControlMessage::Error {
                worker_id,
                kind,
                detail,
                ..
            } => Some((worker_id, Arrival::Failed { kind, detail })),
            _ => None,
        })
        .await?;
        state.unsettled = ready.missing().into_iter().collect();
        let ready = ready.close("no READY before the ready deadline");

        let mut excluded: HashMap<usize, (FailureKind, String)> = HashMap::new();
        let mut participants = Vec::new();
        for pair in assignments {
            let members: Vec<&str> = pair.members().map(|m| m.id.as_str()).collect();
            let failure = state
                .first_lost(&members)
                .or_else(|| ready.first_failure(members.iter().copied()));
            match failure {
                Some(failure) => {
                    warn!(
                        "Case {} pair {} left out of START ({}): {}",
                        case.index, pair.pair_id, failure.0, failure.1
                    );
                    excluded.insert(pair.pair_id, failure);
                }
                None => participants.extend(members.iter().map(|id| id.to_string())),
            }
        }

        self.control.broadcast(&ControlMessage::Start {
            case_index: case.index,
            participants: participants.clone(),
        })?;
        debug!("Case {} completion deadline {:?}", case.index, completion);
        let mut done = Latch::new(participants, Instant::now() + completion);
        self.collect(state, &mut done, case.index, |message| match message {
            ControlMessage::CaseResult {
                worker_id, metrics, ..
            } => Some((worker_id, Arrival::Arrived(metrics))),
            ControlMessage::Error {
                worker_id,
                kind,
                detail,
                ..
            } => Some((worker_id, Arrival::Failed { kind, detail })),
            _ => None,
        })
        .await?;
        let done = done.close("no CASE_RESULT before the completion deadline");
        self.settle(state, case.index).await?;

        let records = assignments
            .iter()
            .map(|pair| {
                let record = match excluded.remove(&pair.pair_id) {
                    Some((kind, detail)) => ResultRecord::failed(case, pair, kind, detail),
                    None => pair_record(case, pair, &done),
                };
                log_record(&record);
                record
            })
            .collect();
        Ok(records)
    }

    /// Wait for workers that missed the ready deadline to answer this case's
    /// CASE_CONFIG, so they take the next one with an empty backlog.
    async fn settle(&mut self, state: &mut RunState, case_index: u64) -> Result<(), BenchError> {
        if state.unsettled.is_empty() {
            return Ok(());
        }
        let grace = self.settings.timeouts.connect + self.settings.timeouts.setup_delay;
        let late: Vec<String> = state.unsettled.drain().collect();
        debug!(
            "Case {}: waiting up to {} for late setup of {}",
            case_index,
            format_duration(grace),
            late.join(", ")
        );

        let mut settled = Latch::new(late, Instant::now() + grace);
        self.collect(state, &mut settled, case_index, |message| match message {
            ControlMessage::Ready { worker_id, .. } | ControlMessage::Error { worker_id, .. } => {
                Some((worker_id, Arrival::Arrived(())))
            }
            _ => None,
        })
        .await
    }

    /// Feed case traffic into `latch` until everyone answered or the deadline passed.
    async fn collect<T>(
        &mut self,
        state: &mut RunState,
        latch: &mut Latch<T>,
        case_index: u64,
        accept: impl Fn(ControlMessage) -> Option<(String, Arrival<T>)>,
    ) -> Result<(), BenchError> {
        let deadline = latch.deadline();
        while !latch.is_complete() {
            tokio::select! {
                event = self.control.recv() => {
                    let event = event.ok_or_else(|| {
                        BenchError::ControlChannelLost("control plane stopped".to_string())
                    })?;
                    match state.handle(event) {
                        Handled::Done => {}
                        Handled::Lost { worker_id, kind, detail } => {
                            latch.fail(&worker_id, kind, detail);
                            if state.all_lost() {
                                return Err(BenchError::ControlChannelLost(
                                    "every worker is gone".to_string(),
                                ));
                            }
                        }
                        Handled::Case(message) => {
                            let index = message_case_index(&message);
                            if index != Some(case_index) {
                                debug!("Ignoring stale {} for case {:?}", message.name(), index);
                                continue;
                            }
                            if let ControlMessage::Ready { worker_id, .. }
                            | ControlMessage::Error { worker_id, .. } = &message
                            {
                                state.unsettled.remove(worker_id);
                            }
                            if let Some((worker_id, arrival)) = accept(message) {
                                if !latch.arrive(&worker_id, arrival) {
                                    debug!("Ignoring repeated or unexpected answer from {}", worker_id);
                                }
                            }
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        "Case {}: deadline passed waiting for {}",
                        case_index,
                        latch.missing().join(", ")
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

fn pair_record(case: &TestCase, pair: &PairAssignment, done: &LatchOutcome<SessionMetrics>) -> ResultRecord {
    let members: Vec<&str> = pair.members().map(|m| m.id.as_str()).collect();
    let reports: Vec<Option<&SessionMetrics>> =
        pair.receivers.iter().map(|r| done.value(&r.id)).collect();
    ResultRecord::from_reports(
        case,
        pair,
        done.value(&pair.sender.id),
        &reports,
        done.first_failure(members),
    )
}

fn log_record(record: &ResultRecord) {
    if record.is_ok() {
        info!(
            "Case {} pair {}: {}/{} messages ({:.1}%), {}",
            record.case_index,
            record.pair_id,
            record.messages_received,
            record.messages_sent,
            record.pct_received * 100.0,
            format_bits_rate(record.throughput_bps)
        );
    } else {
        warn!(
            "Case {} pair {} failed: {:?}",
            record.case_index, record.pair_id, record.status
        );
    }
}

fn message_case_index(message: &ControlMessage) -> Option<u64> {
    match message {
        ControlMessage::Ready { case_index, .. }
        | ControlMessage::CaseResult { case_index, .. }
        | ControlMessage::Error { case_index, .. } => Some(*case_index),
        _ => None,
    }
}

/// Outcome of feeding one inbound event to the run state.
enum Handled {
    Done,
    /// A worker became unusable for the rest of the run
    Lost {
        worker_id: String,
        kind: FailureKind,
        detail: String,
    },
    /// Case traffic for the barriers
    Case(ControlMessage),
}

struct Connection {
    reply: mpsc::Sender<ControlMessage>,
    worker_id: Option<String>,
}

struct WorkerLink {
    identity: WorkerIdentity,
    attached: bool,
    lost: Option<(FailureKind, String)>,
}

/// Run-scoped bookkeeping owned by the control loop.
struct RunState {
    registry: WorkerRegistry,
    broadcast_port: u16,
    connections: HashMap<ConnectionId, Connection>,
    workers: BTreeMap<String, WorkerLink>,
    /// Workers still setting up a case whose ready deadline already passed
    unsettled: HashSet<String>,
}

impl RunState {
    fn new(settings: &BenchmarkSettings, broadcast_port: u16) -> Self {
        Self {
            registry: WorkerRegistry::new(&settings.workers),
            broadcast_port,
            connections: HashMap::new(),
            workers: BTreeMap::new(),
            unsettled: HashSet::new(),
        }
    }

    fn handle(&mut self, event: Inbound) -> Handled {
        match event {
            Inbound::Connected { conn, reply } => {
                self.connections.insert(
                    conn,
                    Connection {
                        reply,
                        worker_id: None,
                    },
                );
                Handled::Done
            }
            Inbound::Message {
                conn,
                message: ControlMessage::Register(registration),
            } => {
                let reply = match self.registry.register(&registration) {
                    Ok(identity) => {
                        info!(
                            "Registered {} ({} {}/{}) from {}",
                            identity.id,
                            identity.role,
                            self.registry.len(),
                            self.registry.target(),
                            identity.address
                        );
                        if let Some(connection) = self.connections.get_mut(&conn) {
                            connection.worker_id = Some(identity.id.clone());
                        }
                        self.workers
                            .entry(identity.id.clone())
                            .or_insert_with(|| WorkerLink {
                                identity: identity.clone(),
                                attached: false,
                                lost: None,
                            });
                        ControlMessage::Registered {
                            identity,
                            broadcast_port: self.broadcast_port,
                        }
                    }
                    Err(e) => {
                        warn!("Rejected registration of {}: {}", registration.worker_id, e);
                        ControlMessage::Rejected {
                            reason: e.to_string(),
                        }
                    }
                };
                if let Some(connection) = self.connections.get(&conn) {
                    if connection.reply.try_send(reply).is_err() {
                        debug!("Could not queue registration reply on connection {}", conn);
                    }
                }
                Handled::Done
            }
            Inbound::Message {
                message:
                    ControlMessage::Error {
                        worker_id,
                        kind: FailureKind::ProtocolDesync,
                        detail,
                        ..
                    },
                ..
            } => self.mark_lost(&worker_id, FailureKind::ProtocolDesync, detail),
            Inbound::Message { message, .. } => Handled::Case(message),
            Inbound::Disconnected { conn } => {
                match self.connections.remove(&conn).and_then(|c| c.worker_id) {
                    Some(worker_id) => self.mark_lost(
                        &worker_id,
                        FailureKind::Disconnected,
                        "control connection closed".to_string(),
                    ),
                    None => Handled::Done,
                }
            }
            Inbound::Attached { worker_id } => {
                match self.workers.get_mut(&worker_id) {
                    Some(link) => {
                        link.attached = true;
                        debug!("{} subscribed to broadcasts", worker_id);
                    }
                    None => warn!("Broadcast subscription from unregistered worker {}", worker_id),
                }
                Handled::Done
            }
            Inbound::Detached { worker_id } => self.mark_lost(
                &worker_id,
                FailureKind::Disconnected,
                "broadcast subscription dropped".to_string(),
            ),
        }
    }

    fn mark_lost(&mut self, worker_id: &str, kind: FailureKind, detail: String) -> Handled {
        let Some(link) = self.workers.get_mut(worker_id) else {
            return Handled::Done;
        };
        if link.lost.is_some() {
            return Handled::Done;
        }
        warn!(
            "Lost {} worker {} of pair {} ({}): {}",
            link.identity.role, worker_id, link.identity.pair_index, kind, detail
        );
        link.lost = Some((kind, detail.clone()));
        self.unsettled.remove(worker_id);
        Handled::Lost {
            worker_id: worker_id.to_string(),
            kind,
            detail,
        }
    }

    fn attached_count(&self) -> usize {
        self.workers.values().filter(|w| w.attached).count()
    }

    /// Every registered worker is subscribed, or gone for good
    fn all_subscribed(&self) -> bool {
        self.workers
            .values()
            .all(|w| w.attached || w.lost.is_some())
    }

    fn all_lost(&self) -> bool {
        !self.registry.is_empty() && self.workers.values().all(|w| w.lost.is_some())
    }

    fn live_workers(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|(_, w)| w.lost.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Why the first lost member among `members` is gone
    fn first_lost(&self, members: &[&str]) -> Option<(FailureKind, String)> {
        members.iter().find_map(|id| {
            self.workers
                .get(*id)
                .and_then(|w| w.lost.clone())
                .map(|(kind, detail)| (kind, format!("{}: {}", id, detail)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Role;
    use crate::protocol::Registration;
    use std::net::{IpAddr, Ipv4Addr};

    fn state() -> RunState {
        let mut settings = BenchmarkSettings::default();
        settings.workers.num_pairs = 1;
        settings.workers.receivers_per_sender = 1;
        RunState::new(&settings, 5556)
    }

    fn register(state: &mut RunState, conn: ConnectionId, id: &str, role: Role) -> mpsc::Receiver<ControlMessage> {
        let (reply, replies) = mpsc::channel(4);
        state.handle(Inbound::Connected { conn, reply });
        state.handle(Inbound::Message {
            conn,
            message: ControlMessage::Register(Registration {
                worker_id: id.to_string(),
                role,
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            }),
        });
        replies
    }

    #[test]
    fn test_registration_replies_and_subscription_tracking() {
        let mut state = state();
        let mut replies = register(&mut state, 1, "sender-a", Role::Sender);
        assert!(matches!(
            replies.try_recv(),
            Ok(ControlMessage::Registered { broadcast_port: 5556, .. })
        ));
        register(&mut state, 2, "receiver-a", Role::Receiver);
        assert!(state.registry.is_full());
        assert!(!state.all_subscribed());

        state.handle(Inbound::Attached { worker_id: "sender-a".to_string() });
        state.handle(Inbound::Attached { worker_id: "receiver-a".to_string() });
        assert!(state.all_subscribed());
        assert_eq!(state.attached_count(), 2);

        state.registry.close();
        let mut late = register(&mut state, 3, "sender-b", Role::Sender);
        assert!(matches!(late.try_recv(), Ok(ControlMessage::Rejected { .. })));
    }

    #[test]
    fn test_disconnect_marks_worker_lost_once() {
        let mut state = state();
        register(&mut state, 1, "sender-a", Role::Sender);
        register(&mut state, 2, "receiver-a", Role::Receiver);

        let handled = state.handle(Inbound::Disconnected { conn: 2 });
        assert!(matches!(
            handled,
            Handled::Lost { kind: FailureKind::Disconnected, .. }
        ));
        assert!(matches!(
            state.handle(Inbound::Detached { worker_id: "receiver-a".to_string() }),
            Handled::Done
        ));
        assert_eq!(state.live_workers(), vec!["sender-a".to_string()]);
        let (kind, detail) = state.first_lost(&["sender-a", "receiver-a"]).unwrap();
        assert_eq!(kind, FailureKind::Disconnected);
        assert!(detail.starts_with("receiver-a"));
        assert!(!state.all_lost());

        state.handle(Inbound::Disconnected { conn: 1 });
        assert!(state.all_lost());
    }

    #[test]
    fn test_desync_error_is_a_loss_and_other_traffic_passes_through() {
        let mut state = state();
        register(&mut state, 1, "sender-a", Role::Sender);

        let handled = state.handle(Inbound::Message {
            conn: 1,
            message: ControlMessage::Error {
                case_index: 4,
                worker_id: "sender-a".to_string(),
                kind: FailureKind::ProtocolDesync,
                detail: "expected 3".to_string(),
            },
        });
        assert!(matches!(
            handled,
            Handled::Lost { kind: FailureKind::ProtocolDesync, .. }
        ));

        let handled = state.handle(Inbound::Message {
            conn: 1,
            message: ControlMessage::Ready {
                case_index: 0,
                worker_id: "sender-a".to_string(),
            },
        });
        assert!(matches!(handled, Handled::Case(ControlMessage::Ready { .. })));
    }

    #[test]
    fn test_message_case_index() {
        let ready = ControlMessage::Ready {
            case_index: 7,
            worker_id: "w".to_string(),
        };
        assert_eq!(message_case_index(&ready), Some(7));
        assert_eq!(message_case_index(&ControlMessage::Shutdown), None);
    }
}
