//! # Worker
//!
//! A worker registers with the coordinator, subscribes to its broadcast
//! channel and then runs whatever cases it is told to, one at a time:
//!
//! 1. `CASE_CONFIG` opens the data-plane endpoint for the worker's pair,
//!    waits the settle delay and answers `READY` (or `ERROR`).
//! 2. `START` runs the session if the worker is listed as a participant and
//!    answers `CASE_RESULT` (or `ERROR`).
//! 3. `SHUTDOWN` ends the worker.
//!
//! Case indices only ever grow. A `CASE_CONFIG` that does not advance the
//! index, or a `START` for a case other than the configured one, means the
//! worker and coordinator disagree about the run; the worker reports
//! `ProtocolDesync` and terminates.

mod state;

pub use state::WorkerState;

use crate::cli::Role;
use crate::config::BenchmarkSettings;
use crate::error::{BenchError, FailureKind};
use crate::matrix::TestCase;
use crate::metrics::SessionMetrics;
use crate::protocol::{self, ControlMessage, PairAssignment, Registration, WorkerIdentity};
use crate::session::{DataPlane, DataPlaneSession, Endpoint, SessionLimits, SessionPlan, TcpDataPlane};
use crate::utils::generate_worker_suffix;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const BROADCAST_QUEUE_DEPTH: usize = 64;

/// Summary of a worker that shut down cleanly.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub identity: WorkerIdentity,
    pub cases_run: u64,
    pub cases_failed: u64,
    pub final_state: WorkerState,
}

/// A case configured but not yet started.
struct PendingCase {
    case: TestCase,
    /// `None` when the worker is not part of any pair this case
    session: Option<(SessionPlan, Endpoint)>,
}

/// Request/reply connection to the coordinator's router.
struct RouterLink {
    writer: OwnedWriteHalf,
    // Held so the connection stays open for the worker's lifetime
    _reader: OwnedReadHalf,
}

impl RouterLink {
    async fn send(&mut self, message: &ControlMessage) -> Result<(), BenchError> {
        debug!("Sending {}", message.name());
        protocol::write_message(&mut self.writer, message)
            .await
            .map_err(|e| BenchError::ControlChannelLost(format!("router write failed: {}", e)))
    }
}

pub struct Worker {
    id: String,
    role: Role,
    settings: BenchmarkSettings,
    data_plane: Arc<dyn DataPlane>,
    state: WorkerState,
}

impl Worker {
    pub fn new(role: Role, settings: &BenchmarkSettings) -> Self {
        Self::with_data_plane(role, settings, Arc::new(TcpDataPlane))
    }

    /// Worker whose endpoints are opened by `data_plane`
    pub fn with_data_plane(
        role: Role,
        settings: &BenchmarkSettings,
        data_plane: Arc<dyn DataPlane>,
    ) -> Self {
        Self {
            id: format!("{}-{}", role, generate_worker_suffix()),
            role,
            settings: settings.clone(),
            data_plane,
            state: WorkerState::Idle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Register, then follow the coordinator until `SHUTDOWN`.
    pub async fn run(mut self) -> Result<WorkerOutcome, BenchError> {
        let registration_deadline = Instant::now() + self.settings.timeouts.registration;
        let (mut router, identity, broadcast_port) = self.register(registration_deadline).await?;
        self.state.advance(WorkerState::Registered)?;
        info!(
            "Registered as {} of pair {} (slot {})",
            identity.role, identity.pair_index, identity.slot
        );

        let mut events = self.subscribe(broadcast_port, registration_deadline).await?;
        self.state.advance(WorkerState::AwaitingCase)?;

        let mut outcome = WorkerOutcome {
            identity,
            cases_run: 0,
            cases_failed: 0,
            final_state: self.state,
        };
        let mut pending: Option<PendingCase> = None;
        let mut last_config: Option<u64> = None;
        let mut failed_config: Option<u64> = None;

        while let Some(message) = events.recv().await {
            debug!("Received {}", message.name());
            match message {
                ControlMessage::CaseConfig { case, assignments } => {
                    if let Some(last) = last_config {
                        if case.index <= last {
                            return self
                                .desync(&mut router, Some(last + 1), case.index, "CASE_CONFIG")
                                .await;
                        }
                    }
                    last_config = Some(case.index);
                    if let Some(superseded) = pending.take() {
                        debug!("Case {} superseded by case {}", superseded.case.index, case.index);
                    }
                    self.state.advance(WorkerState::ConfiguringCase)?;

                    match self.configure(&outcome.identity, case, &assignments).await {
                        Ok(configured) => {
                            let case_index = configured.case.index;
                            pending = Some(configured);
                            router
                                .send(&ControlMessage::Ready {
                                    case_index,
                                    worker_id: self.id.clone(),
                                })
                                .await?;
                        }
                        Err((case_index, kind, detail)) => {
                            warn!("Case {} setup failed ({}): {}", case_index, kind, detail);
                            failed_config = Some(case_index);
                            outcome.cases_failed += 1;
                            self.state.advance(WorkerState::AwaitingCase)?;
                            router
                                .send(&ControlMessage::Error {
                                    case_index,
                                    worker_id: self.id.clone(),
                                    kind,
                                    detail,
                                })
                                .await?;
                        }
                    }
                }
                ControlMessage::Start {
                    case_index,
                    participants,
                } => {
                    let configured = match pending.take() {
                        Some(configured) if configured.case.index == case_index => configured,
                        other => {
                            if other.is_none() && failed_config == Some(case_index) {
                                debug!("Ignoring START for case {} after failed setup", case_index);
                                continue;
                            }
                            let expected = other.map(|p| p.case.index).or(last_config);
                            return self.desync(&mut router, expected, case_index, "START").await;
                        }
                    };

                    let listed = participants.iter().any(|id| id == &self.id);
                    match configured.session {
                        Some((plan, endpoint)) if listed => {
                            self.state.advance(WorkerState::Running)?;
                            let result = self.run_session(&plan, endpoint).await;
                            self.state.advance(WorkerState::Reporting)?;
                            outcome.cases_run += 1;

                            let report = match result {
                                Ok(metrics) => ControlMessage::CaseResult {
                                    case_index,
                                    worker_id: self.id.clone(),
                                    metrics,
                                },
                                Err((kind, detail)) => {
                                    warn!("Case {} failed ({}): {}", case_index, kind, detail);
                                    outcome.cases_failed += 1;
                                    ControlMessage::Error {
                                        case_index,
                                        worker_id: self.id.clone(),
                                        kind,
                                        detail,
                                    }
                                }
                            };
                            router.send(&report).await?;
                            self.state.advance(WorkerState::AwaitingCase)?;
                        }
                        Some(_) => {
                            debug!("Not participating in case {}", case_index);
                            self.state.advance(WorkerState::AwaitingCase)?;
                        }
                        None => {
                            self.state.advance(WorkerState::Running)?;
                            self.state.advance(WorkerState::Reporting)?;
                            router
                                .send(&ControlMessage::CaseResult {
                                    case_index,
                                    worker_id: self.id.clone(),
                                    metrics: SessionMetrics::idle(),
                                })
                                .await?;
                            self.state.advance(WorkerState::AwaitingCase)?;
                        }
                    }
                }
                ControlMessage::Shutdown => {
                    info!(
                        "Shutdown received after {} cases ({} failed)",
                        outcome.cases_run, outcome.cases_failed
                    );
                    self.state.advance(WorkerState::Terminated)?;
                    outcome.final_state = self.state;
                    return Ok(outcome);
                }
                other => warn!("Unexpected {} on broadcast channel", other.name()),
            }
        }

        self.state.advance(WorkerState::Terminated)?;
        Err(BenchError::ControlChannelLost(
            "broadcast channel closed before SHUTDOWN".to_string(),
        ))
    }

    async fn register(
        &self,
        deadline: Instant,
    ) -> Result<(RouterLink, WorkerIdentity, u16), BenchError> {
        let router_addr = self.settings.network.router_addr();
        let stream = connect_with_retry(router_addr, deadline).await?;
        let (mut reader, mut writer) = stream.into_split();
        let register = ControlMessage::Register(Registration {
            worker_id: self.id.clone(),
            role: self.role,
            address: self.settings.network.advertised_ip(),
        });
        protocol::write_message(&mut writer, &register)
            .await
            .map_err(|e| BenchError::ControlChannelLost(format!("router write failed: {}", e)))?;

        let reply = timeout_at(deadline, protocol::read_message(&mut reader))
            .await
            .map_err(|_| {
                BenchError::ControlChannelLost(format!(
                    "no registration reply from {} before the deadline",
                    router_addr
                ))
            })?
            .map_err(|e| BenchError::ControlChannelLost(format!("router read failed: {}", e)))?;
        let router = RouterLink {
            writer,
            _reader: reader,
        };

        match reply {
            Some(ControlMessage::Registered {
                identity,
                broadcast_port,
            }) => Ok((router, identity, broadcast_port)),
            Some(ControlMessage::Rejected { reason }) => Err(BenchError::Rejected(reason)),
            Some(other) => Err(BenchError::ControlChannelLost(format!(
                "expected REGISTERED, got {}",
                other.name()
            ))),
            None => Err(BenchError::ControlChannelLost(
                "router closed during registration".to_string(),
            )),
        }
    }

    /// Open the broadcast channel and forward its messages to the returned queue
    async fn subscribe(
        &self,
        broadcast_port: u16,
        deadline: Instant,
    ) -> Result<mpsc::Receiver<ControlMessage>, BenchError> {
        let addr = SocketAddr::new(self.settings.network.coordinator_ip, broadcast_port);
        let stream = connect_with_retry(addr, deadline).await?;
        let (mut reader, mut writer) = stream.into_split();
        protocol::write_message(
            &mut writer,
            &ControlMessage::Subscribe {
                worker_id: self.id.clone(),
            },
        )
        .await
        .map_err(|e| BenchError::ControlChannelLost(format!("subscribe failed: {}", e)))?;

        let (tx, rx) = mpsc::channel(BROADCAST_QUEUE_DEPTH);
        tokio::spawn(async move {
            // The write half lives here so the subscription stays open
            let _writer = writer;
            loop {
                match protocol::read_message(&mut reader).await {
                    Ok(Some(message)) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Broadcast channel read failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Prepare this worker's part of `case`. Errors carry what goes into the ERROR reply.
    async fn configure(
        &self,
        identity: &WorkerIdentity,
        case: TestCase,
        assignments: &[PairAssignment],
    ) -> Result<PendingCase, (u64, FailureKind, String)> {
        let Some(pair) = assignments.iter().find(|pair| pair.contains(&self.id)) else {
            debug!("No pair assigned for case {}", case.index);
            return Ok(PendingCase {
                case,
                session: None,
            });
        };

        let plan = SessionPlan {
            case: case.clone(),
            role: self.role,
            worker_id: self.id.clone(),
            pair: pair.clone(),
            slot: identity.slot,
            bind_ip: self.settings.network.bind_ip,
            socket_buffer_size: self.settings.network.socket_buffer_size,
            limits: SessionLimits::from_settings(&self.settings),
        };

        let endpoint = self
            .data_plane
            .open(&plan)
            .await
            .map_err(|e| (case.index, e.kind(), e.to_string()))?;
        debug!(
            "Case {} endpoint ready with {} peer(s)",
            case.index,
            endpoint.peer_count()
        );
        sleep(self.settings.timeouts.setup_delay).await;

        Ok(PendingCase {
            case,
            session: Some((plan, endpoint)),
        })
    }

    async fn run_session(
        &self,
        plan: &SessionPlan,
        endpoint: Endpoint,
    ) -> Result<SessionMetrics, (FailureKind, String)> {
        let metrics = DataPlaneSession::for_pattern(plan.case.pattern)
            .run(
                self.role,
                &plan.case,
                endpoint,
                plan.limits,
                plan.socket_buffer_size,
            )
            .await
            .map_err(|e| (e.kind(), e.to_string()))?;

        debug!(
            "Case {} done: sent {}, received {}, {:.3}s",
            plan.case.index, metrics.messages_sent, metrics.messages_received, metrics.elapsed_seconds
        );
        Ok(metrics)
    }

    /// Report the disagreement and stop for good.
    async fn desync(
        &mut self,
        router: &mut RouterLink,
        expected: Option<u64>,
        received: u64,
        message: &'static str,
    ) -> Result<WorkerOutcome, BenchError> {
        let error = BenchError::ProtocolDesync {
            expected,
            received,
            message,
        };
        warn!("{}", error);
        let _ = router
            .send(&ControlMessage::Error {
                case_index: received,
                worker_id: self.id.clone(),
                kind: FailureKind::ProtocolDesync,
                detail: error.to_string(),
            })
            .await;
        self.state.advance(WorkerState::Terminated)?;
        Err(error)
    }
}

async fn connect_with_retry(addr: SocketAddr, deadline: Instant) -> Result<TcpStream, BenchError> {
    loop {
        let last_error = match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        if Instant::now() + CONNECT_RETRY_DELAY >= deadline {
            return Err(BenchError::ControlChannelLost(format!(
                "could not reach coordinator at {}: {}",
                addr, last_error
            )));
        }
        sleep(CONNECT_RETRY_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Pattern;
    use crate::coordinator::{ControlPlane, Inbound};
    use std::net::{IpAddr, Ipv4Addr};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn case(index: u64) -> TestCase {
        TestCase {
            index,
            pattern: Pattern::WorkQueue,
            message_size: 64,
            message_count: 10,
            zero_copy: false,
            send_hwm: 10,
            recv_hwm: 10,
        }
    }

    /// Bind a bare control plane and start one sender worker against it
    async fn start_worker() -> (ControlPlane, tokio::task::JoinHandle<Result<WorkerOutcome, BenchError>>) {
        let mut settings = BenchmarkSettings::default();
        settings.network.coordinator_ip = LOCALHOST;
        settings.network.bind_ip = LOCALHOST;
        settings.network.router_port = 0;
        settings.network.broadcast_port = 0;
        settings.timeouts.registration = Duration::from_secs(5);
        settings.timeouts.setup_delay = Duration::ZERO;

        let mut control = ControlPlane::bind(&settings.network).await.unwrap();
        settings.network.router_port = control.router_addr().port();
        let handle = tokio::spawn(Worker::new(Role::Sender, &settings).run());

        let mut reply = None;
        loop {
            match control.recv().await.unwrap() {
                Inbound::Connected { reply: r, .. } => reply = Some(r),
                Inbound::Message {
                    message: ControlMessage::Register(registration),
                    ..
                } => {
                    let identity = WorkerIdentity {
                        id: registration.worker_id,
                        role: registration.role,
                        pair_index: 0,
                        slot: 0,
                        address: registration.address,
                    };
                    let registered = ControlMessage::Registered {
                        identity,
                        broadcast_port: control.broadcast_addr().port(),
                    };
                    reply.as_ref().unwrap().send(registered).await.unwrap();
                }
                Inbound::Attached { .. } => break,
                _ => {}
            }
        }
        (control, handle)
    }

    async fn next_message(control: &mut ControlPlane) -> ControlMessage {
        loop {
            if let Inbound::Message { message, .. } = control.recv().await.unwrap() {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_unassigned_worker_idles_through_case() {
        let (mut control, handle) = start_worker().await;

        control
            .broadcast(&ControlMessage::CaseConfig {
                case: case(0),
                assignments: vec![],
            })
            .unwrap();
        assert!(matches!(
            next_message(&mut control).await,
            ControlMessage::Ready { case_index: 0, .. }
        ));

        control
            .broadcast(&ControlMessage::Start {
                case_index: 0,
                participants: vec![],
            })
            .unwrap();
        match next_message(&mut control).await {
            ControlMessage::CaseResult {
                case_index,
                metrics,
                ..
            } => {
                assert_eq!(case_index, 0);
                assert_eq!(metrics, SessionMetrics::idle());
            }
            other => panic!("expected CASE_RESULT, got {}", other.name()),
        }

        control.broadcast(&ControlMessage::Shutdown).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.final_state, WorkerState::Terminated);
        assert_eq!(outcome.cases_run, 0);
    }

    #[tokio::test]
    async fn test_stale_case_config_is_a_desync() {
        let (mut control, handle) = start_worker().await;

        control
            .broadcast(&ControlMessage::CaseConfig {
                case: case(2),
                assignments: vec![],
            })
            .unwrap();
        assert!(matches!(
            next_message(&mut control).await,
            ControlMessage::Ready { case_index: 2, .. }
        ));

        control
            .broadcast(&ControlMessage::CaseConfig {
                case: case(1),
                assignments: vec![],
            })
            .unwrap();
        assert!(matches!(
            next_message(&mut control).await,
            ControlMessage::Error {
                case_index: 1,
                kind: FailureKind::ProtocolDesync,
                ..
            }
        ));

        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(BenchError::ProtocolDesync {
                expected: Some(3),
                received: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_start_for_unconfigured_case_is_a_desync() {
        let (mut control, handle) = start_worker().await;

        control
            .broadcast(&ControlMessage::Start {
                case_index: 5,
                participants: vec![],
            })
            .unwrap();
        assert!(matches!(
            next_message(&mut control).await,
            ControlMessage::Error {
                kind: FailureKind::ProtocolDesync,
                ..
            }
        ));
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_lost_broadcast_channel_ends_worker() {
        let (control, handle) = start_worker().await;
        drop(control);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BenchError::ControlChannelLost(_))));
    }
}
