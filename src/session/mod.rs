//! # Data-Plane Session
//!
//! One session runs per case on every participating worker: the sender pushes
//! exactly `message_count` messages of `message_size` bytes to its receivers
//! over dedicated TCP connections, and each receiver counts what arrives.
//!
//! ## Wire Format
//!
//! Every data message is a 4-byte little-endian length followed by the
//! payload. The zero-copy flag only changes buffer handling inside the
//! process; the bytes on the wire are identical either way.
//!
//! ## High-Water Marks
//!
//! Each peer connection is fed through an in-process queue holding at most
//! `send_hwm` (sender) or `recv_hwm` (receiver) messages, 0 meaning
//! unbounded. What happens on a full queue is the pattern's defining
//! behaviour:
//!
//! - **work-queue**: the sender moves on to the next peer with room and
//!   blocks when every peer is full; receivers stop reading from the socket
//!   until the queue drains, pushing back through TCP.
//! - **fan-out**: the message is dropped for that peer, on either side.
//!
//! Elapsed time runs from the moment START is processed; receivers stop the
//! clock at their last message.

mod endpoint;
mod receiver;
mod sender;

pub use endpoint::{DataPlane, Endpoint, TcpDataPlane};

use crate::cli::{Pattern, Role};
use crate::config::BenchmarkSettings;
use crate::error::SessionError;
use crate::matrix::TestCase;
use crate::metrics::SessionMetrics;
use crate::protocol::PairAssignment;
use bytes::Bytes;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Largest data frame a receiver accepts
pub const MAX_DATA_FRAME: usize = 16 * 1024 * 1024;

/// Socket read/write buffer used by the frame readers and writers
const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Everything a worker needs to set up and run its part of one case.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub case: TestCase,
    pub role: Role,
    pub worker_id: String,
    pub pair: PairAssignment,
    /// Receiver slot within the pair; 0 for senders
    pub slot: usize,
    pub bind_ip: IpAddr,
    pub socket_buffer_size: Option<usize>,
    pub limits: SessionLimits,
}

/// Timeouts bounding a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub connect_timeout: Duration,
    pub recv_inactivity: Duration,
}

impl SessionLimits {
    pub fn from_settings(settings: &BenchmarkSettings) -> Self {
        Self {
            connect_timeout: settings.timeouts.connect,
            recv_inactivity: settings.timeouts.recv_inactivity,
        }
    }
}

/// Pattern-specific session behaviour, chosen once per case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPlaneSession {
    WorkQueue,
    FanOut,
}

impl DataPlaneSession {
    pub fn for_pattern(pattern: Pattern) -> Self {
        match pattern {
            Pattern::WorkQueue => DataPlaneSession::WorkQueue,
            Pattern::FanOut => DataPlaneSession::FanOut,
        }
    }

    /// Whether a full queue drops the message instead of waiting
    pub(crate) fn drops_when_full(self) -> bool {
        matches!(self, DataPlaneSession::FanOut)
    }

    /// Run this worker's side of `case` over `endpoint`. The clock starts on entry.
    pub async fn run(
        self,
        role: Role,
        case: &TestCase,
        endpoint: Endpoint,
        plan_limits: SessionLimits,
        socket_buffer_size: Option<usize>,
    ) -> Result<SessionMetrics, SessionError> {
        let started = Instant::now();
        let streams = endpoint
            .establish(plan_limits.connect_timeout, socket_buffer_size)
            .await?;

        match role {
            Role::Sender => sender::run_sender(self, case, streams, started).await,
            Role::Receiver => {
                receiver::run_receiver(self, case, streams, started, plan_limits.recv_inactivity)
                    .await
            }
        }
    }
}

/// Producer half of a high-water-mark queue
#[derive(Clone)]
pub(crate) enum HwmSender {
    Bounded(mpsc::Sender<Bytes>),
    Unbounded(mpsc::UnboundedSender<Bytes>),
}

/// Consumer half of a high-water-mark queue
pub(crate) enum HwmReceiver {
    Bounded(mpsc::Receiver<Bytes>),
    Unbounded(mpsc::UnboundedReceiver<Bytes>),
}

/// Queue holding at most `hwm` messages; 0 means unbounded
pub(crate) fn hwm_queue(hwm: usize) -> (HwmSender, HwmReceiver) {
    if hwm == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (HwmSender::Unbounded(tx), HwmReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(hwm);
        (HwmSender::Bounded(tx), HwmReceiver::Bounded(rx))
    }
}

impl HwmSender {
    pub(crate) fn try_send(&self, message: Bytes) -> Result<(), TrySendError<Bytes>> {
        match self {
            HwmSender::Bounded(tx) => tx.try_send(message),
            HwmSender::Unbounded(tx) => tx
                .send(message)
                .map_err(|e| TrySendError::Closed(e.0)),
        }
    }

    /// Wait for room. `Err` returns the message when the consumer is gone.
    pub(crate) async fn send(&self, message: Bytes) -> Result<(), Bytes> {
        match self {
            HwmSender::Bounded(tx) => tx.send(message).await.map_err(|e| e.0),
            HwmSender::Unbounded(tx) => tx.send(message).map_err(|e| e.0),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        match self {
            HwmSender::Bounded(tx) => tx.is_closed(),
            HwmSender::Unbounded(tx) => tx.is_closed(),
        }
    }
}

impl HwmReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Bytes> {
        match self {
            HwmReceiver::Bounded(rx) => rx.recv().await,
            HwmReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}
