//! # Control Protocol
//!
//! Typed messages exchanged between the coordinator and its workers, plus the
//! frame codec used on every control connection.
//!
//! ## Channels
//!
//! - **Router** (worker ⇄ coordinator): one connection per worker carrying
//!   `Register`, `Registered`/`Rejected`, `Ready`, `CaseResult` and `Error`.
//! - **Broadcast** (coordinator → all workers): the worker opens it after
//!   registering, announces itself with `Subscribe`, then only reads
//!   `CaseConfig`, `Start` and `Shutdown`.
//!
//! ## Framing
//!
//! Each frame is a 4-byte little-endian length followed by the bincode
//! encoding of a [`ControlMessage`]. Frames larger than
//! [`MAX_CONTROL_FRAME`] are refused before any allocation.

use crate::cli::Role;
use crate::error::FailureKind;
use crate::matrix::TestCase;
use crate::metrics::SessionMetrics;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Upper bound for a single control frame.
pub const MAX_CONTROL_FRAME: usize = 16 * 1024 * 1024;

/// Writes that cannot make progress for this long are treated as a dead peer.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a worker says about itself when it registers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub worker_id: String,
    pub role: Role,
    pub address: IpAddr,
}

/// Identity the registry assigned to a worker. Immutable once issued.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub id: String,
    pub role: Role,
    pub pair_index: usize,
    /// Position among the pair's receivers; always 0 for senders
    pub slot: usize,
    pub address: IpAddr,
}

/// One sender and its receivers, with the data ports of their session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairAssignment {
    pub pair_id: usize,
    pub sender: WorkerIdentity,
    /// Ordered by slot
    pub receivers: Vec<WorkerIdentity>,
    /// Listening side of the pair's data plane
    pub layout: DataLayout,
}

/// Which side of a pair listens and on which ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataLayout {
    /// Each receiver listens on its own port, indexed by slot
    ReceiversBind { ports: Vec<u16> },
    /// The sender listens on one port and every receiver connects to it
    SenderBinds { port: u16 },
}

impl PairAssignment {
    pub fn members(&self) -> impl Iterator<Item = &WorkerIdentity> {
        std::iter::once(&self.sender).chain(self.receivers.iter())
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.members().any(|member| member.id == worker_id)
    }

    /// Every data port this pair occupies
    pub fn ports(&self) -> Vec<u16> {
        match &self.layout {
            DataLayout::ReceiversBind { ports } => ports.clone(),
            DataLayout::SenderBinds { port } => vec![*port],
        }
    }
}

/// Every message on either control channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    Register(Registration),
    Registered {
        identity: WorkerIdentity,
        /// Port of the broadcast listener the worker must subscribe to
        broadcast_port: u16,
    },
    Rejected {
        reason: String,
    },
    Subscribe {
        worker_id: String,
    },
    CaseConfig {
        case: TestCase,
        assignments: Vec<PairAssignment>,
    },
    Ready {
        case_index: u64,
        worker_id: String,
    },
    Start {
        case_index: u64,
        /// Workers expected to run; everyone else idles through the case
        participants: Vec<String>,
    },
    CaseResult {
        case_index: u64,
        worker_id: String,
        metrics: SessionMetrics,
    },
    Error {
        case_index: u64,
        worker_id: String,
        kind: FailureKind,
        detail: String,
    },
    Shutdown,
}

impl ControlMessage {
    /// Short name used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Register(_) => "REGISTER",
            ControlMessage::Registered { .. } => "REGISTERED",
            ControlMessage::Rejected { .. } => "REJECTED",
            ControlMessage::Subscribe { .. } => "SUBSCRIBE",
            ControlMessage::CaseConfig { .. } => "CASE_CONFIG",
            ControlMessage::Ready { .. } => "READY",
            ControlMessage::Start { .. } => "START",
            ControlMessage::CaseResult { .. } => "CASE_RESULT",
            ControlMessage::Error { .. } => "ERROR",
            ControlMessage::Shutdown => "SHUTDOWN",
        }
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Length-prefixed frame ready to be written as-is
    pub fn to_frame(&self) -> bincode::Result<Vec<u8>> {
        let body = self.to_bytes()?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Read one control frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_message<R>(stream: &mut R) -> std::io::Result<Option<ControlMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let message_len = u32::from_le_bytes(len_bytes) as usize;

    if message_len > MAX_CONTROL_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Control frame too large: {} bytes", message_len),
        ));
    }

    let mut message_data = vec![0u8; message_len];
    stream.read_exact(&mut message_data).await?;

    ControlMessage::from_bytes(&message_data)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Write one already-encoded frame, bounded by [`WRITE_TIMEOUT`].
pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write_fut = async {
        stream.write_all(frame).await?;
        stream.flush().await
    };

    match timeout(WRITE_TIMEOUT, write_fut).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "control write timed out",
        )),
    }
}

/// Encode and write one control message.
pub async fn write_message<W>(stream: &mut W, message: &ControlMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message
        .to_frame()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_frame(stream, &frame).await
}
