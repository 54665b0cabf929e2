//! Receiver side of a data-plane session.

use super::{hwm_queue, DataPlaneSession, HwmSender, IO_BUFFER_SIZE, MAX_DATA_FRAME};
use crate::error::SessionError;
use crate::matrix::TestCase;
use crate::metrics::{SessionMetrics, ThroughputCalculator};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tracing::debug;

pub(super) async fn run_receiver(
    session: DataPlaneSession,
    case: &TestCase,
    streams: Vec<TcpStream>,
    started: Instant,
    recv_inactivity: Duration,
) -> Result<SessionMetrics, SessionError> {
    let (tx, mut rx) = hwm_queue(case.recv_hwm);
    let dropped = Arc::new(AtomicU64::new(0));

    let readers: Vec<_> = streams
        .into_iter()
        .map(|stream| {
            tokio::spawn(read_frames(
                stream,
                tx.clone(),
                session,
                case.zero_copy,
                dropped.clone(),
            ))
        })
        .collect();
    drop(tx);

    let mut calculator = ThroughputCalculator::new(started);
    while calculator.message_count() < case.message_count {
        match timeout(recv_inactivity, rx.recv()).await {
            Ok(Some(message)) => calculator.record_message(message.len()),
            Ok(None) => break,
            Err(_) => {
                debug!(
                    "No data for {:?}, stopping after {} messages",
                    recv_inactivity,
                    calculator.message_count()
                );
                break;
            }
        }
    }

    let mut first_error = None;
    for reader in readers {
        reader.abort();
        if let Ok(Err(e)) = reader.await {
            first_error.get_or_insert(e);
        }
    }
    // A broken frame invalidates the count; a peer hanging up does not.
    if let Some(err @ SessionError::FrameTooLarge(_)) = first_error {
        return Err(err);
    }

    for _ in 0..dropped.load(Ordering::Relaxed) {
        calculator.record_drop();
    }
    Ok(calculator.receiver_metrics())
}

async fn read_frames(
    stream: TcpStream,
    queue: HwmSender,
    session: DataPlaneSession,
    zero_copy: bool,
    dropped: Arc<AtomicU64>,
) -> Result<(), SessionError> {
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, stream);
    let mut scratch = Vec::new();

    loop {
        let len = match reader.read_u32_le().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_DATA_FRAME {
            return Err(SessionError::FrameTooLarge(len));
        }

        let message = if zero_copy {
            let mut buffer = BytesMut::zeroed(len);
            reader.read_exact(&mut buffer).await?;
            buffer.freeze()
        } else {
            scratch.resize(len, 0);
            reader.read_exact(&mut scratch).await?;
            Bytes::copy_from_slice(&scratch)
        };

        if session.drops_when_full() {
            match queue.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => return Ok(()),
            }
        } else if queue.send(message).await.is_err() {
            return Ok(());
        }
    }
}
