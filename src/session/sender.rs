//! Sender side of a data-plane session.

use super::{hwm_queue, DataPlaneSession, HwmReceiver, HwmSender, IO_BUFFER_SIZE};
use crate::error::SessionError;
use crate::matrix::TestCase;
use crate::metrics::{SessionMetrics, ThroughputCalculator};
use bytes::Bytes;
use std::time::Instant;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Fan-out gives the writers a turn this often, since it never waits on them
const YIELD_INTERVAL: u64 = 256;

pub(super) async fn run_sender(
    session: DataPlaneSession,
    case: &TestCase,
    streams: Vec<TcpStream>,
    started: Instant,
) -> Result<SessionMetrics, SessionError> {
    let mut queues = Vec::with_capacity(streams.len());
    let mut writers: Vec<JoinHandle<std::io::Result<u64>>> = Vec::with_capacity(streams.len());
    for stream in streams {
        let (tx, rx) = hwm_queue(case.send_hwm);
        queues.push(tx);
        writers.push(tokio::spawn(write_frames(stream, rx)));
    }

    let mut calculator = ThroughputCalculator::new(started);
    let payload = Bytes::from(vec![b' '; case.message_size]);
    let mut next_peer = 0;

    for sequence in 0..case.message_count {
        match session {
            DataPlaneSession::WorkQueue => {
                let message = next_message(&payload, case.zero_copy);
                dispatch_to_one(&queues, &mut next_peer, message).await?;
            }
            DataPlaneSession::FanOut => {
                let mut delivered = 0;
                for queue in &queues {
                    match queue.try_send(next_message(&payload, case.zero_copy)) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => calculator.record_drop(),
                        Err(TrySendError::Closed(_)) => {}
                    }
                }
                if delivered == 0 && queues.iter().all(HwmSender::is_closed) {
                    return Err(SessionError::PeersLost);
                }
                if sequence % YIELD_INTERVAL == YIELD_INTERVAL - 1 {
                    tokio::task::yield_now().await;
                }
            }
        }
        calculator.record_message(case.message_size);
    }

    drop(queues);
    for writer in writers {
        match writer.await {
            Ok(Ok(written)) => debug!("Writer finished after {} frames", written),
            Ok(Err(e)) => warn!("Data stream write failed: {}", e),
            Err(e) => warn!("Writer task failed: {}", e),
        }
    }

    Ok(calculator.sender_metrics())
}

/// Zero-copy shares the payload buffer; copy mode materializes a fresh one
fn next_message(payload: &Bytes, zero_copy: bool) -> Bytes {
    if zero_copy {
        payload.clone()
    } else {
        Bytes::copy_from_slice(payload)
    }
}

/// Hand `message` to the next peer with room, waiting only when all are full.
async fn dispatch_to_one(
    queues: &[HwmSender],
    next_peer: &mut usize,
    mut message: Bytes,
) -> Result<(), SessionError> {
    let peers = queues.len();
    for offset in 0..peers {
        let index = (*next_peer + offset) % peers;
        match queues[index].try_send(message) {
            Ok(()) => {
                *next_peer = (index + 1) % peers;
                return Ok(());
            }
            Err(TrySendError::Full(m)) | Err(TrySendError::Closed(m)) => message = m,
        }
    }

    for offset in 0..peers {
        let index = (*next_peer + offset) % peers;
        if queues[index].is_closed() {
            continue;
        }
        match queues[index].send(message).await {
            Ok(()) => {
                *next_peer = (index + 1) % peers;
                return Ok(());
            }
            Err(m) => message = m,
        }
    }
    Err(SessionError::PeersLost)
}

async fn write_frames(stream: TcpStream, mut queue: HwmReceiver) -> std::io::Result<u64> {
    let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, stream);
    let mut written = 0;
    while let Some(message) = queue.recv().await {
        writer.write_all(&(message.len() as u32).to_le_bytes()).await?;
        writer.write_all(&message).await?;
        written += 1;
    }
    writer.shutdown().await?;
    Ok(written)
}
