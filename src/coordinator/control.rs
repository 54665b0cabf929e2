//! Coordinator side of the control channels.
//!
//! Two listeners are bound: the router (one request/reply connection per
//! worker) and the broadcast fan-out. Every connection gets its own task, and
//! those tasks funnel what they see into a single [`Inbound`] queue that the
//! orchestration loop drains. Outbound broadcast frames are encoded once and
//! shared with every subscriber through a `tokio::sync::broadcast` channel.

use crate::config::NetworkSettings;
use crate::error::BenchError;
use crate::protocol::{self, ControlMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Connection identifier for router connections
pub type ConnectionId = u64;

const INBOUND_QUEUE_DEPTH: usize = 1000;
const REPLY_QUEUE_DEPTH: usize = 64;
const BROADCAST_CAPACITY: usize = 1024;
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the control loop hears from the connection tasks.
#[derive(Debug)]
pub enum Inbound {
    /// A router connection opened; replies go through `reply`
    Connected {
        conn: ConnectionId,
        reply: mpsc::Sender<ControlMessage>,
    },
    Message {
        conn: ConnectionId,
        message: ControlMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
    /// A worker subscribed to the broadcast channel
    Attached {
        worker_id: String,
    },
    /// A broadcast subscriber went away or fell behind
    Detached {
        worker_id: String,
    },
}

type Frame = Arc<Vec<u8>>;

pub struct ControlPlane {
    router_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    broadcast: broadcast::Sender<Frame>,
    inbound: mpsc::Receiver<Inbound>,
    acceptors: Vec<JoinHandle<()>>,
    /// Every subscriber task holds a clone; the channel closes once they all finish
    subscribers_done: Option<mpsc::Sender<()>>,
    subscribers_done_rx: mpsc::Receiver<()>,
}

impl ControlPlane {
    /// Bind both listeners and start accepting
    pub async fn bind(network: &NetworkSettings) -> Result<Self, BenchError> {
        let router = TcpListener::bind(SocketAddr::new(network.bind_ip, network.router_port)).await?;
        let fanout =
            TcpListener::bind(SocketAddr::new(network.bind_ip, network.broadcast_port)).await?;
        let router_addr = router.local_addr()?;
        let broadcast_addr = fanout.local_addr()?;

        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (done_tx, subscribers_done_rx) = mpsc::channel(1);

        let acceptors = vec![
            tokio::spawn(accept_router(router, inbound_tx.clone())),
            tokio::spawn(accept_subscribers(
                fanout,
                broadcast.clone(),
                inbound_tx,
                done_tx.clone(),
            )),
        ];

        debug!(
            "Control plane listening: router {}, broadcast {}",
            router_addr, broadcast_addr
        );

        Ok(Self {
            router_addr,
            broadcast_addr,
            broadcast,
            inbound,
            acceptors,
            subscribers_done: Some(done_tx),
            subscribers_done_rx,
        })
    }

    pub fn router_addr(&self) -> SocketAddr {
        self.router_addr
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast_addr
    }

    /// Next inbound event. `None` once every connection task is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Fan a message out to every subscriber; returns how many will get it
    pub fn broadcast(&self, message: &ControlMessage) -> Result<usize, BenchError> {
        let frame = Arc::new(message.to_frame()?);
        match self.broadcast.send(frame) {
            Ok(receivers) => {
                debug!("Broadcast {} to {} subscribers", message.name(), receivers);
                Ok(receivers)
            }
            Err(_) => {
                debug!("Broadcast {} had no subscribers", message.name());
                Ok(0)
            }
        }
    }

    /// Stop accepting, let subscribers flush what was already broadcast,
    /// and wait up to `grace` for them to finish.
    pub async fn shutdown(mut self, grace: Duration) {
        for acceptor in self.acceptors.drain(..) {
            acceptor.abort();
            let _ = acceptor.await;
        }
        self.subscribers_done = None;

        let (closed_tx, _) = broadcast::channel(1);
        drop(std::mem::replace(&mut self.broadcast, closed_tx));

        if timeout(grace, self.subscribers_done_rx.recv()).await.is_err() {
            warn!("Broadcast subscribers did not drain within {:?}", grace);
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        for acceptor in &self.acceptors {
            acceptor.abort();
        }
    }
}

async fn accept_router(listener: TcpListener, inbound: mpsc::Sender<Inbound>) {
    let next_connection_id = AtomicU64::new(1);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = next_connection_id.fetch_add(1, Ordering::Relaxed);
                debug!("Router connection {} from {}", conn, peer);
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle_router_connection(conn, stream, inbound.clone()));
            }
            Err(e) => {
                warn!("Router accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_router_connection(
    conn: ConnectionId,
    stream: TcpStream,
    inbound: mpsc::Sender<Inbound>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (reply, mut replies) = mpsc::channel::<ControlMessage>(REPLY_QUEUE_DEPTH);
    if inbound
        .send(Inbound::Connected { conn, reply })
        .await
        .is_err()
    {
        return;
    }

    let writer_task = tokio::spawn(async move {
        while let Some(message) = replies.recv().await {
            if let Err(e) = protocol::write_message(&mut writer, &message).await {
                debug!("Reply to connection {} failed: {}", conn, e);
                break;
            }
        }
    });

    loop {
        match protocol::read_message(&mut reader).await {
            Ok(Some(message)) => {
                if inbound
                    .send(Inbound::Message { conn, message })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Router connection {} closed: {}", conn, e);
                break;
            }
        }
    }

    let _ = inbound.send(Inbound::Disconnected { conn }).await;
    writer_task.abort();
}

async fn accept_subscribers(
    listener: TcpListener,
    broadcast: broadcast::Sender<Frame>,
    inbound: mpsc::Sender<Inbound>,
    done: mpsc::Sender<()>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Broadcast subscriber connected from {}", peer);
                let _ = stream.set_nodelay(true);
                // Subscribe before the hello so nothing broadcast in between is missed.
                let frames = broadcast.subscribe();
                tokio::spawn(handle_subscriber(
                    stream,
                    frames,
                    inbound.clone(),
                    done.clone(),
                ));
            }
            Err(e) => {
                warn!("Broadcast accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_subscriber(
    stream: TcpStream,
    mut frames: broadcast::Receiver<Frame>,
    inbound: mpsc::Sender<Inbound>,
    _done: mpsc::Sender<()>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let worker_id = match timeout(SUBSCRIBE_TIMEOUT, protocol::read_message(&mut reader)).await {
        Ok(Ok(Some(ControlMessage::Subscribe { worker_id }))) => worker_id,
        Ok(Ok(Some(other))) => {
            warn!("Expected SUBSCRIBE on broadcast channel, got {}", other.name());
            return;
        }
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => {
            debug!("Broadcast subscriber left before subscribing");
            return;
        }
    };

    if inbound
        .send(Inbound::Attached {
            worker_id: worker_id.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    // Subscribers send nothing after SUBSCRIBE, so a completed read means the
    // worker hung up.
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if let Err(e) = protocol::write_frame(&mut writer, &frame).await {
                        debug!("Broadcast to {} failed: {}", worker_id, e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber {} fell {} frames behind, dropping it", worker_id, skipped);
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = protocol::read_message(&mut reader) => break,
        }
    }

    let _ = inbound.send(Inbound::Detached { worker_id }).await;
}
