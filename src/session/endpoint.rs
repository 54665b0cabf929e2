//! Opening the data-plane side of a session.
//!
//! A worker opens its endpoint while configuring a case (before READY) and
//! turns it into connected streams once START arrives. Listening sides bind
//! at configure time so the peer's connect can succeed; dialing sides only
//! resolve their targets and connect after START.

use super::SessionPlan;
use crate::cli::Role;
use crate::error::SessionError;
use crate::protocol::DataLayout;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const LISTEN_BACKLOG: i32 = 1024;

/// Local data-plane resource prepared for one case.
#[derive(Debug)]
pub enum Endpoint {
    /// Bound listener waiting for `peers` connections
    Listening { listener: TcpListener, peers: usize },
    /// Peers to connect to once the case starts
    Dialing { targets: Vec<SocketAddr> },
}

impl Endpoint {
    /// Number of peer connections this endpoint will produce
    pub fn peer_count(&self) -> usize {
        match self {
            Endpoint::Listening { peers, .. } => *peers,
            Endpoint::Dialing { targets } => targets.len(),
        }
    }

    /// Accept or connect every peer within `connect_timeout`
    pub async fn establish(
        self,
        connect_timeout: Duration,
        socket_buffer_size: Option<usize>,
    ) -> Result<Vec<TcpStream>, SessionError> {
        let deadline = Instant::now() + connect_timeout;
        let streams = match self {
            Endpoint::Listening { listener, peers } => {
                let mut streams = Vec::with_capacity(peers);
                while streams.len() < peers {
                    match timeout_at(deadline, listener.accept()).await {
                        Ok(Ok((stream, peer))) => {
                            debug!("Accepted data connection from {}", peer);
                            streams.push(stream);
                        }
                        Ok(Err(e)) => return Err(SessionError::Io(e)),
                        Err(_) => {
                            return Err(SessionError::PeersMissing {
                                connected: streams.len(),
                                expected: peers,
                                timeout: connect_timeout,
                            })
                        }
                    }
                }
                streams
            }
            Endpoint::Dialing { targets } => {
                let mut streams = Vec::with_capacity(targets.len());
                for target in targets {
                    streams.push(connect_with_retry(target, deadline, connect_timeout).await?);
                }
                streams
            }
        };

        for stream in &streams {
            tune_stream(stream, socket_buffer_size)?;
        }
        Ok(streams)
    }
}

async fn connect_with_retry(
    target: SocketAddr,
    deadline: Instant,
    connect_timeout: Duration,
) -> Result<TcpStream, SessionError> {
    loop {
        let last_error = match timeout_at(deadline, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                debug!("Connected data stream to {}", target);
                return Ok(stream);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };

        if Instant::now() + CONNECT_RETRY_DELAY >= deadline {
            return Err(SessionError::Connect {
                addr: target.to_string(),
                timeout: connect_timeout,
                detail: last_error,
            });
        }
        sleep(CONNECT_RETRY_DELAY).await;
    }
}

fn tune_stream(stream: &TcpStream, socket_buffer_size: Option<usize>) -> Result<(), SessionError> {
    stream.set_nodelay(true)?;
    if let Some(size) = socket_buffer_size {
        let socket = socket2::SockRef::from(stream);
        socket.set_recv_buffer_size(size)?;
        socket.set_send_buffer_size(size)?;
    }
    Ok(())
}

/// Bind a data listener with address reuse so back-to-back cases can reuse
/// the port while the previous case's sockets sit in TIME_WAIT.
fn bind_listener(addr: SocketAddr, socket_buffer_size: Option<usize>) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if let Some(size) = socket_buffer_size {
        socket.set_recv_buffer_size(size)?;
        socket.set_send_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Opens the data-plane endpoint for a case. The seam lets callers swap in
/// their own transport setup.
#[async_trait]
pub trait DataPlane: Send + Sync {
    async fn open(&self, plan: &SessionPlan) -> Result<Endpoint, SessionError>;
}

/// TCP data plane following the pair's [`DataLayout`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDataPlane;

#[async_trait]
impl DataPlane for TcpDataPlane {
    async fn open(&self, plan: &SessionPlan) -> Result<Endpoint, SessionError> {
        let pair = &plan.pair;
        match (&pair.layout, plan.role) {
            (DataLayout::ReceiversBind { ports }, Role::Receiver) => {
                let port = ports.get(plan.slot).copied().ok_or_else(|| {
                    SessionError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("pair {} has no data port for slot {}", pair.pair_id, plan.slot),
                    ))
                })?;
                let addr = SocketAddr::new(plan.bind_ip, port);
                let listener = bind_listener(addr, plan.socket_buffer_size)
                    .map_err(|source| SessionError::SocketBind { port, source })?;
                debug!("Receiver listening on {}", addr);
                Ok(Endpoint::Listening { listener, peers: 1 })
            }
            (DataLayout::ReceiversBind { ports }, Role::Sender) => Ok(Endpoint::Dialing {
                targets: pair
                    .receivers
                    .iter()
                    .zip(ports)
                    .map(|(receiver, &port)| SocketAddr::new(receiver.address, port))
                    .collect(),
            }),
            (DataLayout::SenderBinds { port }, Role::Sender) => {
                let addr = SocketAddr::new(plan.bind_ip, *port);
                let listener = bind_listener(addr, plan.socket_buffer_size).map_err(|source| {
                    SessionError::SocketBind {
                        port: *port,
                        source,
                    }
                })?;
                debug!("Sender listening on {}", addr);
                Ok(Endpoint::Listening {
                    listener,
                    peers: pair.receivers.len(),
                })
            }
            (DataLayout::SenderBinds { port }, Role::Receiver) => Ok(Endpoint::Dialing {
                targets: vec![SocketAddr::new(pair.sender.address, *port)],
            }),
        }
    }
}
