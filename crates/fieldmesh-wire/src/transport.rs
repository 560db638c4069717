//! TCP channels: the inbound multiplexing listener and the outbound
//! point-to-point link to an upstream peer.
//!
//! Both sides feed every received frame, tagged with its [`Origin`], into one
//! queue drained by the owning endpoint's I/O loop. Writes go through a
//! per-connection queue drained by a dedicated writer task, so senders never
//! wait on the socket.

use crate::error::{WireError, WireResult};
use crate::frame::{read_frame, write_frame, Frame};
use crate::registry::{PeerLink, PeerRegistry};
use fieldmesh_types::UpstreamConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a new connection may take to announce its identity.
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames a connection's writer queue holds before new ones are dropped.
pub const LINK_QUEUE: usize = 1024;

/// Which channel a frame arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// The point-to-point channel to the upstream peer.
    Upstream,
    /// A connection on the multiplexing listener, by peer identity.
    Peer(String),
    /// Looped back by the endpoint itself.
    Local,
}

/// Queue of received frames consumed by an endpoint's I/O loop.
pub type InboundTx = mpsc::UnboundedSender<(Origin, Frame)>;

/// Bind the multiplexing listener and start accepting connections.
///
/// Each accepted connection must send an identity frame first; it is then
/// registered in `registry` under that id until it closes.
pub async fn listen(
    addr: SocketAddr,
    owner: &str,
    registry: PeerRegistry,
    inbound: InboundTx,
    shutdown: watch::Receiver<bool>,
) -> WireResult<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| WireError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let local_addr = listener.local_addr()?;
    info!(owner = %owner, addr = %local_addr, "Listening for peers");

    let owner = owner.to_string();
    let handle = tokio::spawn(accept_loop(listener, owner, registry, inbound, shutdown));
    Ok((local_addr, handle))
}

async fn accept_loop(
    listener: TcpListener,
    owner: String,
    registry: PeerRegistry,
    inbound: InboundTx,
    mut shutdown: watch::Receiver<bool>,
) {
    let next_conn = Arc::new(AtomicU64::new(1));
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(owner = %owner, peer_addr = %addr, "Accepted connection");
                    let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                    let registry = registry.clone();
                    let inbound = inbound.clone();
                    let shutdown = shutdown.clone();
                    let owner = owner.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_peer(stream, addr, conn, &owner, registry, inbound, shutdown).await
                        {
                            debug!(owner = %owner, peer_addr = %addr, error = %e, "Peer connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(owner = %owner, error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => {
                debug!(owner = %owner, "Accept loop: shutdown signal received");
                break;
            }
        }
    }
}

async fn handle_peer(
    stream: TcpStream,
    addr: SocketAddr,
    conn: u64,
    owner: &str,
    registry: PeerRegistry,
    inbound: InboundTx,
    mut shutdown: watch::Receiver<bool>,
) -> WireResult<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let hello = tokio::time::timeout(IDENTITY_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| WireError::Malformed("no identity frame".into()))??;
    let peer_id = hello.as_identity()?;

    let (tx, mut rx) = mpsc::channel::<Frame>(LINK_QUEUE);
    registry.add_peer(PeerLink {
        id: peer_id.clone(),
        address: addr,
        tx,
        connected_at: chrono::Utc::now(),
        conn,
    });
    info!(owner = %owner, peer = %peer_id, peer_addr = %addr, "Peer connected");

    let writer_peer = peer_id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!(peer = %writer_peer, error = %e, "Write to peer failed");
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            read = read_frame(&mut reader) => match read {
                Ok(frame) => {
                    if inbound.send((Origin::Peer(peer_id.clone()), frame)).is_err() {
                        break Ok(());
                    }
                }
                Err(WireError::ConnectionClosed) => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = shutdown.changed() => break Ok(()),
        }
    };

    registry.remove_peer(&peer_id, conn);
    write_task.abort();
    info!(owner = %owner, peer = %peer_id, "Peer disconnected");
    result
}

/// The point-to-point channel to an upstream peer.
#[derive(Debug)]
pub struct Upstream {
    id: String,
    tx: mpsc::Sender<Frame>,
}

impl Upstream {
    /// Id of the upstream peer.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a frame for the upstream peer. A full queue drops the frame.
    pub fn send(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(upstream = %self.id, queued = LINK_QUEUE, "Upstream write queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Connect to an upstream peer and announce `own_id`.
///
/// Returns the channel plus its reader and writer tasks.
pub async fn dial(
    own_id: &str,
    config: &UpstreamConfig,
    inbound: InboundTx,
    mut shutdown: watch::Receiver<bool>,
) -> WireResult<(Upstream, Vec<JoinHandle<()>>)> {
    let stream = TcpStream::connect(config.addr.as_str())
        .await
        .map_err(|source| WireError::Connect {
            addr: config.addr.clone(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    write_frame(&mut writer, &Frame::identity(own_id)).await?;
    info!(own = %own_id, upstream = %config.id, addr = %config.addr, "Connected upstream");

    let (tx, mut rx) = mpsc::channel::<Frame>(LINK_QUEUE);
    let upstream_id = config.id.clone();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!(upstream = %upstream_id, error = %e, "Write upstream failed");
                break;
            }
        }
    });

    let upstream_id = config.id.clone();
    let read_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                read = read_frame(&mut reader) => match read {
                    Ok(frame) => {
                        if inbound.send((Origin::Upstream, frame)).is_err() {
                            break;
                        }
                    }
                    Err(WireError::ConnectionClosed) => {
                        warn!(upstream = %upstream_id, "Upstream closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!(upstream = %upstream_id, error = %e, "Upstream read failed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    });

    let upstream = Upstream {
        id: config.id.clone(),
        tx,
    };
    Ok((upstream, vec![write_task, read_task]))
}
