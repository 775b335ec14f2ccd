//! Transport edge: peer connections, identities, and the single inbound
//! channel.
//!
//! Every accepted connection gets an opaque identity. A reader task decodes
//! frames and forwards them, tagged with that identity, into the router's
//! one inbound mpsc channel; a writer task drains a per-peer outbound queue.
//! The router thus sees `(identity, frame)` pairs on a single mailbox and
//! never touches sockets.
//!
//! ```text
//!                   ┌ reader ──► (identity, frame) ─┐
//! client ── TCP ────┤                               ├──► inbound mpsc ──► Router
//! service ── TCP ───┤ writer ◄── per-peer queue ◄───┘        (one)
//! ```
//!
//! ## Rules
//! - Identities are unique for the supervisor's lifetime and never reused.
//! - Sending to a departed peer is a silent no-op: the reply has nowhere to
//!   go, which is indistinguishable from a client that stopped listening.
//! - A service's identity is recorded at REGISTER so the supervisor can
//!   address it (configuration slices, forwarded requests, stop requests).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::messages::Request;
use crate::protocol::{Frame, FrameCodec, MessageKind, Source};
use crate::registry::Identity;
use crate::sequencer::StopRequester;

/// One decoded frame with the identity of the peer that sent it.
#[derive(Debug)]
pub struct Inbound {
    pub identity: Identity,
    pub frame: Frame,
}

/// Shared map of connected peers and registered service identities.
pub struct PeerTable {
    peers: Mutex<HashMap<Identity, mpsc::UnboundedSender<Frame>>>,
    services: Mutex<HashMap<String, Identity>>,
    next_peer: AtomicU64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        }
    }

    fn mint_identity(&self) -> Identity {
        let n = self.next_peer.fetch_add(1, Ordering::Relaxed);
        Identity::from(format!("peer-{n}").into_bytes())
    }

    /// Used by the accept loop; crate-visible so router tests can attach
    /// synthetic peers.
    pub(crate) fn insert(&self, identity: Identity, tx: mpsc::UnboundedSender<Frame>) {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .insert(identity, tx);
    }

    fn remove(&self, identity: &Identity) {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .remove(identity);
    }

    /// Queues a frame for one peer. Returns false if the peer is gone.
    pub fn send_to(&self, identity: &Identity, frame: Frame) -> bool {
        let peers = self.peers.lock().expect("peer table poisoned");
        match peers.get(identity) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Records which connection a registered service speaks on.
    pub fn bind_service(&self, id: &str, identity: Identity) {
        self.services
            .lock()
            .expect("peer table poisoned")
            .insert(id.to_string(), identity);
    }

    pub fn service_identity(&self, id: &str) -> Option<Identity> {
        self.services
            .lock()
            .expect("peer table poisoned")
            .get(id)
            .cloned()
    }

    /// Queues a frame for a registered service.
    pub fn send_to_service(&self, id: &str, frame: Frame) -> bool {
        match self.service_identity(id) {
            Some(identity) => self.send_to(&identity, frame),
            None => false,
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StopRequester for PeerTable {
    /// The cooperative stop is an ordinary request frame on the service's
    /// own connection.
    fn request_stop(&self, service: &str) {
        let request = Request::new("stop", serde_json::Value::Null);
        let frame = Frame::new(
            Source::Client,
            service,
            MessageKind::Request,
            request.to_bytes(),
        );
        if !self.send_to_service(service, frame) {
            debug!(service, "stop request had no connection to go to");
        }
    }
}

/// Accept loop: one reader + one writer task per connection, all feeding the
/// router's single inbound channel. Runs until cancellation.
pub async fn serve(
    listener: TcpListener,
    table: std::sync::Arc<PeerTable>,
    inbound: mpsc::Sender<Inbound>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "peer connected");
                    spawn_peer(stream, &table, inbound.clone(), token.clone());
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

fn spawn_peer(
    stream: TcpStream,
    table: &std::sync::Arc<PeerTable>,
    inbound: mpsc::Sender<Inbound>,
    token: CancellationToken,
) {
    let identity = table.mint_identity();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec);
    let mut writer = FramedWrite::new(write_half, FrameCodec);

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    table.insert(identity.clone(), tx);

    // Writer: drain the per-peer queue onto the socket.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Reader: tag decoded frames with the peer identity.
    let table = table.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = reader.next() => match next {
                    Some(Ok(frame)) => {
                        let msg = Inbound {
                            identity: identity.clone(),
                            frame,
                        };
                        if inbound.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // Undecodable stream: this peer is done, the router
                        // keeps serving everyone else.
                        warn!(error = %e, "dropping peer after codec error");
                        break;
                    }
                    None => break,
                }
            }
        }
        table.remove(&identity);
    });
}
