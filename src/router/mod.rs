//! Request router: the supervisor's single-threaded message loop.
//!
//! One inbound mailbox, multiplexed by the explicit source tag on every
//! frame. Dispatch table keyed by (source, kind):
//!
//! ```text
//! CLIENT + REQUEST    → fleet handler (target == supervisor) or enqueue/forward
//! SERVICE + REGISTER  → adopt reference, record address/pid, send config slice
//! SERVICE + OPENED    → mark ready, flush the pending queue FIFO
//! SERVICE + HEARTBEAT → refresh the push-channel liveness timestamp
//! SERVICE + REPLY     → relay to the client identity carried in-band
//! ```
//!
//! ## Rules
//! - The loop is the one synchronization point for registry mutation from
//!   the message path: only this task dispatches.
//! - Per-message handling errors are caught, logged, and answered with an
//!   error reply when the request type is known; undecipherable payloads
//!   are dropped. The loop keeps serving either way.
//! - A closed inbound channel is a receive-level error and is fatal.
//! - Heartbeats and registration are handled in arrival order with
//!   requests, but never sit in a per-service pending queue.

mod fleet;
pub mod peers;

pub use fleet::Fleet;
pub use peers::{Inbound, PeerTable};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::datastream::DataStream;
use crate::error::{ProtocolError, RouterError};
use crate::events::{Bus, Event, EventKind};
use crate::protocol::messages::{Registration, Reply, Request};
use crate::protocol::{Frame, MessageKind, Source};
use crate::registry::{Identity, ServiceRegistry, ServiceState};

/// Central broker between clients, services, and the fleet handlers.
pub struct Router {
    cfg: Config,
    registry: Arc<ServiceRegistry>,
    bus: Bus,
    peers: Arc<PeerTable>,
    fleet: Fleet,
    inbound: mpsc::Receiver<Inbound>,
    /// The supervisor's own heartbeat, published every poll tick.
    heartbeat: DataStream,
}

impl Router {
    pub fn new(
        cfg: Config,
        registry: Arc<ServiceRegistry>,
        bus: Bus,
        peers: Arc<PeerTable>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Self {
        let fleet = Fleet::new(cfg.clone(), registry.clone(), bus.clone());
        let heartbeat = DataStream::create(format!("{}.heartbeat", cfg.supervisor_id), 16);
        Self {
            cfg,
            registry,
            bus,
            peers,
            fleet,
            inbound,
            heartbeat,
        }
    }

    /// The supervisor's own heartbeat stream.
    pub fn heartbeat_stream(&self) -> DataStream {
        self.heartbeat.open()
    }

    /// Receive loop. Blocks at most one poll tick per iteration; returns on
    /// cancellation, or with an error when the transport is gone.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), RouterError> {
        let mut tick = tokio::time::interval(self.cfg.poll_timeout);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    self.heartbeat.submit_value(1);
                }
                msg = self.inbound.recv() => {
                    let msg = msg.ok_or(RouterError::TransportClosed)?;
                    if let Err(e) = self.dispatch(msg) {
                        warn!(error = %e, label = e.as_label(), "message dropped");
                        self.bus.publish(
                            Event::now(EventKind::RouterError).with_reason(e.to_string()),
                        );
                    }
                }
            }
        }
    }

    /// Dispatches one inbound message. Errors returned here are
    /// per-message: the caller logs them and keeps serving.
    pub(crate) fn dispatch(&mut self, msg: Inbound) -> Result<(), ProtocolError> {
        let Inbound { identity, frame } = msg;
        match (frame.source, frame.kind) {
            (Source::Client, MessageKind::Request) => self.on_client_request(identity, frame),
            (Source::Service, MessageKind::Register) => self.on_register(identity, frame),
            (Source::Service, MessageKind::Opened) => self.on_opened(frame),
            (Source::Service, MessageKind::Heartbeat) => self.on_heartbeat(frame),
            (Source::Service, MessageKind::Reply) => self.on_reply(frame),
            (source, kind) => Err(ProtocolError::MalformedFrame {
                reason: format!("no dispatch entry for {source:?}+{kind:?}"),
            }),
        }
    }

    // ---- CLIENT + REQUEST ----

    fn on_client_request(
        &mut self,
        client: Identity,
        frame: Frame,
    ) -> Result<(), ProtocolError> {
        // Malformed JSON is logged and dropped; there is no request type to
        // mirror into an error reply.
        let request = Request::from_bytes(frame.payload())?;

        if frame.service == self.cfg.supervisor_id {
            let reply = self.fleet.handle(&request);
            self.reply_to(&client, &self.cfg.supervisor_id, &reply);
            return Ok(());
        }

        let Some(reference) = self.registry.get(&frame.service) else {
            let reply = Reply::error(
                &request.request_type,
                format!("unknown service '{}'", frame.service),
            );
            self.reply_to(&client, &frame.service, &reply);
            return Ok(());
        };

        // Never-started services answer immediately with an error rather
        // than queuing forever.
        if reference.state() == ServiceState::Closed {
            let err = ProtocolError::ServiceUnavailable {
                id: frame.service.clone(),
            };
            let reply = Reply::error(&request.request_type, err.as_description());
            self.reply_to(&client, &frame.service, &reply);
            return Ok(());
        }

        let payload = frame
            .payloads
            .first()
            .cloned()
            .unwrap_or_else(|| Bytes::from_static(b"{}"));
        if reference.is_open() {
            self.forward_to_service(&frame.service, client, payload);
        } else {
            // Held FIFO until OPENED; a crashed or unresponsive service
            // keeps its queue for recovery or explicit restart.
            reference.enqueue(client, payload);
        }
        Ok(())
    }

    /// Wraps a queued/forwarded request with the client identity in-band.
    fn forward_to_service(&self, service: &str, client: Identity, payload: Bytes) {
        let frame = Frame {
            source: Source::Client,
            service: service.to_string(),
            kind: MessageKind::Request,
            payloads: vec![client, payload],
        };
        if !self.peers.send_to_service(service, frame) {
            warn!(service, "forward dropped: service connection is gone");
        }
    }

    fn reply_to(&self, client: &Identity, service: &str, reply: &Reply) {
        let frame = Frame::new(
            Source::Service,
            service,
            MessageKind::Reply,
            reply.to_bytes(),
        );
        if !self.peers.send_to(client, frame) {
            // Client departed; its reply has nowhere to go.
            warn!(service, "reply dropped: client connection is gone");
        }
    }

    // ---- SERVICE + REGISTER ----

    fn on_register(&mut self, identity: Identity, frame: Frame) -> Result<(), ProtocolError> {
        let registration: Registration =
            serde_json::from_slice(frame.payload()).map_err(|e| {
                ProtocolError::MalformedPayload {
                    reason: e.to_string(),
                }
            })?;

        let Some(reference) = self.registry.get(&frame.service) else {
            return Err(ProtocolError::ServiceUnavailable {
                id: frame.service.clone(),
            });
        };

        self.peers.bind_service(reference.id(), identity);
        let host = registration.host.unwrap_or_else(|| self.cfg.host.clone());
        let port = registration
            .port
            .or_else(|| reference.assigned_port())
            .unwrap_or_default();
        reference.set_address(host, port);

        // A service we did not launch (externally started) still registers.
        if reference.state() == ServiceState::Closed {
            reference.set_state(ServiceState::Initializing);
        }
        reference.attach_heartbeat_stream(DataStream::create(
            format!("{}.heartbeat", reference.id()),
            16,
        ));
        reference.mark_heartbeat();

        let slice = self.cfg.service_slice(reference.id());
        let config_frame = Frame::new(
            Source::Service,
            self.cfg.supervisor_id.clone(),
            MessageKind::Configuration,
            serde_json::to_vec(&slice).unwrap_or_default(),
        );
        self.peers.send_to_service(reference.id(), config_frame);

        info!(service = reference.id(), pid = registration.pid, "service registered");
        self.bus.publish(
            Event::now(EventKind::ServiceRegistered).with_service(reference.id()),
        );
        Ok(())
    }

    // ---- SERVICE + OPENED ----

    fn on_opened(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let Some(reference) = self.registry.get(&frame.service) else {
            return Err(ProtocolError::ServiceUnavailable {
                id: frame.service.clone(),
            });
        };

        let pending = reference.mark_opened();
        let flushed = pending.len();
        for queued in pending {
            self.forward_to_service(reference.id(), queued.client, queued.payload);
        }

        info!(service = reference.id(), flushed, "service opened");
        self.bus
            .publish(Event::now(EventKind::ServiceOpened).with_service(reference.id()));
        Ok(())
    }

    // ---- SERVICE + HEARTBEAT ----

    fn on_heartbeat(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let Some(reference) = self.registry.get(&frame.service) else {
            return Err(ProtocolError::ServiceUnavailable {
                id: frame.service.clone(),
            });
        };

        // A heartbeat may carry a voluntary safety-fallback report.
        if frame.payload() == b"fail_safe" {
            if reference.set_state(ServiceState::FailSafe) {
                self.bus.publish(
                    Event::now(EventKind::ServiceFailSafe)
                        .with_service(reference.id())
                        .with_reason("service reported safety fallback"),
                );
            }
            return Ok(());
        }

        reference.mark_heartbeat();
        // Registration handshake + first heartbeat completes startup.
        if reference.state() == ServiceState::Initializing && reference.address().is_some() {
            reference.set_state(ServiceState::Running);
        }
        Ok(())
    }

    // ---- SERVICE + REPLY ----

    /// Relays a service reply to the client identity carried in-band; the
    /// supervisor keeps no correlation table.
    fn on_reply(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let [client, payload] = frame.payloads.as_slice() else {
            return Err(ProtocolError::MalformedFrame {
                reason: format!(
                    "reply relay needs [identity][payload], got {} parts",
                    frame.payloads.len()
                ),
            });
        };
        let out = Frame::new(
            Source::Service,
            frame.service.clone(),
            MessageKind::Reply,
            payload.clone(),
        );
        if !self.peers.send_to(client, out) {
            warn!(service = frame.service.as_str(), "reply dropped: client gone");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router_with(ids: &[&str]) -> (Router, Arc<PeerTable>) {
        let descriptors = ids
            .iter()
            .map(|id| crate::registry::ServiceDescriptor::new(*id, "sim"))
            .collect();
        let registry = Arc::new(ServiceRegistry::build(descriptors, None).unwrap());
        let peers = Arc::new(PeerTable::new());
        let (_tx, rx) = mpsc::channel(16);
        let router = Router::new(
            Config::default(),
            registry,
            Bus::new(64),
            peers.clone(),
            rx,
        );
        (router, peers)
    }

    fn attach_peer(peers: &PeerTable, name: &[u8]) -> (Identity, mpsc::UnboundedReceiver<Frame>) {
        let identity = Identity::copy_from_slice(name);
        let (tx, rx) = mpsc::unbounded_channel();
        peers.insert(identity.clone(), tx);
        (identity, rx)
    }

    fn client_request(identity: &Identity, service: &str, request: &Request) -> Inbound {
        Inbound {
            identity: identity.clone(),
            frame: Frame::new(
                Source::Client,
                service,
                MessageKind::Request,
                request.to_bytes(),
            ),
        }
    }

    fn register(router: &mut Router, peers: &PeerTable, service: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (identity, rx) = attach_peer(peers, format!("svc-{service}").as_bytes());
        let body = serde_json::to_vec(&json!({"pid": 7, "service_type": "sim"})).unwrap();
        router
            .dispatch(Inbound {
                identity,
                frame: Frame::new(Source::Service, service, MessageKind::Register, body),
            })
            .unwrap();
        rx
    }

    fn opened(router: &mut Router, service: &str) {
        router
            .dispatch(Inbound {
                identity: Identity::from_static(b"unused"),
                frame: Frame::bare(Source::Service, service, MessageKind::Opened),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn fleet_requests_are_answered_locally() {
        let (mut router, peers) = router_with(&[]);
        let (client, mut rx) = attach_peer(&peers, b"client-1");

        router
            .dispatch(client_request(
                &client,
                "supervisor",
                &Request::new("is_simulated", json!(null)),
            ))
            .unwrap();

        let frame = rx.try_recv().expect("reply frame");
        assert_eq!(frame.kind, MessageKind::Reply);
        let reply = Reply::from_bytes(frame.payload()).unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.data["is_simulated"], json!(false));
    }

    #[tokio::test]
    async fn never_started_service_gets_an_immediate_error() {
        let (mut router, peers) = router_with(&["camera"]);
        let (client, mut rx) = attach_peer(&peers, b"client-1");

        router
            .dispatch(client_request(
                &client,
                "camera",
                &Request::new("get_property", json!({"property_name": "gain"})),
            ))
            .unwrap();

        let reply = Reply::from_bytes(rx.try_recv().unwrap().payload()).unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.reply_type, "get_property");
        assert!(reply.description.contains("not running"));
    }

    #[tokio::test]
    async fn requests_before_opened_are_flushed_fifo() {
        let (mut router, peers) = router_with(&["camera"]);
        let camera = router.registry.get("camera").unwrap();
        camera.set_state(ServiceState::Initializing);
        let mut svc_rx = register(&mut router, &peers, "camera");
        // Drop the configuration frame sent at registration.
        let cfg_frame = svc_rx.try_recv().unwrap();
        assert_eq!(cfg_frame.kind, MessageKind::Configuration);

        let (client, _rx) = attach_peer(&peers, b"client-1");
        for name in ["first", "second", "third"] {
            router
                .dispatch(client_request(
                    &client,
                    "camera",
                    &Request::new("execute_command", json!({"command_name": name})),
                ))
                .unwrap();
        }
        assert_eq!(camera.pending_len(), 3);
        assert!(svc_rx.try_recv().is_err(), "nothing forwarded before OPENED");

        opened(&mut router, "camera");
        let mut seen = Vec::new();
        while let Ok(frame) = svc_rx.try_recv() {
            let req = Request::from_bytes(frame.payloads[1].as_ref()).unwrap();
            seen.push(req.data["command_name"].as_str().unwrap().to_string());
        }
        assert_eq!(seen, vec!["first", "second", "third"]);
        assert_eq!(camera.pending_len(), 0);
    }

    #[tokio::test]
    async fn service_that_never_opens_keeps_queuing() {
        let (mut router, peers) = router_with(&["camera"]);
        router
            .registry
            .get("camera")
            .unwrap()
            .set_state(ServiceState::Initializing);
        let _svc_rx = register(&mut router, &peers, "camera");
        let (client, mut client_rx) = attach_peer(&peers, b"client-1");

        for _ in 0..10 {
            router
                .dispatch(client_request(
                    &client,
                    "camera",
                    &Request::new("all_properties", json!(null)),
                ))
                .unwrap();
        }
        assert_eq!(router.registry.get("camera").unwrap().pending_len(), 10);
        assert!(client_rx.try_recv().is_err(), "no spurious error replies");
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_and_the_next_request_served() {
        let (mut router, peers) = router_with(&[]);
        let (client, mut rx) = attach_peer(&peers, b"client-1");

        let bad = Inbound {
            identity: client.clone(),
            frame: Frame::new(
                Source::Client,
                "supervisor",
                MessageKind::Request,
                &b"{broken"[..],
            ),
        };
        let err = router.dispatch(bad).unwrap_err();
        assert_eq!(err.as_label(), "protocol_malformed_payload");
        assert!(rx.try_recv().is_err(), "malformed body gets no reply");

        router
            .dispatch(client_request(
                &client,
                "supervisor",
                &Request::new("output_path", json!(null)),
            ))
            .unwrap();
        let reply = Reply::from_bytes(rx.try_recv().unwrap().payload()).unwrap();
        assert!(reply.is_ok());
    }

    #[tokio::test]
    async fn registration_then_heartbeat_reaches_running() {
        let (mut router, peers) = router_with(&["camera"]);
        let camera = router.registry.get("camera").unwrap();
        camera.set_state(ServiceState::Initializing);
        let _svc_rx = register(&mut router, &peers, "camera");
        assert_eq!(camera.state(), ServiceState::Initializing);

        router
            .dispatch(Inbound {
                identity: Identity::from_static(b"unused"),
                frame: Frame::bare(Source::Service, "camera", MessageKind::Heartbeat),
            })
            .unwrap();
        assert_eq!(camera.state(), ServiceState::Running);
        assert!(camera.freshest_heartbeat().is_some());
    }

    #[tokio::test]
    async fn replies_are_relayed_to_the_in_band_identity() {
        let (mut router, peers) = router_with(&["camera"]);
        let (client, mut client_rx) = attach_peer(&peers, b"client-1");
        let payload = Reply::ok("get_property", json!({"value": 3})).to_bytes();

        router
            .dispatch(Inbound {
                identity: Identity::from_static(b"svc-camera"),
                frame: Frame {
                    source: Source::Service,
                    service: "camera".into(),
                    kind: MessageKind::Reply,
                    payloads: vec![client.clone(), Bytes::from(payload)],
                },
            })
            .unwrap();

        let frame = client_rx.try_recv().expect("relayed reply");
        assert_eq!(frame.kind, MessageKind::Reply);
        let reply = Reply::from_bytes(frame.payload()).unwrap();
        assert_eq!(reply.data["value"], json!(3));
    }

    #[tokio::test]
    async fn fail_safe_report_moves_the_state_machine() {
        let (mut router, peers) = router_with(&["safety"]);
        let safety = router.registry.get("safety").unwrap();
        safety.set_state(ServiceState::Initializing);
        let _svc_rx = register(&mut router, &peers, "safety");

        router
            .dispatch(Inbound {
                identity: Identity::from_static(b"unused"),
                frame: Frame::new(
                    Source::Service,
                    "safety",
                    MessageKind::Heartbeat,
                    &b"fail_safe"[..],
                ),
            })
            .unwrap();
        assert_eq!(safety.state(), ServiceState::FailSafe);
    }
}
