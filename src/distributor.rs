//! Fan-in/fan-out telemetry relay.
//!
//! One [`Distributor`] per telemetry class. Producers connect to the
//! collector endpoint, consumers connect to the publisher endpoint, and
//! every message is republished verbatim across a broadcast channel:
//!
//! ```text
//! producer ──┐                         ┌──► consumer
//! producer ──┼──► collector ═ relay ═ publisher ──► consumer
//! producer ──┘                         └──► consumer
//! ```
//!
//! ## Rules
//! - Producers and consumers only ever learn the two addresses, never
//!   each other.
//! - Messages are length-delimited opaque blobs; the relay never parses
//!   them, except that the log-line class renders each one into the
//!   process log as it passes through.
//! - A slow consumer that falls behind the broadcast capacity skips the
//!   lagged messages and keeps receiving; it is never disconnected.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RouterError;

const RELAY_CAPACITY: usize = 1024;

/// What the relay carries; decides whether messages are also rendered
/// into the process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryClass {
    /// Service log lines; each message is echoed human-readably.
    Logs,
    /// Opaque trace/telemetry records; relayed without inspection.
    Traces,
}

impl TelemetryClass {
    fn as_label(self) -> &'static str {
        match self {
            TelemetryClass::Logs => "logs",
            TelemetryClass::Traces => "traces",
        }
    }
}

/// Many-producer/many-consumer relay over two TCP endpoints.
pub struct Distributor {
    class: TelemetryClass,
    collector: TcpListener,
    publisher: TcpListener,
    relay: broadcast::Sender<Bytes>,
}

impl Distributor {
    /// Binds both endpoints. Pass port 0 to let the OS pick; the bound
    /// addresses are readable before [`Distributor::spawn`].
    pub async fn bind(
        class: TelemetryClass,
        collector_addr: &str,
        publisher_addr: &str,
    ) -> Result<Self, RouterError> {
        let collector = TcpListener::bind(collector_addr)
            .await
            .map_err(|source| RouterError::Bind {
                endpoint: collector_addr.to_string(),
                source,
            })?;
        let publisher = TcpListener::bind(publisher_addr)
            .await
            .map_err(|source| RouterError::Bind {
                endpoint: publisher_addr.to_string(),
                source,
            })?;
        let (relay, _) = broadcast::channel(RELAY_CAPACITY);
        Ok(Self {
            class,
            collector,
            publisher,
            relay,
        })
    }

    pub fn collector_addr(&self) -> Option<SocketAddr> {
        self.collector.local_addr().ok()
    }

    pub fn publisher_addr(&self) -> Option<SocketAddr> {
        self.publisher.local_addr().ok()
    }

    /// Runs both accept loops until cancellation. Per-connection failures
    /// drop that connection only.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        let Self {
            class,
            collector,
            publisher,
            relay,
        } = self;
        tokio::spawn(async move {
            info!(class = class.as_label(), "distributor serving");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = collector.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!(class = class.as_label(), %addr, "producer connected");
                                tokio::spawn(collect(class, stream, relay.clone(), token.clone()));
                            }
                            Err(e) => warn!(class = class.as_label(), error = %e, "collector accept failed"),
                        }
                    }
                    accepted = publisher.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!(class = class.as_label(), %addr, "consumer connected");
                                tokio::spawn(publish(class, stream, relay.subscribe(), token.clone()));
                            }
                            Err(e) => warn!(class = class.as_label(), error = %e, "publisher accept failed"),
                        }
                    }
                }
            }
            info!(class = class.as_label(), "distributor stopped");
        })
    }
}

/// Drains one producer connection into the relay.
async fn collect(
    class: TelemetryClass,
    stream: TcpStream,
    relay: broadcast::Sender<Bytes>,
    token: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            next = frames.next() => {
                let msg = match next {
                    Some(Ok(msg)) => msg.freeze(),
                    Some(Err(e)) => {
                        warn!(class = class.as_label(), error = %e, "producer stream error");
                        return;
                    }
                    None => return,
                };
                if class == TelemetryClass::Logs {
                    info!(target: "service_log", "{}", String::from_utf8_lossy(&msg));
                }
                // No consumers connected is fine; the message is dropped.
                let _ = relay.send(msg);
            }
        }
    }
}

/// Feeds relayed messages to one consumer connection.
async fn publish(
    class: TelemetryClass,
    stream: TcpStream,
    mut rx: broadcast::Receiver<Bytes>,
    token: CancellationToken,
) {
    let mut sink = FramedWrite::new(stream, LengthDelimitedCodec::new());
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            received = rx.recv() => {
                match received {
                    Ok(msg) => {
                        if sink.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(class = class.as_label(), skipped, "slow consumer skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn producer(addr: SocketAddr) -> FramedWrite<TcpStream, LengthDelimitedCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        FramedWrite::new(stream, LengthDelimitedCodec::new())
    }

    async fn consumer(addr: SocketAddr) -> FramedRead<TcpStream, LengthDelimitedCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        FramedRead::new(stream, LengthDelimitedCodec::new())
    }

    async fn recv(
        frames: &mut FramedRead<TcpStream, LengthDelimitedCodec>,
    ) -> Bytes {
        tokio::time::timeout(std::time::Duration::from_secs(2), frames.next())
            .await
            .expect("timed out waiting for relayed message")
            .expect("stream ended")
            .expect("stream error")
            .freeze()
    }

    #[tokio::test]
    async fn messages_fan_out_to_every_consumer() {
        let dist = Distributor::bind(TelemetryClass::Traces, "127.0.0.1:0", "127.0.0.1:0")
            .await
            .unwrap();
        let collector = dist.collector_addr().unwrap();
        let publisher = dist.publisher_addr().unwrap();
        let token = CancellationToken::new();
        let handle = dist.spawn(token.clone());

        let mut a = consumer(publisher).await;
        let mut b = consumer(publisher).await;
        // Let both subscriptions attach before producing.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut tx = producer(collector).await;
        tx.send(Bytes::from_static(b"reading 1")).await.unwrap();
        tx.send(Bytes::from_static(b"reading 2")).await.unwrap();

        for frames in [&mut a, &mut b] {
            assert_eq!(recv(frames).await, Bytes::from_static(b"reading 1"));
            assert_eq!(recv(frames).await, Bytes::from_static(b"reading 2"));
        }

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn producers_are_merged_in_arrival_order_per_producer() {
        let dist = Distributor::bind(TelemetryClass::Logs, "127.0.0.1:0", "127.0.0.1:0")
            .await
            .unwrap();
        let collector = dist.collector_addr().unwrap();
        let publisher = dist.publisher_addr().unwrap();
        let token = CancellationToken::new();
        let handle = dist.spawn(token.clone());

        let mut rx = consumer(publisher).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut one = producer(collector).await;
        let mut two = producer(collector).await;
        one.send(Bytes::from_static(b"one/first")).await.unwrap();
        two.send(Bytes::from_static(b"two/first")).await.unwrap();
        one.send(Bytes::from_static(b"one/second")).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(recv(&mut rx).await);
        }
        let pos = |needle: &[u8]| seen.iter().position(|m| m == needle).expect("missing");
        assert!(pos(b"one/first") < pos(b"one/second"));
        assert_eq!(seen.len(), 3);

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn producer_disconnect_does_not_stop_the_relay() {
        let dist = Distributor::bind(TelemetryClass::Traces, "127.0.0.1:0", "127.0.0.1:0")
            .await
            .unwrap();
        let collector = dist.collector_addr().unwrap();
        let publisher = dist.publisher_addr().unwrap();
        let token = CancellationToken::new();
        let handle = dist.spawn(token.clone());

        let mut rx = consumer(publisher).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        {
            let mut short_lived = producer(collector).await;
            short_lived.send(Bytes::from_static(b"before")).await.unwrap();
        }
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"before"));

        let mut survivor = producer(collector).await;
        survivor.send(Bytes::from_static(b"after")).await.unwrap();
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"after"));

        token.cancel();
        let _ = handle.await;
    }
}
