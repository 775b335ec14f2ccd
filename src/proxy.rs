//! Client proxy facade bound to one service name.
//!
//! A [`ServiceProxy`] talks to the router over its own client connection
//! and makes the target look like a local object: property reads and
//! writes become get/set-property requests, command access returns a
//! callable handle issuing execute-command, and stream access opens a
//! handle to the shared telemetry primitive.
//!
//! Capabilities live in three disjoint namespaces (properties, commands,
//! datastreams). Each namespace is queried from the target exactly once,
//! on first unresolved lookup, and cached for the proxy's lifetime.
//!
//! ## Rules
//! - A request blocks up to the fixed receive timeout; on expiry the proxy
//!   drops its connection, reconnects on the next call, and raises
//!   [`ProxyError::Timeout`].
//! - Commands and streams reject assignment.
//! - One in-flight request per proxy; replies correlate by reply type, and
//!   a mismatch is an error, never silently accepted.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::datastream::DataStream;
use crate::error::ProxyError;
use crate::protocol::{Frame, FrameCodec, MessageKind, Reply, Request, Source};

/// How a name resolves on the target service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Property,
    Command,
    Stream,
}

/// Request/reply client connection to the router, with reconnect.
struct RouterClient {
    addr: String,
    timeout: Duration,
    framed: Option<Framed<TcpStream, FrameCodec>>,
}

impl RouterClient {
    fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            framed: None,
        }
    }

    async fn connected(&mut self) -> Result<&mut Framed<TcpStream, FrameCodec>, ProxyError> {
        if self.framed.is_none() {
            let stream = TcpStream::connect(&self.addr).await?;
            self.framed = Some(Framed::new(stream, FrameCodec));
        }
        Ok(self.framed.as_mut().expect("just connected"))
    }

    /// One request/reply exchange. A timeout poisons the connection so the
    /// next call reconnects; a stale reply cannot be mistaken for a fresh
    /// one.
    async fn request(&mut self, service: &str, request: Request) -> Result<Reply, ProxyError> {
        let timeout = self.timeout;
        let expected = request.request_type.clone();
        let framed = self.connected().await?;

        let frame = Frame::new(
            Source::Client,
            service,
            MessageKind::Request,
            request.to_bytes(),
        );
        framed.send(frame).await?;

        let received = tokio::time::timeout(timeout, framed.next()).await;
        let frame = match received {
            Err(_) => {
                self.framed = None;
                return Err(ProxyError::Timeout { timeout });
            }
            Ok(None) => {
                self.framed = None;
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "router closed the connection",
                )));
            }
            Ok(Some(result)) => result?,
        };

        let reply = Reply::from_bytes(frame.payload())
            .map_err(|e| ProxyError::Io(std::io::Error::from(e)))?;
        if reply.reply_type != expected {
            return Err(ProxyError::MismatchedReply {
                expected,
                got: reply.reply_type,
            });
        }
        if !reply.is_ok() {
            return Err(ProxyError::ErrorReply {
                description: reply.description,
            });
        }
        Ok(reply)
    }
}

/// Cached names of one capability namespace, fetched at most once.
struct Namespace {
    request_type: &'static str,
    names: Option<BTreeSet<String>>,
}

impl Namespace {
    fn new(request_type: &'static str) -> Self {
        Self {
            request_type,
            names: None,
        }
    }

    async fn contains(
        &mut self,
        client: &mut RouterClient,
        service: &str,
        name: &str,
    ) -> Result<bool, ProxyError> {
        if self.names.is_none() {
            let reply = client
                .request(service, Request::new(self.request_type, Value::Null))
                .await?;
            let names = reply
                .data
                .as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            self.names = Some(names);
        }
        Ok(self.names.as_ref().expect("just fetched").contains(name))
    }
}

/// Facade over one remote service.
pub struct ServiceProxy {
    service: String,
    client: RouterClient,
    properties: Namespace,
    commands: Namespace,
    streams: Namespace,
}

impl ServiceProxy {
    /// Binds a proxy to `service`, talking to the router at `router_addr`.
    /// No connection is made until the first request.
    pub fn bind(
        service: impl Into<String>,
        router_addr: impl Into<String>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            client: RouterClient::new(router_addr, receive_timeout),
            properties: Namespace::new("all_properties"),
            commands: Namespace::new("all_commands"),
            streams: Namespace::new("all_datastreams"),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Resolves a name against the three namespaces, fetching each at most
    /// once. Properties win lookups, then commands, then streams.
    pub async fn resolve(&mut self, name: &str) -> Result<Capability, ProxyError> {
        if self
            .properties
            .contains(&mut self.client, &self.service, name)
            .await?
        {
            return Ok(Capability::Property);
        }
        if self
            .commands
            .contains(&mut self.client, &self.service, name)
            .await?
        {
            return Ok(Capability::Command);
        }
        if self
            .streams
            .contains(&mut self.client, &self.service, name)
            .await?
        {
            return Ok(Capability::Stream);
        }
        Err(ProxyError::UnknownCapability {
            name: name.to_string(),
        })
    }

    /// Reads a property value.
    pub async fn get_property(&mut self, name: &str) -> Result<Value, ProxyError> {
        let reply = self
            .client
            .request(
                &self.service,
                Request::new("get_property", json!({ "property_name": name })),
            )
            .await?;
        Ok(reply.data)
    }

    /// Writes a property value. Resolution happens first: assigning to a
    /// command or stream name is rejected without touching the wire twice.
    pub async fn set_property(&mut self, name: &str, value: Value) -> Result<(), ProxyError> {
        match self.resolve(name).await? {
            Capability::Property => {}
            Capability::Command => {
                return Err(ProxyError::NotAssignable {
                    name: name.to_string(),
                    kind: "command",
                })
            }
            Capability::Stream => {
                return Err(ProxyError::NotAssignable {
                    name: name.to_string(),
                    kind: "stream",
                })
            }
        }
        self.client
            .request(
                &self.service,
                Request::new(
                    "set_property",
                    json!({ "property_name": name, "value": value }),
                ),
            )
            .await?;
        Ok(())
    }

    /// Returns a callable handle for a command name.
    pub async fn command(&mut self, name: &str) -> Result<CommandHandle<'_>, ProxyError> {
        match self.resolve(name).await? {
            Capability::Command => Ok(CommandHandle {
                proxy: self,
                name: name.to_string(),
            }),
            _ => Err(ProxyError::UnknownCapability {
                name: name.to_string(),
            }),
        }
    }

    /// Opens a handle to a named data stream exposed by the service.
    pub async fn stream(&mut self, name: &str) -> Result<DataStream, ProxyError> {
        match self.resolve(name).await? {
            // The in-process stand-in attaches by qualified name.
            Capability::Stream => Ok(DataStream::create(
                format!("{}.{}", self.service, name),
                64,
            )),
            _ => Err(ProxyError::UnknownCapability {
                name: name.to_string(),
            }),
        }
    }

    async fn execute(&mut self, command: &str, arguments: Value) -> Result<Value, ProxyError> {
        let reply = self
            .client
            .request(
                &self.service,
                Request::new(
                    "execute_command",
                    json!({ "command_name": command, "arguments": arguments }),
                ),
            )
            .await?;
        Ok(reply.data)
    }
}

/// A resolved command, callable with keyword arguments.
pub struct CommandHandle<'a> {
    proxy: &'a mut ServiceProxy,
    name: String,
}

impl CommandHandle<'_> {
    /// Issues the execute-command request. `arguments` is a JSON object of
    /// keyword arguments.
    pub async fn call(&mut self, arguments: Value) -> Result<Value, ProxyError> {
        self.proxy.execute(&self.name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    /// Stands in for the router plus one service: answers enumeration
    /// requests, serves a property store, and counts requests by type.
    struct FakeEndpoint {
        addr: std::net::SocketAddr,
        counts: Arc<CountsByType>,
        token: CancellationToken,
    }

    #[derive(Default)]
    struct CountsByType {
        all_properties: AtomicUsize,
        all_commands: AtomicUsize,
        all_datastreams: AtomicUsize,
    }

    impl FakeEndpoint {
        async fn spawn() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let counts = Arc::new(CountsByType::default());
            let token = CancellationToken::new();
            let served = counts.clone();
            let stop = token.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = stop.cancelled() => return,
                        accepted = listener.accept() => accepted,
                    };
                    let Ok((stream, _)) = accepted else { return };
                    tokio::spawn(serve(stream, served.clone()));
                }
            });
            Self {
                addr,
                counts,
                token,
            }
        }

        fn proxy(&self, service: &str) -> ServiceProxy {
            ServiceProxy::bind(service, self.addr.to_string(), Duration::from_secs(2))
        }
    }

    impl Drop for FakeEndpoint {
        fn drop(&mut self) {
            self.token.cancel();
        }
    }

    async fn serve(stream: TcpStream, counts: Arc<CountsByType>) {
        let mut framed = Framed::new(stream, FrameCodec);
        let mut store: HashMap<String, Value> = HashMap::new();
        while let Some(Ok(frame)) = framed.next().await {
            let request = Request::from_bytes(frame.payload()).unwrap();
            let rt = request.request_type.as_str();
            let reply = match rt {
                "all_properties" => {
                    counts.all_properties.fetch_add(1, Ordering::SeqCst);
                    Reply::ok(rt, json!(["gain", "exposure"]))
                }
                "all_commands" => {
                    counts.all_commands.fetch_add(1, Ordering::SeqCst);
                    Reply::ok(rt, json!(["capture"]))
                }
                "all_datastreams" => {
                    counts.all_datastreams.fetch_add(1, Ordering::SeqCst);
                    Reply::ok(rt, json!(["frames"]))
                }
                "get_property" => {
                    let name = request.data["property_name"].as_str().unwrap();
                    Reply::ok(rt, store.get(name).cloned().unwrap_or(Value::Null))
                }
                "set_property" => {
                    let name = request.data["property_name"].as_str().unwrap();
                    store.insert(name.to_string(), request.data["value"].clone());
                    Reply::ok(rt, Value::Null)
                }
                "execute_command" => Reply::ok(
                    rt,
                    json!({ "echo": request.data["arguments"].clone() }),
                ),
                "slow" => continue,
                other => Reply::error(other, format!("unknown request type '{other}'")),
            };
            let out = Frame::new(
                Source::Service,
                frame.service.clone(),
                MessageKind::Reply,
                reply.to_bytes(),
            );
            if framed.send(out).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_the_store() {
        let endpoint = FakeEndpoint::spawn().await;
        let mut proxy = endpoint.proxy("camera");

        proxy.set_property("gain", json!(12)).await.unwrap();
        assert_eq!(proxy.get_property("gain").await.unwrap(), json!(12));
    }

    #[tokio::test]
    async fn each_namespace_is_fetched_exactly_once() {
        let endpoint = FakeEndpoint::spawn().await;
        let mut proxy = endpoint.proxy("camera");

        assert_eq!(proxy.resolve("gain").await.unwrap(), Capability::Property);
        assert_eq!(proxy.resolve("capture").await.unwrap(), Capability::Command);
        assert_eq!(proxy.resolve("frames").await.unwrap(), Capability::Stream);
        assert_eq!(proxy.resolve("exposure").await.unwrap(), Capability::Property);
        let err = proxy.resolve("missing").await.unwrap_err();
        assert_eq!(err.as_label(), "proxy_unknown_capability");

        assert_eq!(endpoint.counts.all_properties.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.counts.all_commands.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.counts.all_datastreams.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commands_and_streams_reject_assignment() {
        let endpoint = FakeEndpoint::spawn().await;
        let mut proxy = endpoint.proxy("camera");

        let err = proxy.set_property("capture", json!(1)).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::NotAssignable { kind: "command", .. }
        ));
        let err = proxy.set_property("frames", json!(1)).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::NotAssignable { kind: "stream", .. }
        ));
    }

    #[tokio::test]
    async fn command_handle_calls_with_keyword_arguments() {
        let endpoint = FakeEndpoint::spawn().await;
        let mut proxy = endpoint.proxy("camera");

        let mut capture = proxy.command("capture").await.unwrap();
        let result = capture.call(json!({ "frames": 3 })).await.unwrap();
        assert_eq!(result["echo"]["frames"], json!(3));
    }

    #[tokio::test]
    async fn silent_endpoint_times_out_and_the_proxy_recovers() {
        let endpoint = FakeEndpoint::spawn().await;
        let mut proxy = ServiceProxy::bind(
            "camera",
            endpoint.addr.to_string(),
            Duration::from_millis(100),
        );

        let err = proxy
            .client
            .request("camera", Request::new("slow", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout { .. }));

        // The proxy reconnects and the next request is served normally.
        assert_eq!(proxy.get_property("gain").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn error_replies_surface_their_description() {
        let endpoint = FakeEndpoint::spawn().await;
        let mut proxy = endpoint.proxy("camera");

        let err = proxy
            .client
            .request("camera", Request::new("no_such_type", Value::Null))
            .await
            .unwrap_err();
        let ProxyError::ErrorReply { description } = err else {
            panic!("expected an error reply");
        };
        assert!(description.contains("no_such_type"));
    }
}
