//! # Upstream Session Client
//!
//! One WebSocket connection to the realtime provider. The socket itself lives in
//! a spawned task; everything it observes is reported back to the owning actor
//! as [`UpstreamNotice`] messages tagged with the connection id, so the
//! coordinator sees socket events in the same mailbox as browser events.
//!
//! ## Lifecycle:
//! 1. `connect()` spawns the task and returns a fresh [`ConnectionId`]
//! 2. The task reports `Ready` once the handshake completes
//! 3. The owner calls `mark_ready()` when it processes that notice; only then does `send()` forward frames
//! 4. `close()` sends a close frame, `abort()` just drops the socket
//!
//! There is no reconnect logic. A dropped socket is reported as `Closed`.

use super::protocol::UpstreamFrame;
use actix::prelude::*;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Process-wide so that ids are never reused across sessions of one client.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Absent,
    Connecting,
    Ready,
}

/// Where to connect and which extra headers to send on the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSignal {
    Ready,
    /// One raw text frame
    Message(String),
    /// Socket ended, with the close reason when the provider gave one
    Closed(Option<String>),
    Error(String),
}

#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct UpstreamNotice {
    pub connection: ConnectionId,
    pub signal: UpstreamSignal,
}

/// The coordinator's view of the upstream connection.
pub trait UpstreamLink {
    /// Starts connecting. Any previous connection is dropped.
    fn connect(&mut self, request: ConnectRequest) -> ConnectionId;

    fn mark_ready(&mut self);

    /// Returns false when the frame was not forwarded (no ready connection).
    fn send(&mut self, frame: &UpstreamFrame) -> bool;

    /// Graceful close.
    fn close(&mut self);

    /// Tear the socket down without telling the provider.
    fn abort(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
enum Outgoing {
    Frame(String),
    Close,
}

/// [`UpstreamLink`] over tokio-tungstenite.
pub struct RealtimeClient {
    notify: Recipient<UpstreamNotice>,
    outbound: Option<mpsc::UnboundedSender<Outgoing>>,
    state: LinkState,
}

impl RealtimeClient {
    pub fn new(notify: Recipient<UpstreamNotice>) -> Self {
        Self {
            notify,
            outbound: None,
            state: LinkState::Absent,
        }
    }
}

impl UpstreamLink for RealtimeClient {
    fn connect(&mut self, request: ConnectRequest) -> ConnectionId {
        self.abort();

        let connection = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.state = LinkState::Connecting;

        let notify = self.notify.clone();
        actix::spawn(run_connection(connection, request, rx, notify));
        connection
    }

    fn mark_ready(&mut self) {
        if self.state == LinkState::Connecting {
            self.state = LinkState::Ready;
        }
    }

    fn send(&mut self, frame: &UpstreamFrame) -> bool {
        if self.state != LinkState::Ready {
            return false;
        }
        let Some(outbound) = &self.outbound else {
            return false;
        };
        match frame.to_json() {
            Ok(text) => outbound.send(Outgoing::Frame(text)).is_ok(),
            Err(err) => {
                warn!("Failed to serialize {}: {}", frame.kind(), err);
                false
            }
        }
    }

    fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outgoing::Close);
        }
        self.state = LinkState::Absent;
    }

    fn abort(&mut self) {
        // Dropping the sender ends the socket task on its next poll.
        self.outbound = None;
        self.state = LinkState::Absent;
    }
}

/// Upgrade request with the caller's headers applied.
pub fn build_request(request: &ConnectRequest) -> Result<Request<()>, tungstenite::Error> {
    let mut http_request = request.url.as_str().into_client_request()?;
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(tungstenite::http::Error::from)?;
        let value = HeaderValue::from_str(value).map_err(tungstenite::http::Error::from)?;
        http_request.headers_mut().insert(name, value);
    }
    Ok(http_request)
}

async fn run_connection(
    connection: ConnectionId,
    request: ConnectRequest,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    notify: Recipient<UpstreamNotice>,
) {
    let report = |signal: UpstreamSignal| notify.do_send(UpstreamNotice { connection, signal });

    let stream = match build_request(&request) {
        Ok(http_request) => connect_async(http_request).await.map(|(stream, _)| stream),
        Err(err) => Err(err),
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            warn!(connection, "Realtime connect failed: {}", err);
            report(UpstreamSignal::Error(err.to_string()));
            report(UpstreamSignal::Closed(None));
            return;
        }
    };

    info!(connection, "Realtime connection established");
    report(UpstreamSignal::Ready);

    let (mut sink, mut source) = stream.split();
    let mut reason = None;

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => report(UpstreamSignal::Message(text)),
                Some(Ok(Message::Close(frame))) => {
                    reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    report(UpstreamSignal::Error(err.to_string()));
                    break;
                }
                None => break,
            },
            outgoing = outbound.recv() => match outgoing {
                Some(Outgoing::Frame(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        report(UpstreamSignal::Error(err.to_string()));
                        break;
                    }
                }
                Some(Outgoing::Close) => {
                    let _ = sink.close().await;
                    break;
                }
                None => {
                    debug!(connection, "Realtime connection aborted");
                    break;
                }
            },
        }
    }

    info!(connection, "Realtime connection closed");
    report(UpstreamSignal::Closed(reason));
}
