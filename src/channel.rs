//! Request channel: concurrent JSON calls multiplexed over one WebSocket.
//!
//! The server does not echo request ids, so correlation is positional: the
//! K-th text frame received after the socket opens answers the K-th request
//! sent on it. This holds only while the server replies to every request
//! exactly once and in order. If that ever stops being true the wire format
//! needs an id-tagged envelope; the queue below cannot detect the mismatch.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::error::ChannelError;
use crate::protocol::response_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    /// Terminal; only reached through `shutdown()`.
    Closed,
}

struct PendingCall {
    seq: u64,
    reply: oneshot::Sender<Result<Value, ChannelError>>,
}

enum Outbound {
    Text(String),
    Close,
}

struct Shared {
    state: ConnectionState,
    /// Present exactly while `state == Ready`.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    connect_waiters: Vec<oneshot::Sender<Result<(), ChannelError>>>,
    /// Outstanding calls in send order.
    pending: VecDeque<PendingCall>,
    next_send: u64,
    next_recv: u64,
    /// Bumped whenever a driver is spawned; a driver only tears down state
    /// it still owns.
    generation: u64,
}

impl Shared {
    fn settle_connect(&mut self, outcome: Result<(), ChannelError>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn fail_pending(&mut self, err: ChannelError) {
        for call in self.pending.drain(..) {
            let _ = call.reply.send(Err(err.clone()));
        }
    }

    /// Forget the current connection. Waiters and in-flight calls are
    /// rejected; a later `connect()` opens a fresh socket.
    fn disconnect(&mut self) {
        self.outbound = None;
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Ready) {
            self.state = ConnectionState::Disconnected;
        }
        self.settle_connect(Err(ChannelError::ConnectFailed(
            "connection task ended".into(),
        )));
        if !self.pending.is_empty() {
            warn!(lost = self.pending.len(), "failing in-flight requests after connection loss");
        }
        self.fail_pending(ChannelError::ConnectionLost);
    }
}

/// Resets the shared state when the driver exits, including when its task is
/// dropped along with the runtime that was polling it.
struct DriverGuard {
    shared: Arc<Mutex<Shared>>,
    generation: u64,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        let mut s = self.shared.lock();
        if s.generation == self.generation {
            s.disconnect();
        }
    }
}

pub struct RequestChannel {
    url: String,
    shared: Arc<Mutex<Shared>>,
}

impl RequestChannel {
    /// Create a channel for the given control endpoint. Nothing is opened
    /// until `connect()`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                outbound: None,
                connect_waiters: Vec::new(),
                pending: VecDeque::new(),
                next_send: 0,
                next_recv: 0,
                generation: 0,
            })),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Number of calls still waiting for their response.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Open the connection if it is not open yet.
    ///
    /// Concurrent callers share a single attempt and all observe its outcome.
    /// Once the channel is ready this returns immediately. Must be called
    /// from within a tokio runtime.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let rx = {
            let mut shared = self.shared.lock();
            match shared.state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closed => return Err(ChannelError::Shutdown),
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected => {
                    let handle = tokio::runtime::Handle::try_current()
                        .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
                    info!(url = %self.url, "connecting request channel");
                    shared.state = ConnectionState::Connecting;
                    shared.generation += 1;
                    let guard = DriverGuard {
                        shared: Arc::clone(&self.shared),
                        generation: shared.generation,
                    };
                    handle.spawn(drive(self.url.clone(), guard));
                }
            }
            let (tx, rx) = oneshot::channel();
            shared.connect_waiters.push(tx);
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(ChannelError::ConnectFailed("connection task ended".into())))
    }

    /// Send one request and wait for the response it is matched with.
    ///
    /// Fails with `NotConnected` without touching the transport unless the
    /// channel is ready. A response whose `err` field is non-null rejects the
    /// call with that error; otherwise the whole response object is returned.
    pub async fn execute<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Value, ChannelError> {
        let rx = {
            let mut shared = self.shared.lock();
            let outbound = match (&shared.state, &shared.outbound) {
                (ConnectionState::Ready, Some(tx)) => tx.clone(),
                _ => return Err(ChannelError::NotConnected),
            };
            let text = serde_json::to_string(payload)?;
            // Queue and register under the same lock so queue order is wire order.
            if outbound.send(Outbound::Text(text)).is_err() {
                // The driver is gone without having cleaned up.
                warn!(url = %self.url, "request channel driver vanished");
                shared.disconnect();
                return Err(ChannelError::NotConnected);
            }
            let seq = shared.next_send;
            shared.next_send += 1;
            let (tx, rx) = oneshot::channel();
            shared.pending.push_back(PendingCall { seq, reply: tx });
            debug!(seq, "request queued");
            rx
        };
        rx.await.unwrap_or(Err(ChannelError::ConnectionLost))
    }

    /// Typed wrapper over [`execute`](Self::execute).
    pub async fn call<Req, Resp>(&self, req: &Req) -> Result<Resp, ChannelError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let resp = self.execute(req).await?;
        serde_json::from_value(resp)
            .map_err(|e| ChannelError::Protocol(format!("decode response: {e}")))
    }

    /// Tear the channel down for good: every waiter and in-flight call is
    /// rejected and the socket is closed.
    pub fn shutdown(&self) {
        let mut shared = self.shared.lock();
        if shared.state == ConnectionState::Closed {
            return;
        }
        info!(url = %self.url, "shutting down request channel");
        shared.state = ConnectionState::Closed;
        if let Some(tx) = shared.outbound.take() {
            let _ = tx.send(Outbound::Close);
        }
        shared.settle_connect(Err(ChannelError::Shutdown));
        shared.fail_pending(ChannelError::Shutdown);
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drive(url: String, guard: DriverGuard) {
    let shared = &guard.shared;
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(%url, "request channel connect failed: {e}");
            let mut s = shared.lock();
            if s.state == ConnectionState::Connecting {
                s.state = ConnectionState::Disconnected;
            }
            s.settle_connect(Err(ChannelError::ConnectFailed(e.to_string())));
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let shut_down = {
        let mut s = shared.lock();
        if s.state == ConnectionState::Closed {
            true
        } else {
            s.state = ConnectionState::Ready;
            s.outbound = Some(tx);
            s.next_send = 0;
            s.next_recv = 0;
            s.settle_connect(Ok(()));
            false
        }
    };
    if shut_down {
        let _ = sink.close().await;
        return;
    }
    info!(%url, "request channel ready");

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        error!("request channel send failed: {e}");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => on_text(shared, text.as_str()),
                Some(Ok(WsMessage::Binary(data))) => {
                    warn!(len = data.len(), "request channel received non-text frame; ignoring");
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = sink.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "request channel closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("request channel transport error: {e}");
                    break;
                }
                None => {
                    info!("request channel stream ended");
                    break;
                }
            }
        }
    }
}

fn on_text(shared: &Mutex<Shared>, text: &str) {
    let parsed = serde_json::from_str::<Value>(text);
    let call = {
        let mut s = shared.lock();
        match s.pending.pop_front() {
            Some(call) => {
                debug_assert_eq!(call.seq, s.next_recv);
                s.next_recv += 1;
                call
            }
            None => {
                error!(
                    answered = s.next_recv,
                    "response without a pending request; dropping"
                );
                return;
            }
        }
    };

    let outcome = match parsed {
        Ok(resp) => match response_error(&resp) {
            Some(err) => {
                debug!(seq = call.seq, "request failed on server: {err}");
                Err(ChannelError::Remote(err))
            }
            None => Ok(resp),
        },
        Err(e) => {
            warn!(seq = call.seq, "malformed response: {e}");
            Err(ChannelError::Protocol(format!("malformed response: {e}")))
        }
    };
    if call.reply.send(outcome).is_err() {
        debug!(seq = call.seq, "caller went away before its response arrived");
    }
}

// ---

lazy_static::lazy_static! {
    static ref GLOBAL: Mutex<Option<Arc<RequestChannel>>> = Mutex::new(None);
}

/// Install the process-wide channel. The first call constructs it; later
/// calls return the existing instance and ignore `url`.
pub fn install(url: impl Into<String>) -> Arc<RequestChannel> {
    let mut global = GLOBAL.lock();
    if let Some(existing) = global.as_ref() {
        return Arc::clone(existing);
    }
    let channel = Arc::new(RequestChannel::new(url));
    *global = Some(Arc::clone(&channel));
    channel
}

pub fn global() -> Result<Arc<RequestChannel>, ChannelError> {
    GLOBAL.lock().as_ref().map(Arc::clone).ok_or(ChannelError::NotInstalled)
}

/// The process-wide channel, connected.
pub async fn ensure_connection() -> Result<Arc<RequestChannel>, ChannelError> {
    let channel = global()?;
    channel.connect().await?;
    Ok(channel)
}

/// Shut down and uninstall the process-wide channel.
pub fn shutdown_global() {
    let channel = GLOBAL.lock().take();
    if let Some(channel) = channel {
        channel.shutdown();
    }
}
