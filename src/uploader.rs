//! Chunked uploader: streams one byte source over a dedicated WebSocket.
//!
//! Flow control is entirely server-paced. The client sends one block, then
//! waits for the server's next control message before sending another, so
//! there is never more than one unacknowledged block on the wire. Once every
//! byte has been sent the client issues `{"cmd":"Finish"}`; the reply to that
//! command carries the transfer's final outcome.
//!
//! All state transitions happen on a single driver task. Accessors and
//! `abort()` may be called from anywhere.

use std::ops::Range;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::UploadError;
use crate::protocol::reason::{CANCELLED, CLOSED_BY_SERVER, MALFORMED_REPLY};
use crate::protocol::{UploadCommand, UploadReply, DEFAULT_BLOCK_SIZE};
use crate::source::ByteSource;
use crate::url::BaseUrl;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type Observer = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    /// Waiting for the reply to a resume `Seek`.
    Seeking,
    /// A block is on the wire, waiting for its acknowledgement.
    Sending,
    /// `Finish` sent, waiting for the final outcome.
    Finishing,
    Done,
}

struct TransferState {
    size: u64,
    sent: u64,
    running: bool,
    error: Option<String>,
    phase: Phase,
}

struct Shared {
    state: Mutex<TransferState>,
    observers: Mutex<Vec<Observer>>,
    abort: Notify,
    done: watch::Sender<bool>,
}

impl Shared {
    /// Move to `Done` and fire the observers. Only the first call has any
    /// effect.
    fn terminate(&self, error: Option<String>) {
        {
            let mut st = self.state.lock();
            if st.phase == Phase::Done {
                return;
            }
            st.phase = Phase::Done;
            st.running = false;
            st.error = error;
        }
        let observers: Vec<Observer> = self.observers.lock().clone();
        for cb in observers {
            cb();
        }
        self.done.send_replace(true);
    }

    fn mark_open(&self, seeking: bool) -> bool {
        let mut st = self.state.lock();
        if st.phase != Phase::Connecting {
            return false;
        }
        st.running = true;
        st.phase = if seeking { Phase::Seeking } else { Phase::Sending };
        true
    }
}

/// Byte range of the next block, or `None` once everything has been sent.
pub(crate) fn next_block(sent: u64, size: u64, block_size: usize) -> Option<Range<u64>> {
    if sent >= size {
        return None;
    }
    Some(sent..size.min(sent.saturating_add(block_size as u64)))
}

pub struct Uploader {
    url: String,
    source: Mutex<Option<Box<dyn ByteSource>>>,
    block_size: usize,
    resume_from: Option<u64>,
    shared: Arc<Shared>,
}

impl Uploader {
    /// Prepare an upload of `source` to the given upload endpoint. No I/O
    /// happens until [`start`](Self::start).
    pub fn new<S: ByteSource + 'static>(source: S, url: impl Into<String>) -> Self {
        let size = source.len();
        let (done, _) = watch::channel(false);
        Self {
            url: url.into(),
            source: Mutex::new(Some(Box::new(source))),
            block_size: DEFAULT_BLOCK_SIZE,
            resume_from: None,
            shared: Arc::new(Shared {
                state: Mutex::new(TransferState {
                    size,
                    sent: 0,
                    running: false,
                    error: None,
                    phase: Phase::Idle,
                }),
                observers: Mutex::new(Vec::new()),
                abort: Notify::new(),
                done,
            }),
        }
    }

    /// Prepare an upload addressed by the server-assigned transfer id.
    pub fn for_transfer<S: ByteSource + 'static>(
        source: S,
        base: &BaseUrl,
        transfer_id: &str,
    ) -> Result<Self, UploadError> {
        let url = base
            .upload_url(transfer_id)
            .ok_or_else(|| UploadError::InvalidTransferId(transfer_id.to_string()))?;
        Ok(Self::new(source, url))
    }

    pub fn with_block_size(mut self, block_size: usize) -> Result<Self, UploadError> {
        if block_size == 0 {
            return Err(UploadError::InvalidBlockSize);
        }
        self.block_size = block_size;
        Ok(self)
    }

    /// Continue a partial upload: the server is asked to seek to `offset`
    /// before the first block is sent.
    pub fn resume_from(mut self, offset: u64) -> Result<Self, UploadError> {
        let size = self.size();
        if offset > size {
            return Err(UploadError::InvalidOffset { offset, size });
        }
        self.resume_from = Some(offset);
        Ok(self)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the upload socket and begin streaming on the current tokio
    /// runtime. Outside a runtime this fails without touching any state.
    pub fn start(&self) -> Result<(), UploadError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| UploadError::NoRuntime(e.to_string()))?;
        {
            let mut st = self.shared.state.lock();
            if st.phase != Phase::Idle {
                return Err(UploadError::AlreadyStarted);
            }
            st.phase = Phase::Connecting;
        }
        let source = self
            .source
            .lock()
            .take()
            .ok_or(UploadError::AlreadyStarted)?;
        let transfer = Transfer {
            url: self.url.clone(),
            size: source.len(),
            source,
            block_size: self.block_size,
            resume_from: self.resume_from,
            shared: Arc::clone(&self.shared),
        };
        info!(url = %self.url, size = transfer.size, "starting upload");
        handle.spawn(transfer.drive());
        Ok(())
    }

    /// Cancel the transfer. The socket is closed and observers fire with a
    /// "cancelled" error. Does nothing once the transfer has terminated.
    pub fn abort(&self) {
        let phase = self.shared.state.lock().phase;
        match phase {
            Phase::Done => {}
            Phase::Idle => {
                // Leave a permit in case start() slipped in after the read above.
                self.shared.abort.notify_one();
                self.shared.terminate(Some(CANCELLED.to_string()));
            }
            _ => self.shared.abort.notify_one(),
        }
    }

    /// Register a callback fired once, when the transfer terminates
    /// (success, server-reported error, abnormal close or abort).
    ///
    /// Callbacks run on the driver task and must not block.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.observers.lock().push(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Fraction of the source sent so far. A zero-byte source reports 1.0.
    pub fn percentage(&self) -> f64 {
        let st = self.shared.state.lock();
        if st.size == 0 {
            1.0
        } else {
            st.sent as f64 / st.size as f64
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.state.lock().sent
    }

    pub fn size(&self) -> u64 {
        self.shared.state.lock().size
    }

    pub fn error(&self) -> Option<String> {
        self.shared.state.lock().error.clone()
    }

    /// Wait until the transfer has terminated. Never returns for an upload
    /// that is neither started nor aborted.
    pub async fn wait(&self) -> Result<(), UploadError> {
        let mut rx = self.shared.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        match self.error() {
            Some(e) => Err(UploadError::Failed(e)),
            None => Ok(()),
        }
    }
}

enum Flow {
    Continue,
    Done(Option<String>),
}

struct Transfer {
    url: String,
    source: Box<dyn ByteSource>,
    size: u64,
    block_size: usize,
    resume_from: Option<u64>,
    shared: Arc<Shared>,
}

impl Transfer {
    async fn drive(mut self) {
        let shared = Arc::clone(&self.shared);
        let ws = tokio::select! {
            res = connect_async(self.url.as_str()) => match res {
                Ok((ws, _)) => ws,
                Err(e) => {
                    warn!(url = %self.url, "upload connect failed: {e}");
                    shared.terminate(Some(format!("failed to connect: {e}")));
                    return;
                }
            },
            _ = shared.abort.notified() => {
                info!(url = %self.url, "upload cancelled before connecting");
                shared.terminate(Some(CANCELLED.to_string()));
                return;
            }
        };
        let (mut sink, mut stream) = ws.split();
        if !shared.mark_open(self.resume_from.is_some()) {
            let _ = sink.close().await;
            return;
        }
        debug!(url = %self.url, "upload socket open");

        let first = match self.resume_from {
            Some(pos) => self.send_command(&mut sink, UploadCommand::Seek { pos }).await,
            None => self.advance(&mut sink).await,
        };
        if let Err(reason) = first {
            let _ = sink.close().await;
            shared.terminate(Some(reason));
            return;
        }

        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = shared.abort.notified() => {
                    info!(url = %self.url, "upload cancelled");
                    let _ = sink.close().await;
                    shared.terminate(Some(CANCELLED.to_string()));
                    return;
                }
            };
            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let outcome = match self.on_reply(&mut sink, text.as_str()).await {
                        Ok(Flow::Continue) => continue,
                        Ok(Flow::Done(err)) => err,
                        Err(reason) => Some(reason),
                    };
                    let _ = sink.close().await;
                    shared.terminate(outcome);
                    return;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    warn!(len = data.len(), "upload socket received data of unknown type; ignoring");
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = sink.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    error!(?frame, "upload socket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("upload socket error: {e}");
                    break;
                }
                None => {
                    error!("upload socket closed by server");
                    break;
                }
            }
        }
        let _ = sink.close().await;
        shared.terminate(Some(CLOSED_BY_SERVER.to_string()));
    }

    async fn on_reply(&mut self, sink: &mut WsSink, text: &str) -> Result<Flow, String> {
        let reply: UploadReply = serde_json::from_str(text).map_err(|e| {
            warn!("malformed control message {text:?}: {e}");
            MALFORMED_REPLY.to_string()
        })?;
        let (phase, sent) = {
            let st = self.shared.state.lock();
            (st.phase, st.sent)
        };
        match phase {
            Phase::Seeking => {
                if let Some(err) = reply.err {
                    return Err(format!("seek rejected: {err}"));
                }
                let pos = self.resume_from.unwrap_or(0);
                {
                    let mut st = self.shared.state.lock();
                    st.sent = pos;
                    st.phase = Phase::Sending;
                }
                debug!(pos, "resuming upload");
                self.advance(sink).await?;
                Ok(Flow::Continue)
            }
            Phase::Sending => {
                if let Some(err) = reply.err {
                    warn!(sent, "server rejected block: {err}");
                    return Err(err);
                }
                if reply.cur_pos != Some(sent) {
                    warn!(local = sent, remote = ?reply.cur_pos, "file position mismatch");
                }
                self.advance(sink).await?;
                Ok(Flow::Continue)
            }
            Phase::Finishing => {
                match &reply.err {
                    Some(err) => warn!(url = %self.url, "upload finished with error: {err}"),
                    None => info!(url = %self.url, bytes = sent, "upload finished"),
                }
                Ok(Flow::Done(reply.err))
            }
            Phase::Idle | Phase::Connecting | Phase::Done => Ok(Flow::Continue),
        }
    }

    /// Send the next block, or `Finish` once the whole source is on the wire.
    async fn advance(&mut self, sink: &mut WsSink) -> Result<(), String> {
        let sent = self.shared.state.lock().sent;
        let Some(range) = next_block(sent, self.size, self.block_size) else {
            self.send_command(sink, UploadCommand::Finish {}).await?;
            self.shared.state.lock().phase = Phase::Finishing;
            return Ok(());
        };

        let mut block = vec![0u8; (range.end - range.start) as usize];
        self.source
            .read_at(range.start, &mut block)
            .map_err(|e| format!("failed to read source: {e}"))?;
        sink.send(WsMessage::Binary(block.into())).await.map_err(|e| {
            error!("upload send failed: {e}");
            CLOSED_BY_SERVER.to_string()
        })?;
        self.shared.state.lock().sent = range.end;
        debug!(start = range.start, end = range.end, "block sent");
        Ok(())
    }

    async fn send_command(&mut self, sink: &mut WsSink, cmd: UploadCommand) -> Result<(), String> {
        let text = cmd.to_text().map_err(|e| format!("encode command: {e}"))?;
        sink.send(WsMessage::Text(text.into())).await.map_err(|e| {
            error!("upload send failed: {e}");
            CLOSED_BY_SERVER.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn block_lengths(size: u64, block: usize) -> Vec<u64> {
        let mut sent = 0;
        let mut out = Vec::new();
        while let Some(r) = next_block(sent, size, block) {
            out.push(r.end - r.start);
            sent = r.end;
        }
        out
    }

    #[test]
    fn blocks_cover_source_without_empty_tail() {
        assert_eq!(
            block_lengths(2_500_000, DEFAULT_BLOCK_SIZE),
            vec![1_048_576, 1_048_576, 402_848]
        );
        assert_eq!(block_lengths(2 * 1_048_576, DEFAULT_BLOCK_SIZE), vec![1_048_576, 1_048_576]);
        assert_eq!(block_lengths(1, DEFAULT_BLOCK_SIZE), vec![1]);
        assert!(block_lengths(0, DEFAULT_BLOCK_SIZE).is_empty());
        assert_eq!(block_lengths(10, 3), vec![3, 3, 3, 1]);
    }

    #[test]
    fn fresh_uploader_state() {
        let up = Uploader::new(vec![0u8; 10], "ws://127.0.0.1:1/api/uploads/x");
        assert!(!up.is_running());
        assert_eq!(up.phase(), Phase::Idle);
        assert_eq!(up.percentage(), 0.0);
        assert_eq!(up.error(), None);
        assert_eq!(up.size(), 10);

        let empty = Uploader::new(Vec::new(), "ws://127.0.0.1:1/api/uploads/x");
        assert_eq!(empty.percentage(), 1.0);
    }

    #[test]
    fn builder_validation() {
        assert!(matches!(
            Uploader::new(vec![0u8; 4], "ws://h:1/x").resume_from(5),
            Err(UploadError::InvalidOffset { offset: 5, size: 4 })
        ));
        assert!(Uploader::new(vec![0u8; 4], "ws://h:1/x").resume_from(4).is_ok());
        assert!(matches!(
            Uploader::new(vec![0u8; 4], "ws://h:1/x").with_block_size(0),
            Err(UploadError::InvalidBlockSize)
        ));
        let base = crate::url::parse_base_url("ws://h:1").unwrap();
        assert!(matches!(
            Uploader::for_transfer(vec![0u8; 4], &base, "../etc"),
            Err(UploadError::InvalidTransferId(_))
        ));
    }

    #[tokio::test]
    async fn abort_before_start_fires_once() {
        let up = Uploader::new(vec![0u8; 10], "ws://127.0.0.1:1/api/uploads/x");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        up.on_progress(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        up.abort();
        up.abort();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(up.error().as_deref(), Some(CANCELLED));
        assert!(!up.is_running());
        assert!(matches!(up.start(), Err(UploadError::AlreadyStarted)));
        assert!(matches!(up.wait().await, Err(UploadError::Failed(_))));
    }

    #[test]
    fn start_outside_a_runtime_changes_nothing() {
        let up = Uploader::new(vec![0u8; 10], "ws://127.0.0.1:1/api/uploads/x");
        assert!(matches!(up.start(), Err(UploadError::NoRuntime(_))));
        assert_eq!(up.phase(), Phase::Idle);
        assert!(!up.is_running());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            up.start().unwrap();
            assert!(up.wait().await.unwrap_err().to_string().contains("failed to connect"));
        });
    }

    #[tokio::test]
    async fn connect_failure_is_terminal() {
        let port = {
            let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };
        let up = Uploader::new(vec![1u8; 10], format!("ws://127.0.0.1:{}/api/uploads/x", port));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        up.on_progress(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        up.start().unwrap();
        assert!(matches!(up.start(), Err(UploadError::AlreadyStarted)));
        let err = up.wait().await.unwrap_err();
        assert!(err.to_string().contains("failed to connect"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(up.bytes_sent(), 0);
        assert!(!up.is_running());
    }
}
