//! Connection manager: owns the transport, runs the reconnect state machine in a
//! background task, decodes frames and hands messages to registered handlers.
//!
//! ```text
//! Connecting --ok--> Live --drop/error--> Reconnecting --ok--> Live
//!      |                                    |  retries exhausted
//!      +--fail--> Reconnecting              v
//!                                        Offline --probe--> Reconnecting (one attempt)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::error::{DecodeError, TransportError};
use crate::types::{decode_binary_frame, decode_frame, ConnectionState, StreamMessage};

/// A raw inbound frame before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// Opens the transport. Each call is one handshake attempt.
pub trait Connector: Send + 'static {
    fn connect(&mut self) -> impl Future<Output = Result<FrameStream, TransportError>> + Send;
}

pub type MessageHandler = Box<dyn FnMut(&StreamMessage) + Send + 'static>;
pub type StatusHandler = Box<dyn FnMut(ConnectionState) + Send + 'static>;
pub type DecodeErrorHandler = Box<dyn FnMut(u64) + Send + 'static>;

pub struct ConnectionManager<C: Connector> {
    connector: Option<C>,
    policy: ReconnectPolicy,
    status_tx: Option<watch::Sender<ConnectionState>>,
    status_rx: watch::Receiver<ConnectionState>,
    handlers: Vec<MessageHandler>,
    status_handlers: Vec<StatusHandler>,
    decode_error_handlers: Vec<DecodeErrorHandler>,
    decode_errors: Arc<AtomicU64>,
    task: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionState::Connecting);
        Self {
            connector: Some(connector),
            policy,
            status_tx: Some(status_tx),
            status_rx,
            handlers: Vec::new(),
            status_handlers: Vec::new(),
            decode_error_handlers: Vec::new(),
            decode_errors: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    /// Register a consumer of decoded messages. Handlers are handed to the
    /// driver on [`connect`](Self::connect); later registrations are ignored.
    pub fn on_message<F>(&mut self, handler: F)
    where
        F: FnMut(&StreamMessage) + Send + 'static,
    {
        if self.task.is_some() {
            warn!("on_message after connect; handler ignored");
            return;
        }
        self.handlers.push(Box::new(handler));
    }

    /// Register a consumer of status transitions. Unlike [`subscribe`](Self::subscribe)
    /// it sees every transition, interleaved in order with decoded messages.
    pub fn on_status<F>(&mut self, handler: F)
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        if self.task.is_some() {
            warn!("on_status after connect; handler ignored");
            return;
        }
        self.status_handlers.push(Box::new(handler));
    }

    /// Called with the running total each time a frame is dropped as malformed,
    /// in order with decoded messages.
    pub fn on_decode_error<F>(&mut self, handler: F)
    where
        F: FnMut(u64) + Send + 'static,
    {
        if self.task.is_some() {
            warn!("on_decode_error after connect; handler ignored");
            return;
        }
        self.decode_error_handlers.push(Box::new(handler));
    }

    pub fn status(&self) -> ConnectionState {
        *self.status_rx.borrow()
    }

    /// Status watcher. Slow readers may see only the latest of several quick
    /// transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.status_rx.clone()
    }

    /// Frames dropped because they could not be decoded.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Start the driver task. Must be called from within a tokio runtime.
    /// A second call is a no-op.
    pub fn connect(&mut self) {
        let (Some(connector), Some(status)) = (self.connector.take(), self.status_tx.take()) else {
            debug!("connect called twice; ignoring");
            return;
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            connector,
            policy: self.policy.clone(),
            status,
            handlers: std::mem::take(&mut self.handlers),
            status_handlers: std::mem::take(&mut self.status_handlers),
            decode_error_handlers: std::mem::take(&mut self.decode_error_handlers),
            decode_errors: self.decode_errors.clone(),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(driver.run());
        self.task = Some((shutdown_tx, handle));
    }

    /// Stop the driver, dropping the transport and any pending timer. No status
    /// transition is published after this returns.
    pub async fn close(&mut self) {
        if let Some((shutdown, handle)) = self.task.take() {
            let _ = shutdown.send(());
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!("connection driver ended abnormally: {err}");
                }
            }
            info!("connection closed");
        }
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        // Dropping the shutdown sender alone stops the driver at its next await;
        // abort releases it right away.
        if let Some((_, handle)) = self.task.take() {
            handle.abort();
        }
    }
}

enum Phase {
    Connecting,
    Live(FrameStream),
    Reconnecting { attempt: u32 },
    Offline,
}

struct Driver<C> {
    connector: C,
    policy: ReconnectPolicy,
    status: watch::Sender<ConnectionState>,
    handlers: Vec<MessageHandler>,
    status_handlers: Vec<StatusHandler>,
    decode_error_handlers: Vec<DecodeErrorHandler>,
    decode_errors: Arc<AtomicU64>,
    shutdown: oneshot::Receiver<()>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        let mut phase = Phase::Connecting;
        loop {
            phase = match phase {
                Phase::Connecting => {
                    self.publish(ConnectionState::Connecting);
                    match self.attempt().await {
                        None => return,
                        Some(Ok(stream)) => Phase::Live(stream),
                        Some(Err(err)) => {
                            warn!("initial connect failed: {err}");
                            Phase::Reconnecting { attempt: 0 }
                        }
                    }
                }
                Phase::Live(stream) => {
                    self.publish(ConnectionState::Live);
                    if !self.pump(stream).await {
                        return;
                    }
                    Phase::Reconnecting { attempt: 0 }
                }
                Phase::Reconnecting { attempt } => {
                    self.publish(ConnectionState::Reconnecting);
                    if attempt >= self.policy.retry_limit {
                        Phase::Offline
                    } else {
                        let delay = self.policy.backoff(attempt);
                        debug!("reconnect attempt {} in {:?}", attempt + 1, delay);
                        if self.wait(sleep(delay)).await.is_none() {
                            return;
                        }
                        match self.attempt().await {
                            None => return,
                            Some(Ok(stream)) => Phase::Live(stream),
                            Some(Err(err)) => {
                                warn!("reconnect attempt {} failed: {err}", attempt + 1);
                                Phase::Reconnecting {
                                    attempt: attempt + 1,
                                }
                            }
                        }
                    }
                }
                Phase::Offline => {
                    self.publish(ConnectionState::Offline);
                    if self.wait(sleep(self.policy.probe_interval)).await.is_none() {
                        return;
                    }
                    self.publish(ConnectionState::Reconnecting);
                    match self.attempt().await {
                        None => return,
                        Some(Ok(stream)) => Phase::Live(stream),
                        Some(Err(err)) => {
                            debug!("offline probe failed: {err}");
                            Phase::Offline
                        }
                    }
                }
            };
        }
    }

    async fn attempt(&mut self) -> Option<Result<FrameStream, TransportError>> {
        tokio::select! {
            biased;
            _ = &mut self.shutdown => None,
            res = self.connector.connect() => Some(res),
        }
    }

    // Races `fut` against shutdown; `None` means stop now.
    async fn wait<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = &mut self.shutdown => None,
            out = fut => Some(out),
        }
    }

    /// Read frames until the stream ends. Returns false on shutdown.
    async fn pump(&mut self, mut stream: FrameStream) -> bool {
        loop {
            let next = match self.wait(stream.next()).await {
                None => return false,
                Some(next) => next,
            };
            match next {
                Some(Ok(frame)) => self.dispatch(frame),
                Some(Err(err)) => {
                    warn!("transport error: {err}");
                    return true;
                }
                None => {
                    info!("transport closed by peer");
                    return true;
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match decode(&frame) {
            Ok(Some(msg)) => {
                for handler in self.handlers.iter_mut() {
                    handler(&msg);
                }
            }
            Ok(None) => debug!("ignoring frame of unknown type"),
            Err(err) => {
                let total = self.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("dropping malformed frame ({total} so far): {err}");
                for handler in self.decode_error_handlers.iter_mut() {
                    handler(total);
                }
            }
        }
    }

    fn publish(&mut self, next: ConnectionState) {
        let changed = self.status.send_if_modified(|cur| {
            if *cur == next {
                false
            } else {
                *cur = next;
                true
            }
        });
        if changed {
            info!("connection status: {next}");
            for handler in self.status_handlers.iter_mut() {
                handler(next);
            }
        }
    }
}

fn decode(frame: &Frame) -> Result<Option<StreamMessage>, DecodeError> {
    match frame {
        Frame::Text(text) => decode_frame(text),
        Frame::Binary(bytes) => decode_binary_frame(bytes),
    }
}
