//! Relay transport.
//!
//! Maintains one websocket connection to the relay, forever. The connection
//! lifecycle is a loop: connect, pump frames both directions until the
//! socket drops, then wait out an exponential backoff (with jitter, so a
//! whole party reconnecting after a relay restart does not stampede) and try
//! again. Only [`RelayTransport::shutdown`] stops it.
//!
//! Sends are fire-and-forget: a send while disconnected is dropped with a
//! debug log, because the sync layer re-pushes complete state on reconnect
//! anyway. Incoming text frames are routed to channel handlers by their
//! `type` field; frames for channels nobody subscribed to are ignored.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Reconnect delay schedule: `base * 2^attempt`, capped, plus a random
/// jitter of up to a quarter of the computed delay.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the delay for the given attempt number.
    fn raw_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        self.base
            .saturating_mul(1u32 << shift)
            .min(self.cap)
    }

    /// Full delay including jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        let span = (raw.as_millis() as u64 / 4).max(1);
        raw + Duration::from_millis(rand::random::<u64>() % span)
    }
}

#[derive(Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
}

/// Read only the `type` field of a frame, for routing to channel handlers
/// without committing to a full parse.
pub fn peek_channel(raw: &str) -> Option<String> {
    serde_json::from_str::<Header>(raw).ok().map(|h| h.kind)
}

type FrameHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct HandlerRegistry {
    next_id: AtomicU64,
    by_channel: Mutex<HashMap<String, Vec<(u64, FrameHandler)>>>,
}

impl HandlerRegistry {
    fn dispatch(&self, channel: &str, raw: &str) {
        let handlers: Vec<FrameHandler> = {
            let map = self.by_channel.lock();
            match map.get(channel) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(raw);
        }
    }

    fn remove(&self, channel: &str, id: u64) {
        let mut map = self.by_channel.lock();
        if let Some(list) = map.get_mut(channel) {
            list.retain(|(hid, _)| *hid != id);
            if list.is_empty() {
                map.remove(channel);
            }
        }
    }
}

struct TransportInner {
    url: String,
    backoff: BackoffPolicy,
    handlers: HandlerRegistry,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    connected_tx: watch::Sender<bool>,
    started: AtomicBool,
    shutdown: AtomicBool,
    shutdown_signal: Notify,
}

/// Websocket client with automatic reconnection.
#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<TransportInner>,
}

impl RelayTransport {
    pub fn new(url: impl Into<String>, backoff: BackoffPolicy) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TransportInner {
                url: url.into(),
                backoff,
                handlers: HandlerRegistry::default(),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                connected_tx,
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                shutdown_signal: Notify::new(),
            }),
        }
    }

    /// Start the connection loop. Idempotent; subsequent calls do nothing.
    pub fn connect(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self
            .inner
            .outbound_rx
            .lock()
            .take()
            .expect("outbound receiver taken exactly once");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_loop(inner, rx).await;
        });
    }

    /// Queue a frame for delivery. Dropped with a debug log when the
    /// connection is down.
    pub fn send(&self, channel: &str, frame: String) {
        if !self.is_connected() {
            tracing::debug!(channel, "dropping send while disconnected");
            return;
        }
        if self.inner.outbound_tx.send(frame).is_err() {
            tracing::debug!(channel, "dropping send after shutdown");
        }
    }

    /// Register a handler for frames whose `type` field equals `channel`.
    /// The handler stays registered until the returned handle is dropped.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> TransportSubscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = self.inner.handlers.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .by_channel
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        TransportSubscription {
            inner: Arc::downgrade(&self.inner),
            channel: channel.to_string(),
            id,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Watch channel that flips on every connect and disconnect.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Stop reconnecting and close the connection. Terminal.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.shutdown_signal.notify_waiters();
    }
}

/// Live channel subscription. Unsubscribes on drop.
pub struct TransportSubscription {
    inner: Weak<TransportInner>,
    channel: String,
    id: u64,
}

impl TransportSubscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handlers.remove(&self.channel, self.id);
        }
    }
}

async fn run_loop(inner: Arc<TransportInner>, mut outbound_rx: mpsc::UnboundedReceiver<String>) {
    let mut attempt: u32 = 0;
    while !inner.shutdown.load(Ordering::SeqCst) {
        tracing::debug!(url = %inner.url, attempt, "connecting to relay");
        match connect_async(inner.url.as_str()).await {
            Ok((stream, _)) => {
                attempt = 0;
                tracing::info!(url = %inner.url, "connected to relay");
                let _ = inner.connected_tx.send(true);
                pump(&inner, stream, &mut outbound_rx).await;
                let _ = inner.connected_tx.send(false);
                // Frames queued while the socket was going down would
                // otherwise leak into the next session.
                while outbound_rx.try_recv().is_ok() {}
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!(url = %inner.url, "relay connection lost");
            }
            Err(err) => {
                tracing::warn!(url = %inner.url, error = %err, "relay connect failed");
            }
        }

        let delay = inner.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown_signal.notified() => break,
        }
    }
    let _ = inner.connected_tx.send(false);
    tracing::debug!("transport loop stopped");
}

async fn pump<S>(
    inner: &Arc<TransportInner>,
    stream: tokio_tungstenite::WebSocketStream<S>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            _ = inner.shutdown_signal.notified() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return;
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { return };
                if let Err(err) = sink.send(WsMessage::Text(frame.into())).await {
                    tracing::debug!(error = %err, "send failed, reconnecting");
                    return;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let raw = text.as_str();
                        match peek_channel(raw) {
                            Some(channel) => inner.handlers.dispatch(&channel, raw),
                            None => tracing::warn!("dropping frame with no channel header"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return,
                    Some(Ok(_)) => {} // binary/pong frames carry nothing for us
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "read failed, reconnecting");
                        return;
                    }
                }
            }
        }
    }
}
