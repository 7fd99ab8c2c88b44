//! Framed transport over one unreliable serial link.
//!
//! A [`FramedTransport`] runs three tokio tasks against a shared link:
//!
//! - **receive**: reads whatever bytes are available, classifies them into frames,
//!   expires stale partial frames and stale asks, and hands completed frames to the
//!   dispatch queue;
//! - **transmit**: sends one queued frame per tick, drops frames that waited too
//!   long, and for asks waits for a quiet receive side first;
//! - **dispatch**: runs response handlers off the receive path, so a slow or
//!   panicking handler never stalls reception.
//!
//! At most one ask is outstanding, so the next frame received after it is sent is
//! its answer. Lock order is link, then receive state. The receive task classifies
//! bytes while holding the link, so the transmit task's "nothing buffered" check
//! cannot race an in-flight read.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::framing::{Decoded, Frame, FrameDecoder, FramingConfig};
use super::link::{Link, LinkOpener};
use crate::error::AppResult;

/// Called with the answer to one ask.
pub type ResponseHandler = Box<dyn FnOnce(Frame) + Send + 'static>;

/// Called with frames nobody asked for.
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync + 'static>;

/// Timing knobs for a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportTiming {
    /// Bytes requested per read.
    pub read_batch: usize,
    /// How long one read may wait for bytes.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Partial frames older than this are discarded.
    #[serde(with = "humantime_serde")]
    pub packet_timeout: Duration,
    /// Minimum time between open attempts.
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Receive loop pause.
    #[serde(with = "humantime_serde")]
    pub rx_pause: Duration,
    /// Minimum time between two transmitted frames.
    #[serde(with = "humantime_serde")]
    pub tx_pause: Duration,
    /// Queued frames older than this are dropped.
    #[serde(with = "humantime_serde")]
    pub tx_timeout: Duration,
    /// Limit on waiting for a quiet link before an ask, and on the ask itself.
    #[serde(with = "humantime_serde")]
    pub ask_timeout: Duration,
    /// Limit on one write.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Dispatch backlog that triggers a warning.
    pub dispatch_backlog_warning: usize,
}

impl Default for TransportTiming {
    fn default() -> Self {
        Self {
            read_batch: 1024,
            read_timeout: Duration::from_millis(10),
            packet_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(5),
            rx_pause: Duration::from_millis(1),
            tx_pause: Duration::from_millis(50),
            tx_timeout: Duration::from_secs(20),
            ask_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(1),
            dispatch_backlog_warning: 100,
        }
    }
}

struct TxEntry {
    payload: Vec<u8>,
    queued_at: Instant,
    handler: Option<ResponseHandler>,
}

struct PendingAsk {
    handler: ResponseHandler,
    started: Instant,
}

struct RxState {
    decoder: FrameDecoder,
    ask: Option<PendingAsk>,
    last_rx: Instant,
}

impl RxState {
    fn reset(&mut self) {
        self.decoder.reset();
        self.ask = None;
        self.last_rx = Instant::now();
    }
}

struct Completed {
    handler: Option<ResponseHandler>,
    frame: Frame,
}

struct Shared {
    name: String,
    opener: Arc<dyn LinkOpener>,
    timing: TransportTiming,
    link: tokio::sync::Mutex<Option<Box<dyn Link>>>,
    connected: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    rx: Mutex<RxState>,
    tx: Mutex<VecDeque<TxEntry>>,
    completed: mpsc::UnboundedSender<Completed>,
    backlog: AtomicUsize,
    stop: watch::Sender<bool>,
}

/// One framed, self-reconnecting link.
pub struct FramedTransport {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FramedTransport {
    /// Start the receive, transmit and dispatch tasks. Must run inside a tokio runtime.
    ///
    /// The first connection attempt happens immediately on the receive task.
    pub fn spawn(
        opener: Arc<dyn LinkOpener>,
        framing: FramingConfig,
        timing: TransportTiming,
        on_frame: FrameHandler,
    ) -> AppResult<Self> {
        framing.validate()?;
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            name: opener.describe(),
            opener,
            timing,
            link: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            rx: Mutex::new(RxState {
                decoder: FrameDecoder::new(framing),
                ask: None,
                last_rx: Instant::now(),
            }),
            tx: Mutex::new(VecDeque::new()),
            completed: completed_tx,
            backlog: AtomicUsize::new(0),
            stop,
        });

        let tasks = vec![
            tokio::spawn(rx_loop(shared.clone())),
            tokio::spawn(tx_loop(shared.clone())),
            tokio::spawn(dispatch_loop(shared.clone(), completed_rx, on_frame)),
        ];
        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Port identity used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True while a link is open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Open the link if it is closed, subject to the reconnect rate limit.
    pub async fn connect(&self) -> bool {
        self.shared.connect().await
    }

    /// Queue one frame. With a handler, the frame is an ask and the handler receives
    /// the next frame that arrives after it is sent.
    pub fn send(&self, payload: impl Into<Vec<u8>>, handler: Option<ResponseHandler>) {
        self.send_batch(vec![(payload.into(), handler)]);
    }

    /// Queue several frames back to back with nothing interleaved.
    pub fn send_batch(&self, frames: Vec<(Vec<u8>, Option<ResponseHandler>)>) {
        let now = Instant::now();
        let mut queue = lock(&self.shared.tx);
        for (payload, handler) in frames {
            queue.push_back(TxEntry {
                payload,
                queued_at: now,
                handler,
            });
        }
    }

    /// Frames waiting to be sent.
    pub fn tx_queue_len(&self) -> usize {
        lock(&self.shared.tx).len()
    }

    /// True while an ask waits for its answer.
    pub fn ask_pending(&self) -> bool {
        self.shared.ask_pending()
    }

    /// Change the receive framing. Any partial frame and pending ask are dropped.
    pub fn set_framing(&self, framing: FramingConfig) -> AppResult<()> {
        framing.validate()?;
        let mut rx = lock(&self.shared.rx);
        rx.decoder.set_config(framing);
        rx.ask = None;
        Ok(())
    }

    /// Drop every queued frame.
    pub fn purge_tx(&self) {
        lock(&self.shared.tx).clear();
    }

    /// Drop any partial frame and pending ask.
    pub fn purge_rx(&self) {
        lock(&self.shared.rx).reset();
    }

    /// Drop both directions.
    pub fn purge(&self) {
        self.purge_tx();
        self.purge_rx();
    }

    /// Stop all tasks, wait for them, and close the link.
    pub async fn close(&self) {
        self.shared.stop.send_replace(true);
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(port = %self.shared.name, error = %e, "Transport task ended abnormally");
            }
        }
        *self.shared.link.lock().await = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        info!(port = %self.shared.name, "Transport closed");
    }
}

impl Drop for FramedTransport {
    fn drop(&mut self) {
        self.shared.stop.send_replace(true);
    }
}

impl Shared {
    fn running(&self) -> bool {
        !*self.stop.borrow()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ask_pending(&self) -> bool {
        lock(&self.rx).ask.is_some()
    }

    async fn connect(&self) -> bool {
        let mut guard = self.link.lock().await;
        if guard.is_some() {
            return true;
        }
        {
            let mut last = lock(&self.last_attempt);
            if last.is_some_and(|t| t.elapsed() < self.timing.reconnect_interval) {
                return false;
            }
            *last = Some(Instant::now());
        }
        match self.opener.open().await {
            Ok(link) => {
                *guard = Some(link);
                lock(&self.rx).reset();
                self.connected.store(true, Ordering::SeqCst);
                info!(port = %self.name, "Link opened");
                true
            }
            Err(e) => {
                warn!(port = %self.name, error = %e, "Failed to open link");
                false
            }
        }
    }

    fn invalidate(&self, guard: &mut Option<Box<dyn Link>>, reason: &str) {
        *guard = None;
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.rx).reset();
        error!(port = %self.name, reason, "Link lost, will reconnect");
    }

    /// Classify received bytes. Called with the link lock held.
    fn ingest(&self, bytes: &[u8]) -> Vec<Completed> {
        trace!(port = %self.name, ?bytes, "Received bytes");
        let mut out = Vec::new();
        let mut rx = lock(&self.rx);
        rx.last_rx = Instant::now();
        for &byte in bytes {
            match rx.decoder.push(byte) {
                Decoded::Pending => {}
                Decoded::Frame(frame) => {
                    debug!(port = %self.name, ?frame, "Received frame");
                    let handler = rx.ask.take().map(|ask| ask.handler);
                    out.push(Completed { handler, frame });
                }
                Decoded::Undecodable(raw) => {
                    warn!(port = %self.name, ?raw, "Dropping frame that failed to decode");
                    rx.ask = None;
                }
                Decoded::Restarted(discarded) => {
                    error!(
                        port = %self.name,
                        ?discarded,
                        "Start marker inside a frame, discarding partial frame"
                    );
                    rx.ask = None;
                }
            }
        }
        out
    }

    fn expire_stale_rx(&self) {
        let mut rx = lock(&self.rx);
        if !rx.decoder.is_empty() && rx.last_rx.elapsed() > self.timing.packet_timeout {
            error!(
                port = %self.name,
                buffered = rx.decoder.buffered(),
                "Flushing stale incomplete frame"
            );
            rx.reset();
        }
        if rx
            .ask
            .as_ref()
            .is_some_and(|ask| ask.started.elapsed() > self.timing.ask_timeout)
        {
            warn!(port = %self.name, "Ask got no answer, clearing");
            rx.reset();
        }
    }

    fn evict_stale_tx(&self) {
        let limit = self.timing.tx_timeout;
        let mut queue = lock(&self.tx);
        let before = queue.len();
        queue.retain(|entry| entry.queued_at.elapsed() <= limit);
        let dropped = before - queue.len();
        if dropped > 0 {
            warn!(port = %self.name, dropped, "Dropped stale queued frames");
        }
    }

    async fn write_locked(&self, guard: &mut Option<Box<dyn Link>>, payload: &[u8]) {
        let wire = lock(&self.rx).decoder.config().encode(payload);
        let Some(link) = guard.as_mut() else {
            return;
        };
        let result = timeout(self.timing.write_timeout, link.write_all(&wire)).await;
        match result {
            Ok(Ok(())) => debug!(
                port = %self.name,
                payload = %String::from_utf8_lossy(payload),
                "Sent frame"
            ),
            Ok(Err(e)) => self.invalidate(guard, &e.to_string()),
            Err(_) => self.invalidate(guard, "write timed out"),
        }
    }

    async fn send_plain(&self, payload: &[u8]) {
        let mut guard = self.link.lock().await;
        if guard.is_none() {
            warn!(port = %self.name, "Dropping frame, link is down");
            return;
        }
        self.write_locked(&mut guard, payload).await;
    }

    /// Send an ask once nothing is buffered on either side of the link.
    async fn start_ask(&self, payload: &[u8], handler: ResponseHandler) {
        let deadline = Instant::now() + self.timing.ask_timeout;
        loop {
            let mut guard = self.link.lock().await;
            let idle = match guard.as_ref() {
                None => {
                    warn!(port = %self.name, "Dropping ask, link is down");
                    return;
                }
                Some(link) => link.bytes_waiting() == 0 && lock(&self.rx).decoder.is_empty(),
            };
            if idle {
                lock(&self.rx).ask = Some(PendingAsk {
                    handler,
                    started: Instant::now(),
                });
                self.write_locked(&mut guard, payload).await;
                return;
            }
            drop(guard);

            if Instant::now() >= deadline {
                error!(
                    port = %self.name,
                    payload = %String::from_utf8_lossy(payload),
                    "Ask failed, receive side never went quiet"
                );
                return;
            }
            sleep(self.timing.rx_pause).await;
            if !self.running() {
                return;
            }
        }
    }
}

async fn rx_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; shared.timing.read_batch.max(1)];
    while shared.running() {
        sleep(shared.timing.rx_pause).await;
        shared.expire_stale_rx();
        if !shared.is_connected() {
            shared.connect().await;
            continue;
        }

        let mut guard = shared.link.lock().await;
        let read = match guard.as_mut() {
            Some(link) => timeout(shared.timing.read_timeout, link.read(&mut buf)).await,
            None => continue,
        };
        let n = match read {
            Err(_) => continue,
            Ok(Ok(0)) => {
                shared.invalidate(&mut guard, "end of stream");
                continue;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                shared.invalidate(&mut guard, &e.to_string());
                continue;
            }
        };
        let completed = shared.ingest(&buf[..n]);
        drop(guard);

        for item in completed {
            shared.backlog.fetch_add(1, Ordering::SeqCst);
            if shared.completed.send(item).is_err() {
                return;
            }
        }
    }
}

async fn tx_loop(shared: Arc<Shared>) {
    while shared.running() {
        sleep(shared.timing.tx_pause).await;
        shared.evict_stale_tx();
        if !shared.is_connected() {
            shared.connect().await;
            continue;
        }

        let Some(entry) = lock(&shared.tx).pop_front() else {
            continue;
        };
        while shared.ask_pending() {
            sleep(shared.timing.rx_pause).await;
            if !shared.running() {
                return;
            }
        }
        match entry.handler {
            Some(handler) => shared.start_ask(&entry.payload, handler).await,
            None => shared.send_plain(&entry.payload).await,
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut completed: mpsc::UnboundedReceiver<Completed>,
    on_frame: FrameHandler,
) {
    let mut stop = shared.stop.subscribe();
    loop {
        if !shared.running() {
            return;
        }
        let item = tokio::select! {
            _ = stop.changed() => continue,
            item = completed.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };

        let pending = shared
            .backlog
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        if pending > shared.timing.dispatch_backlog_warning {
            warn!(port = %shared.name, pending, "Response handlers are falling behind");
        }

        let Completed { handler, frame } = item;
        let outcome = catch_unwind(AssertUnwindSafe(|| match handler {
            Some(handler) => handler(frame),
            None => on_frame(frame),
        }));
        if outcome.is_err() {
            error!(port = %shared.name, "Frame handler panicked");
        }
    }
}

/// Wrap a payload as `end + payload + end`.
///
/// The leading marker terminates whatever partial frame the receiver may hold, so
/// the payload itself always arrives as a clean frame.
pub fn delimited_packet(payload: &[u8], end: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2 * end.len());
    out.extend_from_slice(end);
    out.extend_from_slice(payload);
    out.extend_from_slice(end);
    out
}
