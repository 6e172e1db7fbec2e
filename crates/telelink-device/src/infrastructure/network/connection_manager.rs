//! One self-healing server connection.
//!
//! Architecture:
//! - `connect()` opens the [`transport`](super::transport) and spawns a
//!   receiver loop that owns the read half.
//! - The receiver decodes complete frames and forwards them on an `mpsc`
//!   queue to the dispatcher loop, which answers server requests through the
//!   [`MessageHandler`].
//! - `send()` seals, frames and writes a message under the connection lock,
//!   then waits on the [`ReliabilityTracker`] for the matching ACK outside it.
//! - `watchdog()` is ticked by the Device.  It restarts a dead dispatcher and
//!   reconnects when the link is down or silent for too long, as long as the
//!   caller still wants the connection (`keep_connected`).
//!
//! Connect, disconnect and every reconnect take the same connection lock, so
//! a user-initiated disconnect and a watchdog reconnect never interleave.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use telelink_core::protocol::codec::validate_inbound;
use telelink_core::protocol::payload::decode_setup;
use telelink_core::{
    encode_frame, CipherKind, CryptoBox, CryptoError, Frame, FrameError, Identity, MessageType,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

use super::reliability::ReliabilityTracker;
use super::transport::{self, ConnectPolicy, FrameReader, FrameWriter, TransportError};
use crate::application::ports::{Link, MessageHandler};

const INBOUND_QUEUE: usize = 64;

/// Why a single send failed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("transaction {0} is already pending")]
    DuplicateTransaction(u16),
    #[error("no ack for transaction {tid} within {timeout:?}")]
    NoAck { tid: u16, timeout: Duration },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Timing and retry knobs of a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// How long a tracked send waits for its ACK.
    pub ack_timeout: Duration,
    /// Silence after which the watchdog reconnects.
    pub keepalive_timeout: Duration,
    pub connect_attempts: u32,
    /// Linear backoff step between connect attempts.
    pub connect_backoff: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Receiver read poll interval.
    pub poll_interval: Duration,
    /// Upper bound on waiting for a stopped loop.
    pub join_timeout: Duration,
    pub cipher: CipherKind,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(60),
            connect_attempts: 3,
            connect_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
            cipher: CipherKind::Xtea,
        }
    }
}

struct ConnectionState {
    writer: Option<FrameWriter>,
    connected: bool,
    keep_connected: bool,
    last_sent_at: Option<Instant>,
}

#[derive(Default)]
struct Loops {
    receiver: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

/// Clears the `reconnecting` flag when dropped, including when the
/// reconnecting task is cancelled.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl<'a> ReconnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Connection to one server for one [`Identity`].
pub struct ConnectionManager {
    identity: Identity,
    settings: ConnectionSettings,
    crypto: CryptoBox,
    tracker: ReliabilityTracker,
    handler: Arc<dyn MessageHandler>,
    state: Mutex<ConnectionState>,
    // Stamped by the receiver; kept out of `state` so inbound frames never
    // wait on a write or a reconnect.
    last_received_at: StdMutex<Instant>,
    /// LOG_DATA payload frozen by this server's last LOG_PREPARE.
    log_snapshot: StdMutex<Option<Vec<u8>>>,
    loops: StdMutex<Loops>,
    inbound_tx: mpsc::Sender<Frame>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<Frame>>>,
    reconnecting: AtomicBool,
    reconnects: AtomicU64,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        identity: Identity,
        settings: ConnectionSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<Self> {
        let crypto = CryptoBox::for_kind(settings.cipher);
        Self::with_crypto(identity, settings, handler, crypto)
    }

    pub fn with_crypto(
        identity: Identity,
        settings: ConnectionSettings,
        handler: Arc<dyn MessageHandler>,
        crypto: CryptoBox,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        Arc::new_cyclic(|this| Self {
            identity,
            settings,
            crypto,
            tracker: ReliabilityTracker::new(),
            handler,
            state: Mutex::new(ConnectionState {
                writer: None,
                connected: false,
                keep_connected: false,
                last_sent_at: None,
            }),
            last_received_at: StdMutex::new(Instant::now()),
            log_snapshot: StdMutex::new(None),
            loops: StdMutex::new(Loops::default()),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            reconnecting: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Connects unless already connected, then pushes the current setup in
    /// the background.
    ///
    /// The connection is marked wanted before the first attempt, so a failed
    /// connect is retried by the watchdog.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Transport`] once every connect attempt has
    /// failed.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        state.keep_connected = true;
        let opened = self.open_locked(&mut state).await?;
        drop(state);
        if opened {
            self.push_setup();
        }
        Ok(())
    }

    /// Closes the connection and stops both loops.  Idempotent.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.keep_connected = false;
        self.close_locked(&mut state).await;
        info!(serial = self.identity.serial_str(), "disconnected");
    }

    /// Tears the connection down and opens it again in one locked transition.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        self.close_locked(&mut state).await;
        state.keep_connected = true;
        let opened = self.open_locked(&mut state).await?;
        drop(state);
        if opened {
            self.push_setup();
        }
        Ok(())
    }

    async fn open_locked(&self, state: &mut ConnectionState) -> Result<bool, ConnectionError> {
        if state.connected {
            return Ok(false);
        }
        if let Some(stale) = state.writer.take() {
            stale.shutdown().await;
        }
        self.stop_receiver().await;
        self.ensure_dispatcher();

        let addr = self.identity.server_addr();
        let policy = ConnectPolicy {
            attempts: self.settings.connect_attempts,
            backoff: self.settings.connect_backoff,
            attempt_timeout: self.settings.connect_timeout,
        };
        let (writer, reader) = transport::open(&addr, policy).await?;

        state.writer = Some(writer);
        state.connected = true;
        self.touch_received();
        self.spawn_receiver(reader);
        info!(serial = self.identity.serial_str(), addr = %addr, "connected");
        Ok(true)
    }

    async fn close_locked(&self, state: &mut ConnectionState) {
        state.connected = false;
        if let Some(writer) = state.writer.take() {
            writer.shutdown().await;
        }
        let aborted = self.tracker.abort_all();
        if aborted > 0 {
            debug!(aborted, "pending transactions aborted on close");
        }
        self.stop_loops().await;
    }

    /// Called by the receiver when the peer goes away.  `keep_connected` is
    /// left untouched so the watchdog brings the link back.
    async fn on_link_lost(&self, reason: &TransportError) {
        let mut state = self.state.lock().await;
        if state.connected {
            warn!(serial = self.identity.serial_str(), "link lost: {reason}");
            state.connected = false;
            if let Some(writer) = state.writer.take() {
                writer.shutdown().await;
            }
        }
        drop(state);
        self.tracker.abort_all();
    }

    fn lock_log_snapshot(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.log_snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch_received(&self) {
        *self
            .last_received_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        self.last_received_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    fn push_setup(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let payload = match self.handler.setup_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!("initial setup push skipped: {e}");
                return;
            }
        };
        tokio::spawn(async move {
            this.send(MessageType::Setup, &payload, None, false).await;
        });
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Sends one message and reports success as a boolean.  Failures are
    /// logged; retrying is up to the caller.
    ///
    /// With `is_response == false` the call blocks until the server ACKs the
    /// transaction or the ack timeout expires.
    pub async fn send(
        &self,
        kind: MessageType,
        payload: &[u8],
        tid: Option<u16>,
        is_response: bool,
    ) -> bool {
        match self.try_send(kind, payload, tid, is_response).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    serial = self.identity.serial_str(),
                    ?kind,
                    "send failed: {e}"
                );
                false
            }
        }
    }

    /// Typed-error variant of [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NotConnected`] if the transport is closed.
    /// - [`ConnectionError::DuplicateTransaction`] if `tid` is already pending.
    /// - [`ConnectionError::NoAck`] on ack timeout or if the connection
    ///   closed while waiting.
    /// - Wrapped crypto, frame or transport errors.
    pub async fn try_send(
        &self,
        kind: MessageType,
        payload: &[u8],
        tid: Option<u16>,
        is_response: bool,
    ) -> Result<(), ConnectionError> {
        let sealed = self.crypto.encrypt(self.identity.key(), payload)?;
        let (tid, tracked) = self.allocate(kind, tid, is_response)?;

        let bytes = match Frame::new(self.identity.serial(), tid, kind, sealed.iv, sealed.ciphertext)
            .map(|frame| frame.with_health(self.handler.health()))
            .and_then(|frame| encode_frame(&frame))
        {
            Ok(bytes) => bytes,
            Err(e) => {
                self.release(tid, tracked);
                return Err(e.into());
            }
        };

        if let Err(e) = self.transmit(&bytes).await {
            self.release(tid, tracked);
            return Err(e);
        }
        debug!(tid, ?kind, len = bytes.len(), "frame sent");

        if !tracked || is_response {
            return Ok(());
        }
        let timeout = self.settings.ack_timeout;
        if self.tracker.wait_for_ack(tid, timeout).await {
            Ok(())
        } else {
            Err(ConnectionError::NoAck { tid, timeout })
        }
    }

    /// Picks the transaction id and registers it unless `kind` is ACK.
    fn allocate(
        &self,
        kind: MessageType,
        tid: Option<u16>,
        is_response: bool,
    ) -> Result<(u16, bool), ConnectionError> {
        if kind == MessageType::Ack {
            return Ok((tid.unwrap_or_else(rand::random), false));
        }
        match (tid, is_response) {
            (None, false) => Ok((self.tracker.reserve(), true)),
            (None, true) => loop {
                let candidate: u16 = rand::random();
                if self.tracker.register_detached(candidate) {
                    break Ok((candidate, true));
                }
            },
            (Some(tid), false) => {
                if self.tracker.register(tid) {
                    Ok((tid, true))
                } else {
                    Err(ConnectionError::DuplicateTransaction(tid))
                }
            }
            // The server picked this id; if it collides with one of ours the
            // response goes out untracked.
            (Some(tid), true) => Ok((tid, self.tracker.register_detached(tid))),
        }
    }

    fn release(&self, tid: u16, tracked: bool) {
        if tracked {
            self.tracker.forget(tid);
        }
    }

    async fn transmit(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(ConnectionError::NotConnected);
        }
        let Some(writer) = state.writer.as_mut() else {
            return Err(ConnectionError::NotConnected);
        };
        match writer.write_frame(bytes, self.settings.write_timeout).await {
            Ok(()) => {
                state.last_sent_at = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                warn!(serial = self.identity.serial_str(), "write failed: {e}");
                state.connected = false;
                if let Some(writer) = state.writer.take() {
                    writer.shutdown().await;
                }
                drop(state);
                self.tracker.abort_all();
                Err(e.into())
            }
        }
    }

    // ── Loops ─────────────────────────────────────────────────────────────────

    fn lock_loops(&self) -> MutexGuard<'_, Loops> {
        self.loops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_receiver(&self, reader: FrameReader) {
        let handle = tokio::spawn(receive_loop(
            self.this.clone(),
            reader,
            self.settings.poll_interval,
        ));
        if let Some(old) = self.lock_loops().receiver.replace(handle) {
            old.abort();
        }
    }

    fn ensure_dispatcher(&self) {
        let mut loops = self.lock_loops();
        if loops.dispatcher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if loops.dispatcher.is_some() {
            warn!(serial = self.identity.serial_str(), "dispatcher restarted");
        }
        loops.dispatcher = Some(tokio::spawn(dispatch_loop(
            self.this.clone(),
            Arc::clone(&self.inbound_rx),
        )));
    }

    fn receiver_alive(&self) -> bool {
        self.lock_loops()
            .receiver
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    async fn stop_receiver(&self) {
        let handle = self.lock_loops().receiver.take();
        if let Some(handle) = handle {
            join_bounded(handle, self.settings.join_timeout, "receiver").await;
        }
    }

    async fn stop_loops(&self) {
        let (receiver, dispatcher) = {
            let mut loops = self.lock_loops();
            (loops.receiver.take(), loops.dispatcher.take())
        };
        if let Some(handle) = receiver {
            join_bounded(handle, self.settings.join_timeout, "receiver").await;
        }
        if let Some(handle) = dispatcher {
            join_bounded(handle, self.settings.join_timeout, "dispatcher").await;
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    async fn dispatch(&self, frame: Frame) {
        let tid = frame.transaction_id;
        if let Err(e) = validate_inbound(&frame, self.identity.serial()) {
            warn!(tid, "inbound frame dropped: {e}");
            return;
        }
        let kind = match frame.kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(tid, "inbound frame dropped: {e}");
                return;
            }
        };
        debug!(tid, ?kind, "dispatching");

        match kind {
            MessageType::Ack => {
                self.tracker.mark_acked(tid);
            }
            MessageType::Keepalive => {
                self.send(MessageType::Ack, &[], Some(tid), true).await;
            }
            MessageType::DataRequest => match self.handler.data_payload() {
                Ok(payload) => {
                    self.send(MessageType::Data, &payload, Some(tid), true).await;
                }
                Err(e) => error!(tid, "DATA response not built: {e}"),
            },
            MessageType::SetupChange => self.on_setup_change(&frame).await,
            MessageType::LogPrepare => {
                match self.handler.prepare_log() {
                    Ok(payload) => *self.lock_log_snapshot() = Some(payload),
                    Err(e) => error!(tid, "log snapshot not built: {e}"),
                }
                self.send(MessageType::Ack, &[], Some(tid), true).await;
                self.handler.clear_log();
            }
            MessageType::LogSendRequest => {
                let snapshot = self.lock_log_snapshot().clone();
                match snapshot {
                    Some(payload) => {
                        self.send(MessageType::LogData, &payload, Some(tid), true).await;
                    }
                    None => warn!(tid, "log requested before any LOG_PREPARE; nothing sent"),
                }
            }
            MessageType::Data | MessageType::LogData | MessageType::Setup => {
                warn!(tid, ?kind, "device-originated message type received from server");
            }
        }
    }

    async fn on_setup_change(&self, frame: &Frame) {
        let tid = frame.transaction_id;
        let plain = match self
            .crypto
            .decrypt(self.identity.key(), &frame.iv, &frame.payload)
        {
            Ok(plain) => plain,
            Err(e) => {
                warn!(tid, "SETUP_CHANGE not decrypted: {e}");
                return;
            }
        };
        let changes = match decode_setup(&plain) {
            Ok(changes) => changes,
            Err(e) => {
                warn!(tid, "SETUP_CHANGE dropped: {e}");
                return;
            }
        };
        info!(tid, entries = changes.len(), "applying setup change");
        self.handler.apply_setup(changes).await;

        match self.handler.setup_payload() {
            Ok(payload) => {
                self.send(MessageType::Setup, &payload, Some(tid), true).await;
            }
            Err(e) => error!(tid, "SETUP response not built: {e}"),
        }
    }

    // ── Watchdog ──────────────────────────────────────────────────────────────

    /// Periodic health check: sweeps stale transactions, restarts a dead
    /// dispatcher and reconnects when the wanted link is down, has lost its
    /// receiver, or has been silent longer than the keepalive threshold.
    ///
    /// At most one reconnect runs at a time; a tick that finds one in flight
    /// or the connection busy does nothing.  Reconnect failures are logged
    /// and retried on the next tick.
    pub async fn watchdog(&self) {
        let swept = self.tracker.sweep();
        if swept > 0 {
            debug!(swept, "stale transactions swept");
        }
        if self.reconnecting.load(Ordering::Acquire) {
            return;
        }

        let reason = {
            let Ok(state) = self.state.try_lock() else {
                return;
            };
            if !state.keep_connected {
                return;
            }
            self.ensure_dispatcher();
            let silent_for = self.silent_for();
            if !state.connected {
                "not connected"
            } else if !self.receiver_alive() {
                "receiver stopped"
            } else if silent_for >= self.settings.keepalive_timeout {
                debug!(
                    ?silent_for,
                    since_sent = ?state.last_sent_at.map(|t| t.elapsed()),
                    "keepalive threshold exceeded"
                );
                "server silent"
            } else {
                return;
            }
        };

        let Some(_guard) = ReconnectGuard::acquire(&self.reconnecting) else {
            return;
        };
        info!(serial = self.identity.serial_str(), reason, "watchdog reconnecting");
        if let Err(e) = self.reconnect().await {
            warn!(serial = self.identity.serial_str(), "reconnect failed: {e}");
        }
    }

    // ── Diagnostics ───────────────────────────────────────────────────────────

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn keep_connected(&self) -> bool {
        self.state.lock().await.keep_connected
    }

    /// Number of reconnects attempted so far, by the watchdog or by callers.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.len()
    }
}

async fn join_bounded(handle: JoinHandle<()>, limit: Duration, name: &str) {
    handle.abort();
    if time::timeout(limit, handle).await.is_err() {
        warn!(name, "loop did not stop within {limit:?}");
    }
}

async fn receive_loop(manager: Weak<ConnectionManager>, mut reader: FrameReader, poll: Duration) {
    loop {
        let result = reader.poll(poll).await;
        let Some(this) = manager.upgrade() else {
            break;
        };
        match result {
            Ok(frames) if frames.is_empty() => {}
            Ok(frames) => {
                this.touch_received();
                for frame in frames {
                    debug!(tid = frame.transaction_id, kind = frame.message_type, "frame received");
                    if this.inbound_tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                this.on_link_lost(&e).await;
                break;
            }
        }
    }
    debug!("receiver stopped");
}

async fn dispatch_loop(manager: Weak<ConnectionManager>, inbound: Arc<Mutex<mpsc::Receiver<Frame>>>) {
    let mut rx = inbound.lock().await;
    while let Some(frame) = rx.recv().await {
        let Some(this) = manager.upgrade() else {
            break;
        };
        this.dispatch(frame).await;
    }
    debug!("dispatcher stopped");
}

#[async_trait]
impl Link for ConnectionManager {
    fn label(&self) -> String {
        format!("{}@{}", self.identity.serial_str(), self.identity.server_addr())
    }

    async fn start(&self) -> bool {
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!(link = %self.label(), "initial connect failed: {e}");
                false
            }
        }
    }

    async fn stop(&self) {
        self.disconnect().await;
    }

    async fn supervise(&self) {
        self.watchdog().await;
    }

    async fn publish(&self, kind: MessageType, payload: &[u8], await_ack: bool) -> bool {
        self.send(kind, payload, None, !await_ack).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
