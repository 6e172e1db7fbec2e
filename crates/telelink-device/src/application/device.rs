//! Device: telemetry datasets, the setup map and the loops that drive them.
//!
//! A [`Device`] owns two background loops:
//!
//! - **polling** – every `modbus_frequency` it reads a register snapshot,
//!   folds it into each dataset and reconciles the setup map against the
//!   hardware.  Forced entries are written back to their register; unforced
//!   changes are accepted and republished on every link.
//! - **supervisory** – every `supervisor_interval` it ticks each link's
//!   watchdog, invalidates dataset values once polling has stalled for
//!   [`MISSED_POLLS_BEFORE_INVALIDATION`] periods and, if configured, pushes
//!   a log snapshot unprompted.
//!
//! Server requests reach the Device through [`MessageHandler`], implemented
//! by the shared core handed to each connection via [`Device::handler`].
//! The core's lock is only held for read-modify-write, never across I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use telelink_core::protocol::payload::{encode_setup, encode_values, SetupValues, Values};
use telelink_core::{Dataset, MessageType, ProtocolError, Register, SetupAction, SetupMap};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::ports::{HealthSource, Link, MessageHandler, RegisterError, RegisterSource};

/// Consecutive polling periods without a successful read before dataset
/// values are invalidated.
pub const MISSED_POLLS_BEFORE_INVALIDATION: u32 = 3;

const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// Bus address passed to the register source.
    pub node_id: u8,
    /// Polling period.  Zero disables polling.
    pub modbus_frequency: Duration,
    pub register_start: u16,
    pub register_count: u16,
    pub supervisor_interval: Duration,
    /// Unprompted log push period; `None` waits for server requests.
    pub log_send_interval: Option<Duration>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            node_id: 1,
            modbus_frequency: Duration::from_secs(5),
            register_start: 0,
            register_count: 64,
            supervisor_interval: Duration::from_secs(1),
            log_send_interval: None,
        }
    }
}

// ── Core state ────────────────────────────────────────────────────────────────

struct DeviceState {
    registers: HashMap<u16, Register>,
    datasets: BTreeMap<String, Dataset>,
    setup: SetupMap,
    log_snapshot: Values,
    last_poll_ok: Option<Instant>,
    started_at: Instant,
    invalidated: bool,
}

impl DeviceState {
    fn values(&self) -> Values {
        self.datasets
            .iter()
            .map(|(name, ds)| (name.clone(), ds.current()))
            .collect()
    }
}

/// State shared by the Device loops and every connection's dispatcher.
struct DeviceCore {
    settings: DeviceSettings,
    registers: Arc<dyn RegisterSource>,
    health: Arc<dyn HealthSource>,
    state: Mutex<DeviceState>,
}

impl DeviceCore {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reads one snapshot and folds it in.  Returns the setup follow-ups.
    async fn poll(&self) -> Result<Vec<SetupAction>, RegisterError> {
        let s = &self.settings;
        let snapshot = self
            .registers
            .read(s.node_id, s.register_start, s.register_count)
            .await?;
        let now = Instant::now();

        let mut state = self.lock();
        state.registers = snapshot
            .iter()
            .map(|(&id, &value)| {
                (
                    id,
                    Register {
                        register_id: id,
                        value,
                        captured_at: now,
                    },
                )
            })
            .collect();
        for dataset in state.datasets.values_mut() {
            match snapshot.get(&dataset.register()) {
                Some(&raw) => dataset.update(raw as f64, now),
                None => dataset.invalidate(),
            }
        }
        state.last_poll_ok = Some(now);
        state.invalidated = false;
        Ok(state.setup.reconcile(&snapshot))
    }

    fn invalidate_if_stale(&self) {
        let period = self.settings.modbus_frequency;
        if period.is_zero() {
            return;
        }
        let mut state = self.lock();
        let since = state.last_poll_ok.unwrap_or(state.started_at);
        if state.invalidated || since.elapsed() < period * MISSED_POLLS_BEFORE_INVALIDATION {
            return;
        }
        for dataset in state.datasets.values_mut() {
            dataset.invalidate();
        }
        state.invalidated = true;
        warn!(
            missed = MISSED_POLLS_BEFORE_INVALIDATION,
            "no successful register poll; dataset values invalidated"
        );
    }

    async fn set_setup_value(&self, key: &str, value: i64) -> bool {
        let register = match self.lock().setup.get(key) {
            Some(entry) => entry.register,
            None => {
                warn!(key, "unknown setup key");
                return false;
            }
        };

        if let Some(register) = register {
            let node = self.settings.node_id;
            if let Err(e) = self.registers.write(node, register, value).await {
                warn!(key, register, value, "setup write failed: {e}");
                return false;
            }
            let readback = match self.registers.read(node, register, 1).await {
                Ok(snapshot) => snapshot.get(&register).copied(),
                Err(e) => {
                    warn!(key, register, "setup readback failed: {e}");
                    return false;
                }
            };
            if readback != Some(value) {
                warn!(key, register, value, ?readback, "setup readback mismatch");
                return false;
            }
        }

        self.lock().setup.set(key, value)
    }
}

#[async_trait]
impl MessageHandler for DeviceCore {
    fn health(&self) -> u8 {
        self.health.health()
    }

    fn data_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_values(&self.lock().values())
    }

    fn setup_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_setup(&self.lock().setup.values())
    }

    fn prepare_log(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut state = self.lock();
        let snapshot = state.values();
        let payload = encode_values(&snapshot);
        state.log_snapshot = snapshot;
        payload
    }

    fn clear_log(&self) {
        for dataset in self.lock().datasets.values_mut() {
            dataset.clear();
        }
    }

    async fn apply_setup(&self, changes: SetupValues) {
        for (key, value) in changes {
            if !self.set_setup_value(&key, value).await {
                warn!(key = %key, value, "setup change not applied");
            }
        }
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

struct DeviceInner {
    core: Arc<DeviceCore>,
    links: RwLock<Vec<Arc<dyn Link>>>,
    last_log_push: Mutex<Instant>,
}

impl DeviceInner {
    fn links(&self) -> Vec<Arc<dyn Link>> {
        self.links
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn poll_registers(&self) {
        let actions = match self.core.poll().await {
            Ok(actions) => actions,
            Err(e) => {
                warn!("register poll failed: {e}");
                return;
            }
        };

        let mut republish = false;
        for action in actions {
            match action {
                SetupAction::WriteRegister { register, value } => {
                    let node = self.core.settings.node_id;
                    match self.core.registers.write(node, register, value).await {
                        Ok(()) => info!(register, value, "forced setup value restored"),
                        Err(e) => warn!(register, value, "forced setup write failed: {e}"),
                    }
                }
                SetupAction::Accepted { key, value } => {
                    info!(key = %key, value, "setup change accepted from hardware");
                    republish = true;
                }
            }
        }
        if republish {
            self.publish_setup().await;
        }
    }

    async fn publish_setup(&self) {
        let payload = match self.core.setup_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("setup payload not built: {e}");
                return;
            }
        };
        for link in self.links() {
            if !link.publish(MessageType::Setup, &payload, false).await {
                warn!(link = %link.label(), "setup republish failed");
            }
        }
    }

    async fn supervise(&self) {
        self.core.invalidate_if_stale();
        let links = self.links();
        for link in &links {
            link.supervise().await;
        }

        let Some(interval) = self.core.settings.log_send_interval else {
            return;
        };
        {
            let mut pushed_at = self.last_log_push.lock().unwrap_or_else(|p| p.into_inner());
            if pushed_at.elapsed() < interval {
                return;
            }
            *pushed_at = Instant::now();
        }
        self.push_log(links);
    }

    /// Freezes and clears the accumulators, then sends the snapshot on every
    /// link.  Each send waits for its ACK in its own task so supervision
    /// keeps ticking.
    fn push_log(&self, links: Vec<Arc<dyn Link>>) {
        let frozen = self.core.prepare_log();
        self.core.clear_log();
        let payload = match frozen {
            Ok(payload) => payload,
            Err(e) => {
                warn!("log payload not built: {e}");
                return;
            }
        };
        debug!(links = links.len(), "pushing log snapshot");
        for link in links {
            let payload = payload.clone();
            tokio::spawn(async move {
                if !link.publish(MessageType::LogData, &payload, true).await {
                    warn!(link = %link.label(), "log push not acknowledged");
                }
            });
        }
    }
}

/// A field device driving one or more server links.
pub struct Device {
    inner: Arc<DeviceInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    pub fn new(
        settings: DeviceSettings,
        datasets: Vec<Dataset>,
        setup: SetupMap,
        registers: Arc<dyn RegisterSource>,
        health: Arc<dyn HealthSource>,
    ) -> Self {
        let now = Instant::now();
        let core = DeviceCore {
            settings,
            registers,
            health,
            state: Mutex::new(DeviceState {
                registers: HashMap::new(),
                datasets: datasets
                    .into_iter()
                    .map(|ds| (ds.name().to_string(), ds))
                    .collect(),
                setup,
                log_snapshot: Values::new(),
                last_poll_ok: None,
                started_at: now,
                invalidated: false,
            }),
        };
        Self {
            inner: Arc::new(DeviceInner {
                core: Arc::new(core),
                links: RwLock::new(Vec::new()),
                last_log_push: Mutex::new(now),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Handler to pass to each connection so it can answer server requests.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.inner.core.clone()
    }

    pub fn add_connection(&self, link: Arc<dyn Link>) {
        info!(link = %link.label(), "connection added");
        self.inner
            .links
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(link);
    }

    pub fn connections(&self) -> Vec<Arc<dyn Link>> {
        self.inner.links()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Starts the polling and supervisory loops, then every link.  A link
    /// that fails to connect is retried by supervision.
    pub async fn start(&self) {
        {
            let mut tasks = self.lock_tasks();
            if !tasks.is_empty() {
                debug!("device already started");
                return;
            }
            let settings = &self.inner.core.settings;
            if settings.modbus_frequency.is_zero() {
                info!("register polling disabled");
            } else {
                tasks.push(tokio::spawn(polling_loop(
                    Arc::clone(&self.inner),
                    settings.modbus_frequency.max(MIN_TICK),
                )));
            }
            tasks.push(tokio::spawn(supervisory_loop(
                Arc::clone(&self.inner),
                settings.supervisor_interval.max(MIN_TICK),
            )));
        }

        for link in self.inner.links() {
            link.start().await;
        }
        info!("device started");
    }

    /// Stops both loops and every link.
    pub async fn stop(&self) {
        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        for link in self.inner.links() {
            link.stop().await;
        }
        info!("device stopped");
    }

    /// Runs one polling cycle immediately.
    pub async fn poll_registers(&self) {
        self.inner.poll_registers().await;
    }

    /// Runs one supervisory tick immediately.
    pub async fn supervise(&self) {
        self.inner.supervise().await;
    }

    /// Current value of every dataset; invalid values are `None`.
    pub fn get_data(&self) -> Values {
        self.inner.core.lock().values()
    }

    /// Current value of one dataset.  Unknown names read as `None`.
    pub fn get_data_value(&self, name: &str) -> Option<f64> {
        self.inner
            .core
            .lock()
            .datasets
            .get(name)
            .and_then(Dataset::current)
    }

    /// The snapshot frozen by the most recent log preparation on any link.
    /// Each connection answers its own server from the snapshot it froze.
    pub fn get_log_data(&self) -> Values {
        self.inner.core.lock().log_snapshot.clone()
    }

    pub fn get_setup(&self) -> SetupValues {
        self.inner.core.lock().setup.values()
    }

    /// Last polled value of `register`.
    pub fn register_value(&self, register: u16) -> Option<i64> {
        self.inner
            .core
            .lock()
            .registers
            .get(&register)
            .map(|r| r.value)
    }

    /// Writes `value` through to the backing register, verifies the
    /// readback and then updates the setup map.  Returns `false` for an
    /// unknown key, a failed write or a readback mismatch.
    ///
    /// On success the new setup is republished on every link.
    pub async fn set_setup_value(&self, key: &str, value: i64) -> bool {
        if !self.inner.core.set_setup_value(key, value).await {
            return false;
        }
        self.inner.publish_setup().await;
        true
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

async fn polling_loop(inner: Arc<DeviceInner>, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        inner.poll_registers().await;
    }
}

async fn supervisory_loop(inner: Arc<DeviceInner>, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        inner.supervise().await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
