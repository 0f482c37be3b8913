// =============================================================================
// Reconnecting Subscription Manager
// =============================================================================
//
// Split into a cloneable handle (`SubscriptionManager`) and a single driver
// (`FeedDriver`) that owns the connection:
//
//   - The handle keeps the instrument -> callbacks registry. The first
//     callback for an instrument adds it to the subscription set; removing the
//     last one drops it. Requests are forwarded to the driver only while
//     connected; otherwise the next connect replays the whole set.
//   - The driver connects, replays the set, pumps inbound ticks to callbacks
//     in receipt order and reconnects with capped exponential backoff. After
//     `max_attempts` failed reconnects it reports `Exhausted` once and returns;
//     calling `run` again is the manual retrigger.
//   - When every handle is dropped the driver closes the connection and
//     returns `DriverExit::Shutdown`.
//
// Callbacks are invoked on the driver task with no lock held, so they may
// subscribe/unsubscribe re-entrantly.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::backoff::{Backoff, ReconnectConfig};
use super::transport::{decode_tick, ControlMessage, TickConnection, TickTransport};
use crate::error::PipelineError;
use crate::types::Tick;

pub type TickCallback = Arc<dyn Fn(&Tick) + Send + Sync>;
pub type ConnectionObserver = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Token identifying one registered tick callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Connection lifecycle notifications delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    /// `attempt` is 1-based: the retry this delay precedes.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Terminal for this `run`; surfaced exactly once.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Exhausted,
    Closed,
}

/// Why `FeedDriver::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    Exhausted { attempts: u32 },
    Shutdown,
}

// =============================================================================
// Shared registry
// =============================================================================

struct Registry {
    next_id: u64,
    callbacks: BTreeMap<String, Vec<(SubscriptionId, TickCallback)>>,
    state: ConnectionState,
}

impl Registry {
    fn instruments(&self) -> Vec<String> {
        self.callbacks.keys().cloned().collect()
    }
}

struct Shared {
    registry: Mutex<Registry>,
    observers: Mutex<Vec<ConnectionObserver>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.registry.lock().state = state;
    }

    fn emit(&self, event: ConnectionEvent) {
        let observers: Vec<ConnectionObserver> = self.observers.lock().clone();
        for observer in observers {
            observer(&event);
        }
    }
}

// =============================================================================
// SubscriptionManager (handle)
// =============================================================================

/// Cloneable handle used to register interest in instruments.
#[derive(Clone)]
pub struct SubscriptionManager {
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

impl SubscriptionManager {
    /// Build a manager and the driver that owns its connection. Nothing
    /// connects until the driver is run.
    pub fn new<T>(transport: T, config: ReconnectConfig) -> (Self, FeedDriver)
    where
        T: TickTransport + 'static,
    {
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                next_id: 0,
                callbacks: BTreeMap::new(),
                state: ConnectionState::Idle,
            }),
            observers: Mutex::new(Vec::new()),
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let manager = Self {
            shared: shared.clone(),
            control_tx,
        };
        let driver = FeedDriver {
            transport: Box::new(transport),
            shared,
            control_rx,
            backoff: Backoff::new(config),
        };
        (manager, driver)
    }

    /// Register `on_tick` for `instrument_key`.
    pub fn subscribe<F>(&self, instrument_key: &str, on_tick: F) -> SubscriptionId
    where
        F: Fn(&Tick) + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;

        let connected = registry.state == ConnectionState::Connected;
        let callbacks = registry.callbacks.entry(instrument_key.to_string()).or_default();
        let first = callbacks.is_empty();
        callbacks.push((id, Arc::new(on_tick)));

        if first {
            info!(instrument = %instrument_key, connected, "instrument added to subscription set");
            if connected {
                self.forward(ControlMessage::subscribe(vec![instrument_key.to_string()]));
            }
        }
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, instrument_key: &str, id: SubscriptionId) -> bool {
        let mut registry = self.shared.registry.lock();
        let connected = registry.state == ConnectionState::Connected;

        let Some(callbacks) = registry.callbacks.get_mut(instrument_key) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        if callbacks.len() == before {
            return false;
        }

        if callbacks.is_empty() {
            registry.callbacks.remove(instrument_key);
            info!(instrument = %instrument_key, connected, "instrument removed from subscription set");
            if connected {
                self.forward(ControlMessage::unsubscribe(vec![instrument_key.to_string()]));
            }
        }
        true
    }

    /// Current subscription set, sorted.
    pub fn subscribed_instruments(&self) -> Vec<String> {
        self.shared.registry.lock().instruments()
    }

    pub fn callback_count(&self, instrument_key: &str) -> usize {
        self.shared
            .registry
            .lock()
            .callbacks
            .get(instrument_key)
            .map_or(0, Vec::len)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.registry.lock().state
    }

    pub fn on_connection_event<F>(&self, observer: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.observers.lock().push(Arc::new(observer));
    }

    // Called with the registry lock held so the driver's drain-on-connect
    // cannot interleave with a forwarded request.
    fn forward(&self, message: ControlMessage) {
        if self.control_tx.send(message).is_err() {
            debug!("feed driver gone; request will not be sent");
        }
    }
}

// =============================================================================
// FeedDriver
// =============================================================================

enum PumpExit {
    Lost(String),
    Shutdown,
}

/// Owns the single connection for one manager.
pub struct FeedDriver {
    transport: Box<dyn TickTransport>,
    shared: Arc<Shared>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    backoff: Backoff,
}

impl FeedDriver {
    /// Connect and keep the connection alive until retries are exhausted or
    /// every manager handle is dropped.
    pub async fn run(&mut self) -> DriverExit {
        self.backoff.reset();

        loop {
            match self.connect().await {
                Ok(conn) => match self.pump(conn).await {
                    PumpExit::Shutdown => {
                        self.shared.set_state(ConnectionState::Closed);
                        info!("all subscription handles dropped; feed driver stopping");
                        return DriverExit::Shutdown;
                    }
                    PumpExit::Lost(reason) => {
                        self.shared.set_state(ConnectionState::Reconnecting);
                        warn!(%reason, "tick connection lost");
                        self.shared.emit(ConnectionEvent::Disconnected { reason });
                    }
                },
                Err(e) => {
                    self.shared.set_state(ConnectionState::Reconnecting);
                    warn!(error = %e, attempt = self.backoff.attempt(), "tick connection attempt failed");
                }
            }

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempt();
                self.shared.set_state(ConnectionState::Exhausted);
                let err = PipelineError::ConnectionExhausted { attempts };
                error!(
                    error = %err,
                    max_attempts = self.backoff.max_attempts(),
                    "giving up on tick feed until restarted"
                );
                self.shared.emit(ConnectionEvent::Exhausted { attempts });
                return DriverExit::Exhausted { attempts };
            };

            let attempt = self.backoff.attempt();
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            self.shared.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });

            if !self.wait(delay).await {
                self.shared.set_state(ConnectionState::Closed);
                info!("all subscription handles dropped while reconnecting");
                return DriverExit::Shutdown;
            }
        }
    }

    /// Open a connection, reset the backoff and replay the subscription set.
    async fn connect(&mut self) -> Result<Box<dyn TickConnection>, PipelineError> {
        self.shared.set_state(ConnectionState::Connecting);
        let mut conn = self.transport.connect().await?;

        let replay = {
            let mut registry = self.shared.registry.lock();
            // Anything queued belongs to an earlier connection; the replay
            // below supersedes it.
            while self.control_rx.try_recv().is_ok() {}
            registry.state = ConnectionState::Connected;
            registry.instruments()
        };

        if !replay.is_empty() {
            info!(count = replay.len(), "replaying subscriptions");
            conn.send(&ControlMessage::subscribe(replay)).await?;
        }

        self.backoff.reset();
        self.shared.emit(ConnectionEvent::Connected);
        Ok(conn)
    }

    async fn pump(&mut self, mut conn: Box<dyn TickConnection>) -> PumpExit {
        loop {
            tokio::select! {
                inbound = conn.recv() => match inbound {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) if !e.is_transient() => {
                        warn!(error = %e, "dropping undeliverable frame");
                    }
                    Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                    None => return PumpExit::Lost("closed by peer".to_string()),
                },
                control = self.control_rx.recv() => match control {
                    Some(message) => {
                        debug!(action = ?message.action, instruments = ?message.instruments, "sending control message");
                        if let Err(e) = conn.send(&message).await {
                            return PumpExit::Lost(e.to_string());
                        }
                    }
                    None => return PumpExit::Shutdown,
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let tick = match decode_tick(text) {
            Ok(tick) => tick,
            Err(e) => {
                warn!(error = %e, "dropping malformed tick message");
                return;
            }
        };

        let callbacks: Vec<TickCallback> = self
            .shared
            .registry
            .lock()
            .callbacks
            .get(&tick.instrument_key)
            .map(|cbs| cbs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            debug!(instrument = %tick.instrument_key, "tick for unsubscribed instrument ignored");
            return;
        }
        for callback in callbacks {
            callback(&tick);
        }
    }

    /// Sleep for `delay`. Returns `false` if every handle was dropped.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                control = self.control_rx.recv() => {
                    if control.is_none() {
                        return false;
                    }
                    // Stale while disconnected; the replay covers it.
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
