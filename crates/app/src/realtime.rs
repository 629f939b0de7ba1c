use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use metrics::counter;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

use applytrack_core::{ChangeEvent, ChangeKind, ChangeSink, Table, DEFAULT_SCHEMA};

const TAP_BUFFER: usize = 128;

pub type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Event types a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventFilter {
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn matches(self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            Self::Only(expected) => expected == kind,
        }
    }
}

impl FromStr for EventFilter {
    type Err = RealtimeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "*" => Ok(Self::All),
            "INSERT" => Ok(Self::Only(ChangeKind::Insert)),
            "UPDATE" => Ok(Self::Only(ChangeKind::Update)),
            "DELETE" => Ok(Self::Only(ChangeKind::Delete)),
            _ => Err(RealtimeError::InvalidEvent(value.to_string())),
        }
    }
}

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub event: EventFilter,
    pub schema: String,
    /// `None` listens to every table of the schema.
    pub table: Option<String>,
    /// JSON object whose entries must all equal the changed row's columns.
    pub filter: Option<String>,
}

impl SubscriptionSpec {
    pub fn new(event: EventFilter, table: Table) -> Self {
        Self {
            event,
            schema: DEFAULT_SCHEMA.to_string(),
            table: Some(table.as_str().to_string()),
            filter: None,
        }
    }

    /// Listens to every table of the default schema.
    pub fn all_tables(event: EventFilter) -> Self {
        Self {
            event,
            schema: DEFAULT_SCHEMA.to_string(),
            table: None,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Ulid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Callbacks that ran to completion.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub failed: usize,
    /// The channel was disconnected; the event was discarded.
    pub dropped: bool,
}

/// Reconnection behaviour of [`RealtimeHub::simulate_reconnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("unknown realtime event type '{0}'")]
    InvalidEvent(String),
    #[error("subscription {0} not found")]
    UnknownSubscription(SubscriptionId),
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },
}

struct Subscription {
    id: SubscriptionId,
    spec: SubscriptionSpec,
    filter: Option<Map<String, Value>>,
    callback: Callback,
}

impl Subscription {
    fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.spec.event.matches(event.event) || self.spec.schema != event.schema {
            return false;
        }
        if let Some(table) = &self.spec.table {
            if table != &event.table {
                return false;
            }
        }
        let Some(filter) = &self.filter else {
            return true;
        };
        filter.iter().all(|(column, expected)| {
            let actual = event.payload.get(column).or_else(|| {
                event
                    .old_record
                    .as_ref()
                    .and_then(|old| old.get(column))
            });
            actual == Some(expected)
        })
    }
}

#[derive(Default)]
struct HubState {
    connected: bool,
    subscriptions: Vec<Subscription>,
    forced_failures: u32,
}

/// In-process stand-in for the realtime channel.
///
/// Callbacks run synchronously on the publishing thread, in registration
/// order. Events published while disconnected are discarded, never queued.
#[derive(Clone)]
pub struct RealtimeHub {
    state: Arc<Mutex<HubState>>,
    tap: broadcast::Sender<ChangeEvent>,
    policy: ReconnectPolicy,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl RealtimeHub {
    /// Creates a connected hub.
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (tap, _) = broadcast::channel(TAP_BUFFER);
        Self {
            state: Arc::new(Mutex::new(HubState {
                connected: true,
                ..HubState::default()
            })),
            tap,
            policy,
        }
    }

    pub fn connect(&self) {
        self.lock().connected = true;
        info!(stage = "realtime", "channel connected");
    }

    pub fn disconnect(&self) {
        self.lock().connected = false;
        info!(stage = "realtime", "channel disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Registers `callback`. A filter that is not a JSON object is ignored with
    /// a warning and the subscription receives every matching event.
    pub fn subscribe<F>(&self, spec: SubscriptionSpec, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Ulid::new());
        let filter = spec.filter.as_deref().and_then(|raw| {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) | Err(_) => {
                    warn!(stage = "realtime", subscription = %id, filter = raw, "ignoring invalid subscription filter");
                    None
                }
            }
        });
        debug!(
            stage = "realtime",
            subscription = %id,
            table = spec.table.as_deref().unwrap_or("*"),
            "subscription added"
        );
        self.lock().subscriptions.push(Subscription {
            id,
            spec,
            filter,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), RealtimeError> {
        let mut state = self.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|subscription| subscription.id != id);
        if state.subscriptions.len() == before {
            return Err(RealtimeError::UnknownSubscription(id));
        }
        debug!(stage = "realtime", subscription = %id, "subscription removed");
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Receives a copy of every event delivered while connected.
    pub fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tap.subscribe()
    }

    /// Delivers `event` to every matching subscriber.
    pub fn simulate_event(&self, event: ChangeEvent) -> DispatchReport {
        let callbacks: Vec<(SubscriptionId, Callback)> = {
            let state = self.lock();
            if !state.connected {
                counter!("realtime_events_dropped_total", "table" => event.table.clone())
                    .increment(1);
                debug!(stage = "realtime", event = %event.event, table = %event.table, "event dropped while disconnected");
                return DispatchReport {
                    dropped: true,
                    ..DispatchReport::default()
                };
            }
            state
                .subscriptions
                .iter()
                .filter(|subscription| subscription.matches(&event))
                .map(|subscription| (subscription.id, subscription.callback.clone()))
                .collect()
        };

        let mut report = DispatchReport::default();
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    report.failed += 1;
                    counter!("realtime_callback_failures_total").increment(1);
                    warn!(stage = "realtime", subscription = %id, event = %event.event, table = %event.table, "subscriber callback panicked");
                }
            }
        }
        counter!("realtime_events_delivered_total", "table" => event.table.clone())
            .increment(report.delivered as u64);

        if self.tap.receiver_count() > 0 {
            if let Err(err) = self.tap.send(event) {
                warn!(stage = "realtime", error = %err, "failed to broadcast change event");
            }
        }
        report
    }

    /// Drops the connection as if the network went away.
    pub fn simulate_disconnection(&self) {
        self.lock().connected = false;
        warn!(stage = "realtime", "connection lost");
    }

    /// Makes the next `attempts` reconnection attempts fail.
    pub fn fail_next_reconnects(&self, attempts: u32) {
        self.lock().forced_failures = attempts;
    }

    /// Retries the connection up to the policy's attempt limit, waiting the
    /// fixed delay after each failure. Returns the attempt that succeeded.
    /// At least one attempt is always made.
    pub async fn simulate_reconnection(&self) -> Result<u32, RealtimeError> {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let failed = {
                let mut state = self.lock();
                if state.forced_failures > 0 {
                    state.forced_failures -= 1;
                    true
                } else {
                    state.connected = true;
                    false
                }
            };
            if !failed {
                info!(stage = "realtime", attempt, "connection re-established");
                return Ok(attempt);
            }
            warn!(stage = "realtime", attempt, max_attempts, "reconnection attempt failed");
            if attempt < max_attempts && !self.policy.delay.is_zero() {
                tokio::time::sleep(self.policy.delay).await;
            }
        }
        Err(RealtimeError::ReconnectFailed {
            attempts: max_attempts,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().expect("realtime state poisoned")
    }
}

impl ChangeSink for RealtimeHub {
    fn publish(&self, event: ChangeEvent) {
        self.simulate_event(event);
    }
}
