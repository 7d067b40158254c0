use std::{collections::HashMap, fmt, sync::Arc};

use chrono::Utc;
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{
    hex::HexExt,
    identity::{NodeId, NodeIdentity},
};

/// A named, versioned item of executable work. Exactly one node queue owns a
/// unit at a time; migration moves it.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WorkUnit {
    /// Logical key used by `purge` and run selectors.
    pub name: String,
    /// Opaque payload handed to the execution engine.
    pub code: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub packages: Vec<PackageRef>,
    #[serde(default)]
    pub imports: Vec<String>,
    /// Names this unit expects to run after. Carried, never enforced.
    #[serde(default)]
    pub wait_on: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".into()
}

impl WorkUnit {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            version: default_version(),
            packages: Vec::new(),
            imports: Vec::new(),
            wait_on: Vec::new(),
        }
    }

    pub fn with_package(mut self, package: PackageRef) -> Self {
        self.packages.push(package);
        self
    }

    pub fn with_import(mut self, import: impl Into<String>) -> Self {
        self.imports.push(import.into());
        self
    }

    pub fn waiting_on(mut self, name: impl Into<String>) -> Self {
        self.wait_on.push(name.into());
        self
    }

    /// True if the unit is picked by `selector`. An empty selector picks all.
    pub fn is_selected(&self, selector: &[String]) -> bool {
        selector.is_empty() || selector.iter().any(|name| *name == self.name)
    }
}

/// An external dependency resolved by the execution engine, not the core.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    #[serde(default = "any_version")]
    pub version: String,
    #[serde(default)]
    pub source: Option<String>,
}

fn any_version() -> String {
    "*".into()
}

impl PackageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: any_version(),
            source: None,
        }
    }
}

/// Identifies one aggregation or execution round.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RoundId(pub [u8; 16]);

impl RoundId {
    pub fn new() -> Self {
        Self(rand::random())
    }
}

impl Default for RoundId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hex())
    }
}

/// Counters carried along with a round.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct NetworkStats {
    /// Units executed so far in this round, network wide.
    pub counter: u64,
    /// Microseconds since the unix epoch.
    pub started_at: i64,
    pub last_execution: Option<i64>,
    /// Executions per second since `started_at`.
    pub throughput: f64,
}

impl NetworkStats {
    pub fn started_now() -> Self {
        Self {
            counter: 0,
            started_at: Utc::now().timestamp_micros(),
            last_execution: None,
            throughput: 0.0,
        }
    }

    pub fn record(&mut self, executed: u64) {
        let now = Utc::now().timestamp_micros();
        self.counter += executed;
        self.last_execution = Some(now);
        let elapsed = (now - self.started_at) as f64 / 1_000_000.0;
        if elapsed > 0.0 {
            self.throughput = self.counter as f64 / elapsed;
        }
    }
}

/// What one unit produced on one node.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum UnitOutcome {
    Completed(String),
    Failed(String),
}

impl UnitOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitOutcome::Failed(_))
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Completed(text) => f.write_str(text),
            UnitOutcome::Failed(reason) => write!(f, "<error: {}>", reason),
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Contribution {
    pub node: NodeId,
    pub address: String,
    pub unit: String,
    pub outcome: UnitOutcome,
}

/// Wire form of an [`ExecutionContext`], passed by value from hop to hop.
#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
pub struct ContextFrame {
    pub round: RoundId,
    pub origin: NodeIdentity,
    /// The node the frame was last executed on.
    pub current: NodeIdentity,
    pub stats: NetworkStats,
    pub data: HashMap<String, String>,
    pub contributions: Vec<Contribution>,
}

impl ContextFrame {
    /// Starts a fresh round originated by `origin`.
    pub fn originate(origin: NodeIdentity) -> Self {
        Self {
            round: RoundId::new(),
            current: origin.clone(),
            origin,
            stats: NetworkStats::started_now(),
            data: HashMap::new(),
            contributions: Vec::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// The live context a node executes its units against.
pub struct ExecutionContext {
    pub round: RoundId,
    pub origin: NodeIdentity,
    pub current: NodeIdentity,
    pub stats: NetworkStats,
    pub data: SharedBag,
    pub contributions: Vec<Contribution>,
}

impl ExecutionContext {
    pub fn from_frame(frame: ContextFrame, current: NodeIdentity) -> Self {
        Self {
            round: frame.round,
            origin: frame.origin,
            current,
            stats: frame.stats,
            data: SharedBag::new(frame.data),
            contributions: frame.contributions,
        }
    }

    pub fn into_frame(self) -> ContextFrame {
        ContextFrame {
            round: self.round,
            origin: self.origin,
            current: self.current,
            stats: self.stats,
            data: self.data.snapshot(),
            contributions: self.contributions,
        }
    }
}

/// Key/value store shared by every unit executing against one context.
///
/// Each mutation takes the lock, applies the change, releases the lock and
/// then wakes every task parked in [`SharedBag::wait_for`]. Clones share the
/// same store.
#[derive(Clone, Default)]
pub struct SharedBag {
    inner: Arc<BagInner>,
}

#[derive(Default)]
struct BagInner {
    data: Mutex<HashMap<String, String>>,
    changed: Notify,
}

impl SharedBag {
    pub fn new(data: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(BagInner {
                data: Mutex::new(data),
                changed: Notify::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.data.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.update(|data| data.insert(key.into(), value.into()))
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.update(|data| data.remove(key))
    }

    /// Runs `f` inside the critical section and notifies waiters afterwards.
    pub fn update<R>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> R) -> R {
        let result = {
            let mut data = self.inner.data.lock();
            f(&mut data)
        };
        self.inner.changed.notify_waiters();
        result
    }

    /// Waits until `key` is present and returns its value.
    pub async fn wait_for(&self, key: &str) -> String {
        loop {
            // registered before the check so a concurrent update can't slip
            // between the check and the await
            let changed = self.inner.changed.notified();
            if let Some(value) = self.get(key) {
                return value;
            }
            changed.await;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.data.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
