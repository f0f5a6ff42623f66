//! Keeps a store consistent with the same store in other tabs.
//!
//! Every local write is stamped with a write-timestamp under [`TIMESTAMP_FIELD`]. When another
//! tab persists its copy, the host delivers a storage event here; the incoming record is only
//! accepted if its timestamp is strictly greater than ours, and is then combined with the local
//! record according to the configured [`MergeStrategy`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::str::FromStr;

use serde_json::Value;

use crate::error::{ConfigError, MergeError};
use crate::host::{Host, StorageChange, StorageSubscription};
use crate::persist::kind_of;
use crate::store::{Record, StateStore, StoreLayer, Update, WeakStore};

/// Reserved field holding the write-timestamp (wall-clock milliseconds).
pub const TIMESTAMP_FIELD: &str = "_timestamp";

/// `(incoming, local) -> merged`
pub type MergeFn = Rc<dyn Fn(&Record, &Record) -> Result<Record, MergeError>>;

#[derive(Clone, Default)]
pub enum MergeStrategy {
    /// The incoming record supersedes the local one.
    Replace,
    /// Incoming fields win, local fields the other tab doesn't know about are kept.
    #[default]
    Merge,
    Custom(MergeFn),
}

impl MergeStrategy {
    pub fn custom(
        merge: impl Fn(&Record, &Record) -> Result<Record, MergeError> + 'static,
    ) -> Self {
        MergeStrategy::Custom(Rc::new(merge))
    }

    fn resolve(&self, incoming: &Record, local: &Record) -> Result<Record, MergeError> {
        match self {
            MergeStrategy::Replace => Ok(incoming.clone()),
            MergeStrategy::Merge => {
                let mut merged = local.clone();
                for (field, value) in incoming {
                    merged.insert(field.clone(), value.clone());
                }
                Ok(merged)
            }
            MergeStrategy::Custom(merge) => merge(incoming, local),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(MergeStrategy::Replace),
            "merge" => Ok(MergeStrategy::Merge),
            other => Err(ConfigError::UnknownMergeStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::Replace => write!(f, "Replace"),
            MergeStrategy::Merge => write!(f, "Merge"),
            MergeStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub key: String,
    /// `"replace"` or `"merge"`. Custom strategies can only be given in code.
    pub strategy: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            key: String::new(),
            strategy: "merge".to_string(),
        }
    }
}

/// The write-timestamp of a record, `0` if it has none.
pub fn write_timestamp(record: &Record) -> i64 {
    record
        .get(TIMESTAMP_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

pub struct CrossTabSync {
    inner: Rc<SyncInner>,
}

struct SyncInner {
    host: Rc<dyn Host>,
    key: String,
    strategy: MergeStrategy,
    applying_remote: Cell<bool>,
    subscription: RefCell<Option<StorageSubscription>>,
}

impl CrossTabSync {
    pub fn new(
        host: Rc<dyn Host>,
        key: impl Into<String>,
        strategy: MergeStrategy,
    ) -> Result<Self, ConfigError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        Ok(Self {
            inner: Rc::new(SyncInner {
                host,
                key,
                strategy,
                applying_remote: Cell::new(false),
                subscription: RefCell::new(None),
            }),
        })
    }

    pub fn from_options(host: Rc<dyn Host>, options: &SyncOptions) -> Result<Self, ConfigError> {
        let strategy = options.strategy.parse()?;
        Self::new(host, options.key.clone(), strategy)
    }
}

/// Marks the write that applies another tab's record, so it keeps that record's timestamp.
struct RemoteWrite<'a>(&'a Cell<bool>);

impl<'a> RemoteWrite<'a> {
    fn begin(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for RemoteWrite<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl SyncInner {
    fn receive(&self, store: &StateStore, change: &StorageChange) {
        if change.key != self.key {
            return;
        }
        let Some(raw) = change.new_value.as_deref().filter(|raw| !raw.is_empty()) else {
            log::debug!("`{}` was removed in another tab, ignoring", self.key);
            return;
        };

        let incoming = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(record)) => record,
            Ok(other) => {
                log::warn!(
                    "Ignoring update to `{}` from another tab: expected a record, got {}",
                    self.key,
                    kind_of(&other)
                );
                return;
            }
            Err(e) => {
                log::warn!(
                    "Ignoring unparsable update to `{}` from another tab: {e}",
                    self.key
                );
                return;
            }
        };

        let incoming_timestamp = write_timestamp(&incoming);
        let local = store.get();
        let local_timestamp = write_timestamp(&local);
        if incoming_timestamp <= local_timestamp {
            log::debug!(
                "Discarding stale update to `{}` ({incoming_timestamp} <= {local_timestamp})",
                self.key
            );
            return;
        }

        let mut merged = match self.strategy.resolve(&incoming, &local) {
            Ok(merged) => merged,
            Err(e) => {
                log::error!("Failed to merge update to `{}` from another tab: {e}", self.key);
                return;
            }
        };
        merged.insert(TIMESTAMP_FIELD.to_string(), incoming_timestamp.into());

        let _remote = RemoteWrite::begin(&self.applying_remote);
        store.set(Update::Merge(merged));
    }
}

impl StoreLayer for CrossTabSync {
    fn attach(&self, store: &StateStore) {
        let inner: Weak<SyncInner> = Rc::downgrade(&self.inner);
        let store: WeakStore = store.downgrade();
        let listener = Rc::new(move |change: &StorageChange| {
            let (Some(inner), Some(store)) = (inner.upgrade(), store.upgrade()) else {
                return;
            };
            inner.receive(&store, change);
        });
        let subscription = self.inner.host.on_storage_change(listener);

        match subscription {
            Some(subscription) => {
                *self.inner.subscription.borrow_mut() = Some(subscription);
            }
            None => log::debug!(
                "No storage events in this context, `{}` will not sync across tabs",
                self.inner.key
            ),
        }
    }

    fn before_write(&self, update: &mut Update, current: &Record) {
        // only the remote write itself keeps the incoming timestamp; anything a subscriber
        // writes in response is a local write
        if self.inner.applying_remote.replace(false) {
            return;
        }
        // never move backwards, even if the wall clock does
        let stamp = self.inner.host.now_millis().max(write_timestamp(current));
        update
            .record_mut()
            .insert(TIMESTAMP_FIELD.to_string(), stamp.into());
    }

    fn owned_fields(&self) -> Vec<String> {
        vec![TIMESTAMP_FIELD.to_string()]
    }
}
