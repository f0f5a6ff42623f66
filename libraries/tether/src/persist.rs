//! Persists a store to one key of the shared storage partition.
//!
//! On attach the store is hydrated from that key. After every write a flush is scheduled once the
//! store has been quiet for `debounce_ms`; a write during the quiet period pushes the flush back,
//! so a burst of writes costs a single storage write holding the last value.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::error::ConfigError;
use crate::host::{Host, TimerId};
use crate::store::{Record, StateStore, StoreLayer, WeakStore};

pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PersistOptions {
    pub key: String,
    pub debounce_ms: u64,
    /// Only these fields (plus layer bookkeeping) are written to storage. `None` persists the
    /// whole record.
    pub fields: Option<Vec<String>>,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            key: String::new(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            fields: None,
        }
    }
}

impl PersistOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        if self.fields.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::NoPersistedFields(self.key.clone()));
        }
        Ok(())
    }
}

pub struct Persistence {
    inner: Rc<PersistInner>,
}

struct PersistInner {
    host: Rc<dyn Host>,
    options: PersistOptions,
    pending: Cell<Option<TimerId>>,
}

impl Persistence {
    pub fn new(host: Rc<dyn Host>, options: PersistOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            inner: Rc::new(PersistInner {
                host,
                options,
                pending: Cell::new(None),
            }),
        })
    }
}

impl PersistInner {
    fn read_persisted(&self) -> Option<Record> {
        let key = &self.options.key;
        let raw = match self.host.get_item(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::error!("Could not read persisted state for `{key}`: {e}");
                return None;
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(record)) => Some(record),
            Ok(other) => {
                log::warn!(
                    "Persisted state for `{key}` is not a record ({}), skipping hydration",
                    kind_of(&other)
                );
                None
            }
            Err(e) => {
                log::error!("Failed to parse persisted state for `{key}`: {e}");
                None
            }
        }
    }

    /// Layer bookkeeping (the write-timestamp) always travels with the listed fields.
    fn persisted_subset(&self, mut data: Record, store: &StateStore) -> Record {
        if let Some(fields) = &self.options.fields {
            let internal = store.internal_fields();
            data.retain(|field, _| fields.contains(field) || internal.contains(field));
        }
        data
    }

    fn schedule_flush(self: &Rc<Self>, store: WeakStore) {
        if let Some(timer) = self.pending.take() {
            self.host.clear_timeout(timer);
        }
        let this = Rc::downgrade(self);
        let timer = self.host.set_timeout(
            Duration::from_millis(self.options.debounce_ms),
            Box::new(move || {
                let (Some(this), Some(store)) = (this.upgrade(), store.upgrade()) else {
                    return;
                };
                this.pending.set(None);
                this.flush(&store);
            }),
        );
        self.pending.set(Some(timer));
    }

    fn flush(&self, store: &StateStore) {
        let key = &self.options.key;
        let data = self.persisted_subset(store.get(), store);
        let serialized = match serde_json::to_string(&data) {
            Ok(serialized) => serialized,
            Err(e) => {
                log::error!("Failed to serialize state for `{key}`: {e}");
                return;
            }
        };
        if let Err(e) = self.host.set_item(key, &serialized) {
            log::error!("Failed to persist state for `{key}`: {e}");
        }
    }
}

impl StoreLayer for Persistence {
    fn attach(&self, store: &StateStore) {
        if let Some(record) = self.inner.read_persisted() {
            log::debug!(
                "Hydrating `{}` with {} persisted fields",
                self.inner.options.key,
                record.len()
            );
            store.hydrate(self.inner.persisted_subset(record, store));
        }
    }

    fn after_write(&self, store: &StateStore) {
        self.inner.schedule_flush(store.downgrade());
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{SimulatedBrowser, SimulatedTab};
    use crate::store::{Update, record};
    use serde_json::json;

    fn persisted_store(tab: &SimulatedTab, options: PersistOptions) -> StateStore {
        let host: Rc<dyn Host> = Rc::new(tab.clone());
        StateStore::builder(record(json!({ "songs": [], "volume": 5 })))
            .layer(Persistence::new(host, options).unwrap())
            .build()
    }

    #[test]
    fn test_hydrates_from_storage() {
        let browser = SimulatedBrowser::new();
        browser.set_raw("player", r#"{"volume": 9, "muted": true}"#);
        let store = persisted_store(&browser.open_tab(), PersistOptions::new("player"));

        assert_eq!(
            store.get(),
            record(json!({ "songs": [], "volume": 9, "muted": true }))
        );
        // hydration is not a write
        assert_eq!(browser.pending_timers(), 0);
    }

    #[test]
    fn test_unusable_persisted_values_are_ignored() {
        for raw in ["not json {", "[1, 2, 3]", "null", "42", r#""text""#] {
            let browser = SimulatedBrowser::new();
            browser.set_raw("player", raw);
            let store = persisted_store(&browser.open_tab(), PersistOptions::new("player"));
            assert_eq!(
                store.get(),
                record(json!({ "songs": [], "volume": 5 })),
                "hydrated from {raw}"
            );
        }
    }

    #[test]
    fn test_burst_of_writes_flushes_once_with_last_value() {
        let browser = SimulatedBrowser::new();
        let store = persisted_store(&browser.open_tab(), PersistOptions::new("player"));

        for volume in 1..=5 {
            store.set(Update::Merge(record(json!({ "volume": volume }))));
            browser.advance(Duration::from_millis(100));
        }
        assert_eq!(browser.storage_writes(), 0);

        browser.advance(Duration::from_millis(DEFAULT_DEBOUNCE_MS));
        assert_eq!(browser.storage_writes(), 1);
        let persisted: Value =
            serde_json::from_str(&browser.storage_value("player").unwrap()).unwrap();
        assert_eq!(persisted, json!({ "songs": [], "volume": 5 }));
    }

    #[test]
    fn test_flush_is_a_full_overwrite() {
        let browser = SimulatedBrowser::new();
        browser.set_raw("player", r#"{"stale": true}"#);
        let store = persisted_store(&browser.open_tab(), PersistOptions::new("player"));

        store.set(Update::Replace(record(json!({ "volume": 1 }))));
        browser.advance(Duration::from_secs(1));

        assert_eq!(
            browser.storage_value("player").as_deref(),
            Some(r#"{"volume":1}"#)
        );
    }

    #[test]
    fn test_only_listed_fields_are_persisted() {
        let browser = SimulatedBrowser::new();
        browser.set_raw("player", r#"{"volume": 2, "songs": ["a"]}"#);
        let store = persisted_store(
            &browser.open_tab(),
            PersistOptions::new("player").fields(["volume"]),
        );
        // fields outside the persisted subset are not hydrated either
        assert_eq!(store.field::<Vec<String>>("songs"), Some(vec![]));

        store.set(Update::Merge(record(json!({ "volume": 3, "songs": ["b"] }))));
        browser.advance(Duration::from_secs(1));
        assert_eq!(
            browser.storage_value("player").as_deref(),
            Some(r#"{"volume":3}"#)
        );
    }

    #[test]
    fn test_failed_flush_leaves_memory_authoritative() {
        let browser = SimulatedBrowser::new();
        let store = persisted_store(&browser.open_tab(), PersistOptions::new("player"));
        browser.set_failing_writes(true);

        store.set(Update::Merge(record(json!({ "volume": 7 }))));
        browser.advance(Duration::from_secs(1));

        assert_eq!(browser.storage_value("player"), None);
        assert_eq!(store.field::<i64>("volume"), Some(7));

        // the next write after storage recovers persists everything
        browser.set_failing_writes(false);
        store.set(Update::Merge(record(json!({ "volume": 8 }))));
        browser.advance(Duration::from_secs(1));
        assert!(browser.storage_value("player").unwrap().contains(r#""volume":8"#));
    }

    #[test]
    fn test_invalid_options() {
        let browser = SimulatedBrowser::new();
        let host: Rc<dyn Host> = Rc::new(browser.open_tab());
        assert_eq!(
            Persistence::new(host.clone(), PersistOptions::default()).err(),
            Some(ConfigError::EmptyKey)
        );
        assert_eq!(
            Persistence::new(host, PersistOptions::new("k").fields(Vec::<String>::new())).err(),
            Some(ConfigError::NoPersistedFields("k".to_string()))
        );
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: PersistOptions = serde_json::from_str(r#"{"key": "songs"}"#).unwrap();
        assert_eq!(options, PersistOptions::new("songs"));
    }
}
