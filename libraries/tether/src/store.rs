//! # StateStore
//! A mutable container for one record of application state. The value is kept in two parts:
//! a JSON data record, which is what gets persisted, snapshotted and synced between tabs, and a
//! table of named actions, which never leaves the process. Because the two parts are stored
//! separately, no serialization step can ever drop an action.
//!
//! Every write goes through the store's layers (persistence, cross-tab sync, ...) and then
//! notifies subscribers synchronously.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use slotmap::SlotMap;

pub type Record = serde_json::Map<String, Value>;

pub type Action = Rc<dyn Fn(&StateStore, Value)>;

/// Called after every write with `(current, previous)`.
pub type Listener = Rc<dyn Fn(&Record, &Record)>;

slotmap::new_key_type! {
    pub struct ListenerKey;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Shallow-merge the fields into the current record. Fields not mentioned are kept.
    Merge(Record),
    /// Swap out the whole data record. Actions are unaffected.
    Replace(Record),
}

impl Update {
    pub fn record(&self) -> &Record {
        match self {
            Update::Merge(record) | Update::Replace(record) => record,
        }
    }

    pub fn record_mut(&mut self) -> &mut Record {
        match self {
            Update::Merge(record) | Update::Replace(record) => record,
        }
    }

    fn apply(self, data: &mut Record) {
        match self {
            Update::Merge(partial) => {
                for (field, value) in partial {
                    data.insert(field, value);
                }
            }
            Update::Replace(record) => *data = record,
        }
    }
}

/// A middleware wrapped around the store's write function.
///
/// Layers run in the order they were added to the builder.
pub trait StoreLayer {
    /// Called once, after the store exists but before anyone else can see it.
    fn attach(&self, _store: &StateStore) {}

    /// Called with the store borrowed; must not read from or write to the store.
    fn before_write(&self, _update: &mut Update, _current: &Record) {}

    /// Called after the write has been applied and subscribers have run.
    fn after_write(&self, _store: &StateStore) {}

    /// Fields of the data record that belong to this layer's bookkeeping.
    fn owned_fields(&self) -> Vec<String> {
        Vec::new()
    }
}

struct State {
    data: Record,
    listeners: SlotMap<ListenerKey, Listener>,
}

struct Shared {
    state: RefCell<State>,
    actions: BTreeMap<String, Action>,
    layers: Vec<Rc<dyn StoreLayer>>,
}

/// Cheap to clone; all clones refer to the same store.
#[derive(Clone)]
pub struct StateStore {
    shared: Rc<Shared>,
}

#[derive(Clone)]
pub struct WeakStore {
    shared: Weak<Shared>,
}

impl WeakStore {
    pub fn upgrade(&self) -> Option<StateStore> {
        self.shared.upgrade().map(|shared| StateStore { shared })
    }
}

pub struct StoreBuilder {
    initial: Record,
    actions: BTreeMap<String, Action>,
    layers: Vec<Rc<dyn StoreLayer>>,
}

impl StoreBuilder {
    pub fn action(
        mut self,
        name: impl Into<String>,
        action: impl Fn(&StateStore, Value) + 'static,
    ) -> Self {
        self.actions.insert(name.into(), Rc::new(action));
        self
    }

    pub fn layer(mut self, layer: impl StoreLayer + 'static) -> Self {
        self.layers.push(Rc::new(layer));
        self
    }

    pub fn build(self) -> StateStore {
        let store = StateStore {
            shared: Rc::new(Shared {
                state: RefCell::new(State {
                    data: self.initial,
                    listeners: SlotMap::with_key(),
                }),
                actions: self.actions,
                layers: self.layers,
            }),
        };
        for layer in &store.shared.layers {
            layer.attach(&store);
        }
        store
    }
}

impl StateStore {
    pub fn builder(initial: Record) -> StoreBuilder {
        StoreBuilder {
            initial,
            actions: BTreeMap::new(),
            layers: Vec::new(),
        }
    }

    /// A store with no layers and no actions.
    pub fn new(initial: Record) -> Self {
        Self::builder(initial).build()
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn ptr_eq(&self, other: &StateStore) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    /// A copy of the current data record.
    pub fn get(&self) -> Record {
        self.shared.state.borrow().data.clone()
    }

    /// Reads from the current data record without copying it.
    /// `f` must not write to the store.
    pub fn select<T>(&self, f: impl FnOnce(&Record) -> T) -> T {
        f(&self.shared.state.borrow().data)
    }

    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let value = self.select(|data| data.get(name).cloned())?;
        serde_json::from_value(value)
            .inspect_err(|e| log::warn!("Field `{name}` has an unexpected shape: {e}"))
            .ok()
    }

    pub fn set(&self, mut update: Update) {
        {
            let state = self.shared.state.borrow();
            for layer in &self.shared.layers {
                layer.before_write(&mut update, &state.data);
            }
        }

        // never hold the borrow while listeners run: they are allowed to write again
        let (current, previous, listeners) = {
            let mut state = self.shared.state.borrow_mut();
            let previous = state.data.clone();
            update.apply(&mut state.data);
            let listeners: Vec<Listener> = state.listeners.values().cloned().collect();
            (state.data.clone(), previous, listeners)
        };

        for listener in listeners {
            listener(&current, &previous);
        }

        for layer in &self.shared.layers {
            layer.after_write(self);
        }
    }

    /// Builds the update from the current record, then writes it.
    pub fn set_with(&self, f: impl FnOnce(&Record) -> Update) {
        let update = self.select(f);
        self.set(update);
    }

    pub fn subscribe(&self, listener: impl Fn(&Record, &Record) + 'static) -> ListenerKey {
        self.shared
            .state
            .borrow_mut()
            .listeners
            .insert(Rc::new(listener))
    }

    pub fn unsubscribe(&self, key: ListenerKey) {
        self.shared.state.borrow_mut().listeners.remove(key);
    }

    /// Invokes a named action. Returns `false` if there is no such action.
    pub fn dispatch(&self, name: &str, args: Value) -> bool {
        let Some(action) = self.shared.actions.get(name).cloned() else {
            log::warn!("No action named `{name}` on this store");
            return false;
        };
        action(self, args);
        true
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.shared.actions.keys().map(String::as_str)
    }

    /// Fields of the data record that belong to a layer rather than to the application.
    pub fn internal_fields(&self) -> Vec<String> {
        self.shared
            .layers
            .iter()
            .flat_map(|layer| layer.owned_fields())
            .collect()
    }

    /// Merges `record` in without running layers or notifying anyone.
    /// Only meant for hydration while the store is being attached.
    pub(crate) fn hydrate(&self, record: Record) {
        Update::Merge(record).apply(&mut self.shared.state.borrow_mut().data);
    }

    /// Inserts any of `defaults` that the record is missing, silently.
    pub(crate) fn fill_missing(&self, defaults: Record) {
        let mut state = self.shared.state.borrow_mut();
        for (field, value) in defaults {
            state.data.entry(field).or_insert(value);
        }
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("StateStore")
            .field("data", &state.data)
            .field("actions", &self.shared.actions.keys().collect::<Vec<_>>())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// Builds a [`Record`] from a `json!` object literal. Anything that is not an object becomes an
/// empty record.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => {
            log::warn!("Expected a JSON object, got {other}");
            Record::new()
        }
    }
}
