//! # OptimisticEntityStore
//! Confirmed records of one entity type (songs, workflow runs, ...) plus the changes that have
//! been applied optimistically but not yet confirmed by the server.
//!
//! Everything lives inside the wrapped [`StateStore`]'s record, so snapshots, persistence and
//! cross-tab sync see it like any other state:
//!
//! | field             | contents                                   |
//! |-------------------|--------------------------------------------|
//! | `entities`        | id -> confirmed record                     |
//! | `order`           | ids of confirmed records, in display order |
//! | `staged_creates`  | id -> full record awaiting commit          |
//! | `staged_updates`  | id -> partial diff awaiting commit         |
//! | `staged_removals` | ids awaiting deletion                      |
//!
//! An id holds at most one staged entry of each kind; staging again overwrites.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::store::{Record, StateStore, Update, record};

const ENTITIES: &str = "entities";
const ORDER: &str = "order";
const STAGED_CREATES: &str = "staged_creates";
const STAGED_UPDATES: &str = "staged_updates";
const STAGED_REMOVALS: &str = "staged_removals";

pub trait Entity: Serialize + DeserializeOwned + Clone + 'static {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PendingChanges {
    pub create: bool,
    pub update: bool,
    pub remove: bool,
}

impl PendingChanges {
    pub fn is_clean(&self) -> bool {
        !(self.create || self.update || self.remove)
    }
}

pub struct OptimisticEntityStore<E> {
    store: StateStore,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for OptimisticEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for OptimisticEntityStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticEntityStore")
            .field("store", &self.store)
            .finish()
    }
}

impl<E: Entity> OptimisticEntityStore<E> {
    /// The empty tables, for use as (part of) a store's initial record.
    pub fn initial_state() -> Record {
        record(json!({
            ENTITIES: {},
            ORDER: [],
            STAGED_CREATES: {},
            STAGED_UPDATES: {},
            STAGED_REMOVALS: [],
        }))
    }

    /// The fields holding confirmed data. Staged changes die with the page that made them, so
    /// these are the only ones worth persisting.
    pub fn canonical_fields() -> [&'static str; 2] {
        [ENTITIES, ORDER]
    }

    /// Any missing table is created empty, without counting as a write.
    pub fn new(store: StateStore) -> Self {
        store.fill_missing(Self::initial_state());
        Self {
            store,
            _entity: PhantomData,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn add_optimistic(&self, entity: &E) {
        let id = entity.id().to_string();
        let Some(value) = encode(entity) else {
            return;
        };
        self.store.set_with(|data| {
            let mut creates = object(data, STAGED_CREATES);
            creates.insert(id, value);
            Update::Merge(record(json!({ STAGED_CREATES: creates })))
        });
    }

    pub fn update_optimistic(&self, id: &str, diff: Record) {
        self.store.set_with(|data| {
            let mut updates = object(data, STAGED_UPDATES);
            updates.insert(id.to_string(), Value::Object(diff));
            Update::Merge(record(json!({ STAGED_UPDATES: updates })))
        });
    }

    pub fn remove_optimistic(&self, id: &str) {
        if self.pending(id).remove {
            return;
        }
        self.store.set_with(|data| {
            let mut removals = ids(data, STAGED_REMOVALS);
            removals.push(id.to_string());
            Update::Merge(record(json!({ STAGED_REMOVALS: removals })))
        });
    }

    /// Folds whatever is staged for `id` into the confirmed records: the create first, then the
    /// update, then the removal.
    pub fn commit_optimistic(&self, id: &str) {
        if self.pending(id).is_clean() {
            log::debug!("Nothing staged for `{id}`, nothing to commit");
            return;
        }

        self.store.set_with(|data| {
            let mut entities = object(data, ENTITIES);
            let mut order = ids(data, ORDER);
            let mut creates = object(data, STAGED_CREATES);
            let mut updates = object(data, STAGED_UPDATES);
            let mut removals = ids(data, STAGED_REMOVALS);

            if let Some(created) = creates.remove(id) {
                entities.insert(id.to_string(), created);
                if !order.iter().any(|existing| existing == id) {
                    order.push(id.to_string());
                }
            }

            if let Some(diff) = updates.remove(id) {
                match (entities.get_mut(id), diff) {
                    (Some(Value::Object(current)), Value::Object(diff)) => {
                        for (field, value) in diff {
                            current.insert(field, value);
                        }
                    }
                    (None, _) => {
                        log::debug!("Dropping update to `{id}`, which has no confirmed record")
                    }
                    _ => log::warn!("Staged update to `{id}` is not a record, dropping it"),
                }
            }

            if let Some(position) = removals.iter().position(|removal| removal == id) {
                removals.remove(position);
                entities.remove(id);
                order.retain(|existing| existing != id);
            }

            Update::Merge(record(json!({
                ENTITIES: entities,
                ORDER: order,
                STAGED_CREATES: creates,
                STAGED_UPDATES: updates,
                STAGED_REMOVALS: removals,
            })))
        });
    }

    /// Discards everything staged for `id`. Confirmed records are untouched.
    pub fn rollback_optimistic(&self, id: &str) {
        if self.pending(id).is_clean() {
            return;
        }
        self.store.set_with(|data| {
            let mut creates = object(data, STAGED_CREATES);
            let mut updates = object(data, STAGED_UPDATES);
            let mut removals = ids(data, STAGED_REMOVALS);
            creates.remove(id);
            updates.remove(id);
            removals.retain(|removal| removal != id);
            Update::Merge(record(json!({
                STAGED_CREATES: creates,
                STAGED_UPDATES: updates,
                STAGED_REMOVALS: removals,
            })))
        });
    }

    /// Replaces the confirmed records wholesale, e.g. after fetching them from the server.
    /// Staged changes are kept.
    pub fn set_canonical(&self, entities: impl IntoIterator<Item = E>) {
        let mut canonical = Record::new();
        let mut order = Vec::new();
        for entity in entities {
            let Some(value) = encode(&entity) else {
                continue;
            };
            let id = entity.id().to_string();
            if canonical.insert(id.clone(), value).is_none() {
                order.push(id);
            }
        }
        self.store
            .set(Update::Merge(record(json!({ ENTITIES: canonical, ORDER: order }))));
    }

    pub fn pending(&self, id: &str) -> PendingChanges {
        self.store.select(|data| PendingChanges {
            create: has_key(data, STAGED_CREATES, id),
            update: has_key(data, STAGED_UPDATES, id),
            remove: data
                .get(STAGED_REMOVALS)
                .and_then(Value::as_array)
                .is_some_and(|removals| removals.iter().any(|removal| removal == id)),
        })
    }

    pub fn order(&self) -> Vec<String> {
        self.store.select(|data| ids(data, ORDER))
    }

    /// The confirmed record, ignoring anything staged.
    pub fn canonical(&self, id: &str) -> Option<E> {
        self.store
            .select(|data| data.get(ENTITIES)?.get(id).cloned())
            .and_then(decode)
    }

    pub fn canonical_items(&self) -> Vec<E> {
        self.store.select(|data| {
            let entities = data.get(ENTITIES);
            ids(data, ORDER)
                .iter()
                .filter_map(|id| entities?.get(id).cloned())
                .filter_map(decode)
                .collect()
        })
    }

    /// The record as the user should see it: staged create over confirmed record, staged update
    /// applied on top, and nothing at all if a removal is staged.
    pub fn get(&self, id: &str) -> Option<E> {
        self.store.select(|data| optimistic_value(data, id)).and_then(decode)
    }

    /// Every record as the user should see it: confirmed ones in order, then staged creates.
    pub fn items(&self) -> Vec<E> {
        self.store.select(|data| {
            let mut ids = ids(data, ORDER);
            if let Some(Value::Object(creates)) = data.get(STAGED_CREATES) {
                for id in creates.keys() {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
            }
            ids.iter()
                .filter_map(|id| optimistic_value(data, id))
                .filter_map(decode)
                .collect()
        })
    }
}

fn optimistic_value(data: &Record, id: &str) -> Option<Value> {
    let removing = data
        .get(STAGED_REMOVALS)
        .and_then(Value::as_array)
        .is_some_and(|removals| removals.iter().any(|removal| removal == id));
    if removing {
        return None;
    }

    let mut value = data
        .get(STAGED_CREATES)
        .and_then(|creates| creates.get(id))
        .or_else(|| data.get(ENTITIES).and_then(|entities| entities.get(id)))
        .cloned()?;

    if let (Value::Object(current), Some(Value::Object(diff))) = (
        &mut value,
        data.get(STAGED_UPDATES).and_then(|updates| updates.get(id)),
    ) {
        for (field, changed) in diff {
            current.insert(field.clone(), changed.clone());
        }
    }
    Some(value)
}

fn object(data: &Record, field: &str) -> Record {
    match data.get(field) {
        Some(Value::Object(map)) => map.clone(),
        _ => Record::new(),
    }
}

fn ids(data: &Record, field: &str) -> Vec<String> {
    data.get(field)
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn has_key(data: &Record, field: &str, id: &str) -> bool {
    data.get(field)
        .and_then(Value::as_object)
        .is_some_and(|map| map.contains_key(id))
}

fn encode<E: Entity>(entity: &E) -> Option<Value> {
    match serde_json::to_value(entity) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) => {
            log::error!("Entity `{}` does not serialize to a record", entity.id());
            None
        }
        Err(e) => {
            log::error!("Failed to serialize entity `{}`: {e}", entity.id());
            None
        }
    }
}

fn decode<E: DeserializeOwned>(value: Value) -> Option<E> {
    serde_json::from_value(value)
        .inspect_err(|e| log::warn!("Skipping record that no longer deserializes: {e}"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Song {
        id: String,
        title: String,
        plays: u32,
    }

    impl Entity for Song {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn song(id: &str, title: &str) -> Song {
        Song {
            id: id.to_string(),
            title: title.to_string(),
            plays: 0,
        }
    }

    fn songs() -> OptimisticEntityStore<Song> {
        OptimisticEntityStore::new(StateStore::new(Record::new()))
    }

    fn diff(value: Value) -> Record {
        record(value)
    }

    #[test]
    fn test_missing_tables_are_created() {
        let store = StateStore::new(record(json!({ "entities": { "a": {
            "id": "a", "title": "kept", "plays": 1
        } } })));
        let songs = OptimisticEntityStore::<Song>::new(store.clone());
        assert_eq!(songs.canonical("a").unwrap().title, "kept");
        for field in ["order", "staged_creates", "staged_updates", "staged_removals"] {
            assert!(store.get().contains_key(field), "{field} missing");
        }
    }

    #[test]
    fn test_create_commit() {
        let songs = songs();
        let record = song("a", "Intro");
        songs.add_optimistic(&record);

        assert_eq!(songs.canonical("a"), None);
        assert_eq!(songs.get("a"), Some(record.clone()));
        assert!(songs.pending("a").create);

        songs.commit_optimistic("a");
        assert_eq!(songs.canonical("a"), Some(record.clone()));
        assert_eq!(songs.order(), vec!["a"]);
        assert!(songs.pending("a").is_clean());

        // committing the same create again never duplicates the id
        songs.add_optimistic(&record);
        songs.commit_optimistic("a");
        songs.commit_optimistic("a");
        assert_eq!(songs.order(), vec!["a"]);
    }

    #[test]
    fn test_update_commit_merges_one_field() {
        let songs = songs();
        songs.set_canonical([Song {
            plays: 3,
            ..song("a", "Intro")
        }]);

        songs.update_optimistic("a", diff(json!({ "title": "Outro" })));
        assert_eq!(songs.canonical("a").unwrap().title, "Intro");
        assert_eq!(songs.get("a").unwrap().title, "Outro");

        songs.commit_optimistic("a");
        assert_eq!(
            songs.canonical("a"),
            Some(Song {
                plays: 3,
                ..song("a", "Outro")
            })
        );
    }

    #[test]
    fn test_newer_update_overwrites_staged_one() {
        let songs = songs();
        songs.set_canonical([song("a", "Intro")]);
        songs.update_optimistic("a", diff(json!({ "title": "first", "plays": 9 })));
        songs.update_optimistic("a", diff(json!({ "title": "second" })));
        songs.commit_optimistic("a");

        assert_eq!(songs.canonical("a"), Some(song("a", "second")));
    }

    #[test]
    fn test_update_on_missing_record_is_a_no_op() {
        let songs = songs();
        songs.set_canonical([song("a", "Intro")]);
        let before = songs.store().get()["entities"].clone();

        songs.update_optimistic("ghost", diff(json!({ "title": "boo" })));
        assert_eq!(songs.get("ghost"), None);
        songs.commit_optimistic("ghost");

        assert_eq!(songs.store().get()["entities"], before);
        assert!(songs.pending("ghost").is_clean());
    }

    #[test]
    fn test_create_then_update_then_commit() {
        let songs = songs();
        songs.add_optimistic(&song("a", "Draft"));
        songs.update_optimistic("a", diff(json!({ "plays": 2 })));
        assert_eq!(songs.get("a").unwrap().plays, 2);
        assert_eq!(
            songs.pending("a"),
            PendingChanges {
                create: true,
                update: true,
                remove: false
            }
        );

        songs.commit_optimistic("a");
        assert_eq!(
            songs.canonical("a"),
            Some(Song {
                plays: 2,
                ..song("a", "Draft")
            })
        );
    }

    #[test]
    fn test_create_then_remove_nets_to_absent() {
        let songs = songs();
        songs.add_optimistic(&song("a", "Gone"));
        songs.remove_optimistic("a");
        assert_eq!(songs.get("a"), None);

        songs.commit_optimistic("a");
        assert_eq!(songs.canonical("a"), None);
        assert!(songs.order().is_empty());
        assert!(songs.pending("a").is_clean());
    }

    #[test]
    fn test_remove_commit() {
        let songs = songs();
        songs.set_canonical([song("a", "A"), song("b", "B"), song("c", "C")]);
        songs.remove_optimistic("b");
        songs.remove_optimistic("b");
        assert_eq!(songs.items().len(), 2);
        assert_eq!(songs.canonical_items().len(), 3);

        songs.commit_optimistic("b");
        assert_eq!(songs.order(), vec!["a", "c"]);
        assert_eq!(songs.canonical("b"), None);
    }

    #[test]
    fn test_remove_then_rollback_leaves_canonical_state() {
        let songs = songs();
        songs.set_canonical([song("a", "A"), song("b", "B")]);
        let before = songs.canonical_items();

        songs.remove_optimistic("a");
        songs.rollback_optimistic("a");

        assert_eq!(songs.canonical_items(), before);
        assert_eq!(songs.items(), before);
        assert!(songs.pending("a").is_clean());
    }

    #[test]
    fn test_rollback_discards_every_kind_of_stage() {
        let songs = songs();
        songs.set_canonical([song("a", "A")]);
        songs.add_optimistic(&song("a", "replacement"));
        songs.update_optimistic("a", diff(json!({ "plays": 5 })));
        songs.remove_optimistic("a");

        songs.rollback_optimistic("a");
        songs.rollback_optimistic("a");
        songs.rollback_optimistic("never-staged");

        assert!(songs.pending("a").is_clean());
        assert_eq!(songs.get("a"), Some(song("a", "A")));
    }

    #[test]
    fn test_items_view_order() {
        let songs = songs();
        songs.set_canonical([song("b", "B"), song("a", "A")]);
        songs.add_optimistic(&song("c", "C"));
        songs.update_optimistic("a", diff(json!({ "title": "A2" })));
        songs.remove_optimistic("b");

        let titles: Vec<_> = songs.items().into_iter().map(|song| song.title).collect();
        assert_eq!(titles, vec!["A2", "C"]);
    }

    #[test]
    fn test_set_canonical_keeps_staged_changes() {
        let songs = songs();
        songs.add_optimistic(&song("new", "New"));
        songs.set_canonical([song("a", "A"), song("a", "A again")]);

        assert_eq!(songs.order(), vec!["a"]);
        assert_eq!(songs.canonical("a").unwrap().title, "A again");
        assert!(songs.pending("new").create);
    }

    #[test]
    fn test_records_that_no_longer_deserialize_are_skipped() {
        let store = StateStore::new(record(json!({
            "entities": {
                "a": { "id": "a", "title": "ok", "plays": 0 },
                "b": { "id": "b", "title": 7 }
            },
            "order": ["a", "b"]
        })));
        let songs = OptimisticEntityStore::<Song>::new(store);
        assert_eq!(songs.canonical_items(), vec![song("a", "ok")]);
        assert_eq!(songs.canonical("b"), None);
    }
}
