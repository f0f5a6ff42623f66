use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tether::{
    CrossTabSync, Entity, HookError, Host, ListenerKey, MutateContext, MutationHooks,
    MutationIntegration, OptimisticEntityStore, PersistOptions, Persistence, Record, StateStore,
    SyncOptions,
};

use crate::{StudioConfig, StudioError};

/// One collection of entities, persisted under its own storage key and synced with the same
/// collection in every other tab.
pub struct DomainStore<E> {
    name: &'static str,
    host: Rc<dyn Host>,
    items: OptimisticEntityStore<E>,
    mutations: MutationIntegration,
}

impl<E: Entity> DomainStore<E> {
    pub fn open(
        host: Rc<dyn Host>,
        config: &StudioConfig,
        name: &'static str,
    ) -> Result<Self, StudioError> {
        let key = config.storage_key(name);

        // staged changes belong to the tab that made them, only confirmed records are shared
        let persist = PersistOptions::new(key.clone())
            .debounce(Duration::from_millis(config.debounce_ms))
            .fields(OptimisticEntityStore::<E>::canonical_fields());
        let sync = SyncOptions {
            key,
            strategy: config.strategy.clone(),
        };

        let store = StateStore::builder(OptimisticEntityStore::<E>::initial_state())
            .layer(Persistence::new(host.clone(), persist)?)
            .layer(CrossTabSync::from_options(host.clone(), &sync)?)
            .build();

        let items = OptimisticEntityStore::new(store.clone());
        log::info!(
            "Opened `{name}` with {} confirmed records",
            items.order().len()
        );
        Ok(Self {
            name,
            host,
            items,
            // a snapshot written back must never undo records confirmed after it was taken
            mutations: MutationIntegration::with_hidden_fields(
                store,
                OptimisticEntityStore::<E>::canonical_fields(),
            ),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn host(&self) -> &Rc<dyn Host> {
        &self.host
    }

    pub fn items(&self) -> &OptimisticEntityStore<E> {
        &self.items
    }

    pub fn mutations(&self) -> &MutationIntegration {
        &self.mutations
    }

    pub fn store(&self) -> &StateStore {
        self.items.store()
    }

    /// `callback` runs after every change to the collection, local or from another tab.
    pub fn subscribe(&self, callback: impl Fn() + 'static) -> ListenerKey {
        self.store().subscribe(move |_, _| callback())
    }

    pub fn unsubscribe(&self, key: ListenerKey) {
        self.store().unsubscribe(key)
    }

    /// Registers `key` as an optimistic mutation on one entity:
    /// - onMutate snapshots the collection, then lets `stage` stage the change,
    /// - onSuccess folds the server's copy (if `data` is one) into the staged change and commits,
    /// - onError discards whatever is still staged for the entity and drops the snapshot.
    ///
    /// Failures never restore the snapshot, since that would also undo the staged changes of
    /// other mutations still in flight.
    ///
    /// The entity is named by the `id` field of the mutation's variables.
    pub fn register_optimistic<S>(&self, key: &'static str, stage: S)
    where
        S: Fn(&OptimisticEntityStore<E>, &str, Value) -> Result<(), HookError> + 'static,
    {
        let stage = Rc::new(stage);
        let staging = self.items.clone();
        let committing = self.items.clone();
        let discarding = self.items.clone();

        let hooks = MutationHooks::new()
            .on_mutate(move |context: MutateContext| {
                let items = staging.clone();
                let stage = stage.clone();
                async move {
                    let id = entity_id(&context.variables)?;
                    context.create_snapshot(&snapshot_id(key, &id));
                    stage(&items, &id, context.variables)
                }
            })
            .on_success(move |context| {
                let items = committing.clone();
                async move {
                    let id = entity_id(&context.variables)?;
                    if let Some(confirmed) = server_copy::<E>(&context.data, &id) {
                        if !items.pending(&id).remove {
                            items.update_optimistic(&id, confirmed);
                        }
                    }
                    items.commit_optimistic(&id);
                    context.clear_snapshot(&snapshot_id(key, &id));
                    Ok(())
                }
            })
            .on_error(move |context| {
                let items = discarding.clone();
                async move {
                    let id = entity_id(&context.variables)?;
                    log::warn!("`{key}` failed for `{id}`: {}", context.error);
                    items.rollback_optimistic(&id);
                    context.clear_snapshot(&snapshot_id(key, &id));
                    Ok(())
                }
            });

        self.mutations.register_mutation(key, hooks);
    }
}

fn snapshot_id(key: &str, id: &str) -> String {
    format!("{key}:{id}")
}

fn entity_id(variables: &Value) -> Result<String, HookError> {
    variables
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "mutation variables carry no `id`".into())
}

/// `data` as a full record of entity `id`, if that is what the server sent back.
fn server_copy<E: Entity>(data: &Value, id: &str) -> Option<Record> {
    let entity = serde_json::from_value::<E>(data.clone()).ok()?;
    if entity.id() != id {
        log::warn!(
            "Server confirmed `{}` while `{id}` was expected, ignoring its copy",
            entity.id()
        );
        return None;
    }
    match serde_json::to_value(&entity) {
        Ok(Value::Object(record)) => Some(record),
        _ => None,
    }
}
