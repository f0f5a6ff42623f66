//! Named mutation lifecycle hooks and keyed snapshots around a [`StateStore`].
//!
//! The network layer owns each request and calls [`MutationIntegration::execute_mutation_hook`]
//! three times: before dispatch, on success and on failure. The hooks registered for that
//! mutation stage optimistic changes, snapshot state, and commit or roll back. Nothing here ever
//! fails back into the request lifecycle: missing registrations and missing snapshots are no-ops,
//! and a failing hook is logged.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde_json::Value;

use crate::error::HookError;
use crate::store::{Record, StateStore, Update};

pub type HookFuture = LocalBoxFuture<'static, Result<(), HookError>>;

type MutateHook = Rc<dyn Fn(MutateContext) -> HookFuture>;
type SuccessHook = Rc<dyn Fn(SuccessContext) -> HookFuture>;
type ErrorHook = Rc<dyn Fn(ErrorContext) -> HookFuture>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationPhase {
    OnMutate,
    OnSuccess,
    OnError,
}

impl std::fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationPhase::OnMutate => write!(f, "onMutate"),
            MutationPhase::OnSuccess => write!(f, "onSuccess"),
            MutationPhase::OnError => write!(f, "onError"),
        }
    }
}

/// The failure a remote operation ended with, as handed over by the network layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

/// What the caller knows at each point of the request lifecycle.
#[derive(Debug, Clone)]
pub enum HookPayload {
    Mutate { variables: Value },
    Success { data: Value, variables: Value },
    Error { error: RemoteError, variables: Value },
}

impl HookPayload {
    pub fn phase(&self) -> MutationPhase {
        match self {
            HookPayload::Mutate { .. } => MutationPhase::OnMutate,
            HookPayload::Success { .. } => MutationPhase::OnSuccess,
            HookPayload::Error { .. } => MutationPhase::OnError,
        }
    }
}

pub struct MutateContext {
    pub variables: Value,
    /// The store's record without layer bookkeeping.
    pub state: Record,
    integration: MutationIntegration,
}

impl MutateContext {
    pub fn create_snapshot(&self, id: &str) {
        self.integration.create_snapshot(id);
    }
}

pub struct SuccessContext {
    pub data: Value,
    pub variables: Value,
    pub state: Record,
    integration: MutationIntegration,
}

impl SuccessContext {
    /// The snapshot is no longer needed once the server has confirmed the change.
    pub fn clear_snapshot(&self, id: &str) {
        self.integration.clear_snapshot(id);
    }
}

pub struct ErrorContext {
    pub error: RemoteError,
    pub variables: Value,
    pub state: Record,
    integration: MutationIntegration,
}

impl ErrorContext {
    pub fn rollback(&self, id: &str) {
        self.integration.rollback_to_snapshot(id);
    }

    /// Forgets the snapshot without writing it back.
    pub fn clear_snapshot(&self, id: &str) {
        self.integration.clear_snapshot(id);
    }
}

/// The hooks for one mutation. Every phase is optional.
#[derive(Clone, Default)]
pub struct MutationHooks {
    on_mutate: Option<MutateHook>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
}

impl MutationHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_mutate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(MutateContext) -> Fut + 'static,
        Fut: Future<Output = Result<(), HookError>> + 'static,
    {
        self.on_mutate = Some(Rc::new(move |context| hook(context).boxed_local()));
        self
    }

    pub fn on_success<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SuccessContext) -> Fut + 'static,
        Fut: Future<Output = Result<(), HookError>> + 'static,
    {
        self.on_success = Some(Rc::new(move |context| hook(context).boxed_local()));
        self
    }

    pub fn on_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ErrorContext) -> Fut + 'static,
        Fut: Future<Output = Result<(), HookError>> + 'static,
    {
        self.on_error = Some(Rc::new(move |context| hook(context).boxed_local()));
        self
    }
}

impl std::fmt::Debug for MutationHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationHooks")
            .field("on_mutate", &self.on_mutate.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Cheap to clone. Registrations and snapshots belong to this instance alone, so two stores never
/// see each other's mutations.
#[derive(Clone)]
pub struct MutationIntegration {
    inner: Rc<IntegrationInner>,
}

struct IntegrationInner {
    store: StateStore,
    registrations: RefCell<HashMap<String, MutationHooks>>,
    snapshots: RefCell<HashMap<String, Record>>,
    hidden_fields: Vec<String>,
}

impl MutationIntegration {
    pub fn new(store: StateStore) -> Self {
        Self::with_hidden_fields(store, Vec::<String>::new())
    }

    /// Like [`MutationIntegration::new`], but `hidden_fields` are also kept out of snapshots and
    /// hook state, on top of the fields the store's layers own.
    pub fn with_hidden_fields<I, S>(store: StateStore, hidden_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Rc::new(IntegrationInner {
                store,
                registrations: RefCell::new(HashMap::new()),
                snapshots: RefCell::new(HashMap::new()),
                hidden_fields: hidden_fields.into_iter().map(Into::into).collect(),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Replaces whatever was registered under `key` before.
    pub fn register_mutation(&self, key: impl Into<String>, hooks: MutationHooks) {
        let key = key.into();
        if let Some(previous) = self
            .inner
            .registrations
            .borrow_mut()
            .insert(key.clone(), hooks)
        {
            log::debug!("Replaced hooks for mutation `{key}` ({previous:?})");
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.inner.registrations.borrow().contains_key(key)
    }

    /// The store's current record minus layer bookkeeping and hidden fields.
    pub fn user_state(&self) -> Record {
        let mut state = self.inner.store.get();
        for field in self.inner.store.internal_fields() {
            state.remove(&field);
        }
        for field in &self.inner.hidden_fields {
            state.remove(field);
        }
        state
    }

    /// Overwrites any snapshot already stored under `id`.
    pub fn create_snapshot(&self, id: &str) {
        let snapshot = self.user_state();
        self.inner
            .snapshots
            .borrow_mut()
            .insert(id.to_string(), snapshot);
    }

    /// Writes the snapshot back (fields added since are left alone) and forgets it.
    pub fn rollback_to_snapshot(&self, id: &str) {
        let snapshot = self.inner.snapshots.borrow_mut().remove(id);
        match snapshot {
            Some(snapshot) => self.inner.store.set(Update::Merge(snapshot)),
            None => log::warn!("No snapshot `{id}` to roll back to"),
        }
    }

    pub fn clear_snapshot(&self, id: &str) {
        self.inner.snapshots.borrow_mut().remove(id);
    }

    pub fn has_snapshot(&self, id: &str) -> bool {
        self.inner.snapshots.borrow().contains_key(id)
    }

    /// Runs the hook registered for `key` that matches the payload's phase and waits for it.
    ///
    /// Never fails: an unregistered key or a missing phase does nothing, and an error or panic
    /// from the hook is logged and swallowed.
    pub async fn execute_mutation_hook(&self, key: &str, payload: HookPayload) {
        let phase = payload.phase();
        let hooks = self.inner.registrations.borrow().get(key).cloned();
        let Some(hooks) = hooks else {
            if cfg!(debug_assertions) {
                log::debug!("No mutation registered as `{key}`, skipping {phase}");
            }
            return;
        };

        let state = self.user_state();
        // the hook itself is only called once polled, so a panic in its synchronous part is
        // caught below too
        let run: HookFuture = match payload {
            HookPayload::Mutate { variables } => {
                let Some(hook) = hooks.on_mutate else {
                    return;
                };
                let context = MutateContext {
                    variables,
                    state,
                    integration: self.clone(),
                };
                async move { hook(context).await }.boxed_local()
            }
            HookPayload::Success { data, variables } => {
                let Some(hook) = hooks.on_success else {
                    return;
                };
                let context = SuccessContext {
                    data,
                    variables,
                    state,
                    integration: self.clone(),
                };
                async move { hook(context).await }.boxed_local()
            }
            HookPayload::Error { error, variables } => {
                let Some(hook) = hooks.on_error else {
                    return;
                };
                let context = ErrorContext {
                    error,
                    variables,
                    state,
                    integration: self.clone(),
                };
                async move { hook(context).await }.boxed_local()
            }
        };

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("{phase} hook for mutation `{key}` failed: {e}"),
            Err(_) => log::error!("{phase} hook for mutation `{key}` panicked"),
        }
    }
}

impl std::fmt::Debug for MutationIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut registrations: Vec<String> =
            self.inner.registrations.borrow().keys().cloned().collect();
        registrations.sort();
        f.debug_struct("MutationIntegration")
            .field("registrations", &registrations)
            .field("snapshots", &self.inner.snapshots.borrow().len())
            .finish()
    }
}
