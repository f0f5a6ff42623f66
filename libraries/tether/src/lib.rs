//! A state engine for apps that run in several browser tabs at once and talk to a server.
//!
//! Pieces:
//! 1. A [`StateStore`] holds one record of state plus named actions, and notifies subscribers
//!    after every write.
//! 2. [`Persistence`] writes the store to the host's shared storage (debounced) and hydrates it
//!    on startup.
//! 3. [`CrossTabSync`] stamps every write with a timestamp, and when another tab persists a newer
//!    copy, merges it in.
//! 4. [`MutationIntegration`] lets the network layer call named hooks before a request and after
//!    it succeeds or fails, with keyed snapshots to roll back to.
//! 5. [`OptimisticEntityStore`] keeps confirmed entities apart from staged creates, updates and
//!    removals, so a failed request can be undone without touching confirmed data.
//!
//! Everything the engine needs from the browser goes through the [`Host`] trait, so it runs the
//! same way against real `localStorage` as it does against [`simulation::SimulatedBrowser`].
//!
//! All of this is single-threaded, like the page it runs in.

pub mod entity;
pub mod error;
pub mod host;
pub mod mutation;
pub mod persist;
pub mod simulation;
pub mod store;
pub mod sync;

pub use entity::{Entity, OptimisticEntityStore, PendingChanges};
pub use error::{ConfigError, HookError, HostError, MergeError};
pub use host::{Host, StorageChange, StorageListener, StorageSubscription, TimerId};
pub use mutation::{
    ErrorContext, HookPayload, MutateContext, MutationHooks, MutationIntegration, MutationPhase,
    RemoteError, SuccessContext,
};
pub use persist::{PersistOptions, Persistence};
pub use store::{Action, ListenerKey, Record, StateStore, StoreBuilder, StoreLayer, Update, record};
pub use sync::{CrossTabSync, MergeStrategy, SyncOptions, TIMESTAMP_FIELD, write_timestamp};
