//! The pieces of the browser the engine depends on: a shared string key-value
//! partition (localStorage), the `storage` change notification other tabs
//! receive, timers, and a wall clock.

use std::rc::Rc;
use std::time::Duration;

use crate::error::HostError;

/// A storage change as another execution context sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

pub type StorageListener = Rc<dyn Fn(&StorageChange)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// Keeps a storage-change listener registered. Dropping it unregisters.
pub struct StorageSubscription {
    unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl StorageSubscription {
    pub fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for StorageSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for StorageSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSubscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

pub trait Host {
    fn get_item(&self, key: &str) -> Result<Option<String>, HostError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), HostError>;

    fn remove_item(&self, key: &str) -> Result<(), HostError>;

    /// Wall-clock milliseconds since the unix epoch.
    fn now_millis(&self) -> i64;

    /// Runs `callback` on a later turn of the event loop, never inline.
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId;

    fn clear_timeout(&self, timer: TimerId);

    /// Registers for changes made to the partition by *other* execution
    /// contexts. Returns `None` when the host has no window/storage concept
    /// (a worker, or a server-side render), in which case nothing is delivered.
    fn on_storage_change(&self, listener: StorageListener) -> Option<StorageSubscription>;
}
