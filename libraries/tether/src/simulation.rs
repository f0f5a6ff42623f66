//! A deterministic stand-in for a browser: one shared storage partition, any number of tabs,
//! a virtual clock and a single event loop they all share.
//!
//! Nothing runs until the test drives the loop with [`SimulatedBrowser::run_until_idle`] or
//! [`SimulatedBrowser::advance`], which mirrors how timers and `storage` events in a real
//! browser only ever fire on a later turn.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use slotmap::SlotMap;

use crate::error::HostError;
use crate::host::{Host, StorageChange, StorageListener, StorageSubscription, TimerId};

slotmap::new_key_type! {
    struct ListenerSlot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(u32);

type Task = Box<dyn FnOnce()>;

struct Browser {
    now_millis: i64,
    storage: BTreeMap<String, String>,
    timers: BTreeMap<(i64, u64), Task>,
    timer_deadlines: HashMap<u64, i64>,
    next_timer: u64,
    tasks: VecDeque<Task>,
    listeners: SlotMap<ListenerSlot, (TabId, StorageListener)>,
    next_tab: u32,
    failing_writes: bool,
    storage_writes: usize,
}

impl Browser {
    fn queue_change(&mut self, origin: Option<TabId>, change: StorageChange) {
        let recipients: Vec<StorageListener> = self
            .listeners
            .values()
            .filter(|(tab, _)| Some(*tab) != origin)
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in recipients {
            let change = change.clone();
            self.tasks.push_back(Box::new(move || listener(&change)));
        }
    }
}

#[derive(Clone)]
pub struct SimulatedBrowser {
    inner: Rc<RefCell<Browser>>,
}

/// 2024-01-01T00:00:00Z
const DEFAULT_START_MILLIS: i64 = 1_704_067_200_000;

impl Default for SimulatedBrowser {
    fn default() -> Self {
        Self::starting_at_millis(DEFAULT_START_MILLIS)
    }
}

impl SimulatedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self::starting_at_millis(start.timestamp_millis())
    }

    pub fn starting_at_millis(now_millis: i64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Browser {
                now_millis,
                storage: BTreeMap::new(),
                timers: BTreeMap::new(),
                timer_deadlines: HashMap::new(),
                next_timer: 0,
                tasks: VecDeque::new(),
                listeners: SlotMap::with_key(),
                next_tab: 0,
                failing_writes: false,
                storage_writes: 0,
            })),
        }
    }

    pub fn open_tab(&self) -> SimulatedTab {
        self.open(true)
    }

    /// A context without a window, like a worker: storage events are never delivered to it.
    pub fn open_windowless_tab(&self) -> SimulatedTab {
        self.open(false)
    }

    fn open(&self, windowed: bool) -> SimulatedTab {
        let mut browser = self.inner.borrow_mut();
        let id = TabId(browser.next_tab);
        browser.next_tab += 1;
        SimulatedTab {
            browser: self.clone(),
            id,
            windowed,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_default()
    }

    pub fn now_millis(&self) -> i64 {
        self.inner.borrow().now_millis
    }

    /// Moves the clock without running anything.
    pub fn set_now_millis(&self, now_millis: i64) {
        self.inner.borrow_mut().now_millis = now_millis;
    }

    /// The raw value currently held in the shared partition.
    pub fn storage_value(&self, key: &str) -> Option<String> {
        self.inner.borrow().storage.get(key).cloned()
    }

    /// Writes straight into the partition without notifying any tab, as if it had been
    /// left there by a previous page load.
    pub fn set_raw(&self, key: &str, value: &str) {
        self.inner
            .borrow_mut()
            .storage
            .insert(key.to_string(), value.to_string());
    }

    /// Delivers a storage event to every listening tab on the next turn, without touching the
    /// partition. Lets tests control arrival order and payloads precisely.
    pub fn inject_storage_change(&self, key: &str, new_value: Option<&str>) {
        self.inner.borrow_mut().queue_change(
            None,
            StorageChange {
                key: key.to_string(),
                new_value: new_value.map(str::to_string),
            },
        );
    }

    /// While set, every write to the partition fails as if the quota were exhausted.
    pub fn set_failing_writes(&self, failing: bool) {
        self.inner.borrow_mut().failing_writes = failing;
    }

    /// Number of successful writes to the partition so far.
    pub fn storage_writes(&self) -> usize {
        self.inner.borrow().storage_writes
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.borrow().timers.len()
    }

    /// Runs queued events and due timers until there is nothing left to do right now.
    pub fn run_until_idle(&self) {
        loop {
            // take the task out first so the callback can schedule more work
            let next = {
                let mut browser = self.inner.borrow_mut();
                match browser.tasks.pop_front() {
                    Some(task) => Some(task),
                    None => {
                        let now = browser.now_millis;
                        let due = browser
                            .timers
                            .first_key_value()
                            .map(|(key, _)| *key)
                            .filter(|(deadline, _)| *deadline <= now);
                        due.and_then(|key| {
                            browser.timer_deadlines.remove(&key.1);
                            browser.timers.remove(&key)
                        })
                    }
                }
            };
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Moves the clock forward by `by`, firing timers at their deadlines along the way.
    pub fn advance(&self, by: Duration) {
        let target = self.now_millis() + by.as_millis() as i64;
        loop {
            self.run_until_idle();
            let next_deadline = {
                let browser = self.inner.borrow();
                browser
                    .timers
                    .first_key_value()
                    .map(|((deadline, _), _)| *deadline)
                    .filter(|deadline| *deadline <= target)
            };
            match next_deadline {
                Some(deadline) => self.set_now_millis(deadline.max(self.now_millis())),
                None => break,
            }
        }
        self.set_now_millis(target.max(self.now_millis()));
        self.run_until_idle();
    }
}

/// One execution context inside a [`SimulatedBrowser`].
#[derive(Clone)]
pub struct SimulatedTab {
    browser: SimulatedBrowser,
    id: TabId,
    windowed: bool,
}

impl SimulatedTab {
    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn browser(&self) -> &SimulatedBrowser {
        &self.browser
    }

    fn write(&self, key: &str, new_value: Option<&str>) -> Result<(), HostError> {
        let mut browser = self.browser.inner.borrow_mut();
        if browser.failing_writes {
            return Err(HostError::QuotaExceeded {
                key: key.to_string(),
            });
        }
        match new_value {
            Some(value) => {
                browser.storage.insert(key.to_string(), value.to_string());
            }
            None => {
                browser.storage.remove(key);
            }
        }
        browser.storage_writes += 1;
        browser.queue_change(
            Some(self.id),
            StorageChange {
                key: key.to_string(),
                new_value: new_value.map(str::to_string),
            },
        );
        Ok(())
    }
}

impl Host for SimulatedTab {
    fn get_item(&self, key: &str) -> Result<Option<String>, HostError> {
        Ok(self.browser.storage_value(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.write(key, Some(value))
    }

    fn remove_item(&self, key: &str) -> Result<(), HostError> {
        self.write(key, None)
    }

    fn now_millis(&self) -> i64 {
        self.browser.now_millis()
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let mut browser = self.browser.inner.borrow_mut();
        let id = browser.next_timer;
        browser.next_timer += 1;
        let deadline = browser.now_millis + delay.as_millis() as i64;
        browser.timers.insert((deadline, id), callback);
        browser.timer_deadlines.insert(id, deadline);
        TimerId(id)
    }

    fn clear_timeout(&self, timer: TimerId) {
        let mut browser = self.browser.inner.borrow_mut();
        if let Some(deadline) = browser.timer_deadlines.remove(&timer.0) {
            browser.timers.remove(&(deadline, timer.0));
        }
    }

    fn on_storage_change(&self, listener: StorageListener) -> Option<StorageSubscription> {
        if !self.windowed {
            return None;
        }
        let slot = self
            .browser
            .inner
            .borrow_mut()
            .listeners
            .insert((self.id, listener));
        let browser: Weak<RefCell<Browser>> = Rc::downgrade(&self.browser.inner);
        Some(StorageSubscription::new(move || {
            if let Some(browser) = browser.upgrade() {
                browser.borrow_mut().listeners.remove(slot);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_storage_events_skip_the_writer() {
        let browser = SimulatedBrowser::new();
        let writer = browser.open_tab();
        let reader = browser.open_tab();

        let writer_seen = Rc::new(Cell::new(0));
        let reader_seen = Rc::new(RefCell::new(Vec::new()));

        let counter = writer_seen.clone();
        let _writer_sub = writer
            .on_storage_change(Rc::new(move |_: &StorageChange| {
                counter.set(counter.get() + 1)
            }))
            .unwrap();
        let seen = reader_seen.clone();
        let _reader_sub = reader
            .on_storage_change(Rc::new(move |change: &StorageChange| {
                seen.borrow_mut().push(change.clone())
            }))
            .unwrap();

        writer.set_item("k", "v").unwrap();
        // nothing is delivered inline
        assert!(reader_seen.borrow().is_empty());

        browser.run_until_idle();
        assert_eq!(writer_seen.get(), 0);
        assert_eq!(
            *reader_seen.borrow(),
            vec![StorageChange {
                key: "k".to_string(),
                new_value: Some("v".to_string())
            }]
        );
    }

    #[test]
    fn test_dropping_subscription_stops_delivery() {
        let browser = SimulatedBrowser::new();
        let writer = browser.open_tab();
        let reader = browser.open_tab();
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        let subscription = reader
            .on_storage_change(Rc::new(move |_: &StorageChange| {
                counter.set(counter.get() + 1)
            }))
            .unwrap();

        drop(subscription);
        writer.set_item("k", "v").unwrap();
        browser.run_until_idle();
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn test_windowless_tab_cannot_listen() {
        let browser = SimulatedBrowser::new();
        let worker = browser.open_windowless_tab();
        assert!(
            worker
                .on_storage_change(Rc::new(|_: &StorageChange| {}))
                .is_none()
        );
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let browser = SimulatedBrowser::starting_at_millis(0);
        let tab = browser.open_tab();
        let fired = Rc::new(RefCell::new(Vec::new()));

        for (label, delay) in [("late", 300), ("early", 100), ("cancelled", 200)] {
            let fired = fired.clone();
            let id = tab.set_timeout(
                Duration::from_millis(delay),
                Box::new(move || fired.borrow_mut().push(label)),
            );
            if label == "cancelled" {
                tab.clear_timeout(id);
            }
        }

        browser.advance(Duration::from_millis(150));
        assert_eq!(fired.borrow().len(), 1);
        browser.advance(Duration::from_millis(1000));
        assert_eq!(*fired.borrow(), vec!["early", "late"]);
        assert_eq!(browser.now_millis(), 1150);
        assert_eq!(browser.pending_timers(), 0);
    }

    #[test]
    fn test_failing_writes() {
        let browser = SimulatedBrowser::new();
        let tab = browser.open_tab();
        browser.set_failing_writes(true);
        assert!(matches!(
            tab.set_item("k", "v"),
            Err(HostError::QuotaExceeded { .. })
        ));
        assert_eq!(browser.storage_value("k"), None);
        assert_eq!(browser.storage_writes(), 0);
    }
}
