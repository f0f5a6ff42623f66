//! [`Host`] over the real page: `window.localStorage`, the `storage` event and `setTimeout`.

use std::time::Duration;

use tether::{Host, HostError, StorageChange, StorageListener, StorageSubscription, TimerId};
use wasm_bindgen::prelude::*;

pub struct BrowserHost {
    window: web_sys::Window,
    storage: web_sys::Storage,
}

impl BrowserHost {
    pub fn new() -> Result<Self, HostError> {
        let window = web_sys::window().ok_or(HostError::Unavailable)?;
        // throws when storage is disabled, e.g. by privacy settings
        let storage = window
            .local_storage()
            .map_err(|e| {
                log::error!("localStorage is not accessible: {e:?}");
                HostError::Unavailable
            })?
            .ok_or(HostError::Unavailable)?;
        Ok(Self { window, storage })
    }
}

fn host_error(key: &str, error: JsValue) -> HostError {
    match error.dyn_ref::<web_sys::DomException>() {
        Some(exception) if exception.name() == "QuotaExceededError" => HostError::QuotaExceeded {
            key: key.to_string(),
        },
        Some(exception) => HostError::Other(exception.message()),
        None => HostError::Other(format!("{error:?}")),
    }
}

impl Host for BrowserHost {
    fn get_item(&self, key: &str) -> Result<Option<String>, HostError> {
        self.storage.get_item(key).map_err(|e| host_error(key, e))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), HostError> {
        self.storage
            .set_item(key, value)
            .map_err(|e| host_error(key, e))
    }

    fn remove_item(&self, key: &str) -> Result<(), HostError> {
        self.storage.remove_item(key).map_err(|e| host_error(key, e))
    }

    fn now_millis(&self) -> i64 {
        js_sys::Date::now() as i64
    }

    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let callback = Closure::once_into_js(callback);
        let handle = self
            .window
            .set_timeout_with_callback_and_timeout_and_arguments_0(
                callback.unchecked_ref(),
                delay.as_millis().min(i32::MAX as u128) as i32,
            )
            .inspect_err(|e| log::error!("setTimeout failed: {e:?}"))
            .unwrap_or(0);
        TimerId(handle as u64)
    }

    fn clear_timeout(&self, timer: TimerId) {
        self.window.clear_timeout_with_handle(timer.0 as i32);
    }

    fn on_storage_change(&self, listener: StorageListener) -> Option<StorageSubscription> {
        // the browser only fires `storage` in tabs other than the writer
        let closure = Closure::<dyn FnMut(web_sys::StorageEvent)>::new(
            move |event: web_sys::StorageEvent| {
                // `localStorage.clear()` arrives without a key
                let Some(key) = event.key() else {
                    return;
                };
                listener(&StorageChange {
                    key,
                    new_value: event.new_value(),
                });
            },
        );

        if let Err(e) = self
            .window
            .add_event_listener_with_callback("storage", closure.as_ref().unchecked_ref())
        {
            log::error!("Could not listen for storage events: {e:?}");
            return None;
        }

        let window = self.window.clone();
        Some(StorageSubscription::new(move || {
            let _ = window
                .remove_event_listener_with_callback("storage", closure.as_ref().unchecked_ref());
        }))
    }
}
