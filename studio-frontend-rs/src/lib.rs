mod domain;
pub mod songs;
pub mod workflow_runs;

#[cfg(target_arch = "wasm32")]
mod browser;

use std::rc::Rc;
#[cfg(target_arch = "wasm32")]
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether::{ConfigError, HookPayload, Host, HostError, ListenerKey, RemoteError, StateStore};
use wasm_bindgen::prelude::*;

pub use domain::DomainStore;
use songs::Song;
use workflow_runs::WorkflowRun;

pub const DEFAULT_STORAGE_PREFIX: &str = "studio";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(default)]
pub struct StudioConfig {
    /// Each collection is stored under `{storage_prefix}:{collection}`.
    pub storage_prefix: String,
    pub debounce_ms: u64,
    /// How another tab's newer copy is combined with ours: `"merge"` or `"replace"`.
    pub strategy: String,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
            debounce_ms: tether::persist::DEFAULT_DEBOUNCE_MS,
            strategy: "merge".to_string(),
        }
    }
}

impl StudioConfig {
    pub fn storage_key(&self, collection: &str) -> String {
        format!("{}:{collection}", self.storage_prefix)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("browser storage is unavailable: {0}")]
    Host(#[from] HostError),
}

/// One point in a request's lifecycle, as reported by the network layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum MutationSignal {
    OnMutate {
        #[tsify(type = "unknown")]
        variables: Value,
    },
    OnSuccess {
        #[tsify(type = "unknown")]
        data: Value,
        #[tsify(type = "unknown")]
        variables: Value,
    },
    OnError {
        error: String,
        #[tsify(type = "unknown")]
        variables: Value,
    },
}

impl From<MutationSignal> for HookPayload {
    fn from(signal: MutationSignal) -> Self {
        match signal {
            MutationSignal::OnMutate { variables } => HookPayload::Mutate { variables },
            MutationSignal::OnSuccess { data, variables } => {
                HookPayload::Success { data, variables }
            }
            MutationSignal::OnError { error, variables } => HookPayload::Error {
                error: RemoteError::from(error),
                variables,
            },
        }
    }
}

// a `static` so that every `Studio` shares one initialization of the logger
#[cfg(target_arch = "wasm32")]
static LOGGER: LazyLock<()> = LazyLock::new(|| {
    // When the `console_error_panic_hook` feature is enabled, panics are reported with
    // `console.error` instead of an opaque `unreachable` trap.
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();

    wasm_logger::init(wasm_logger::Config::default());
    log::info!("Logging initialized");
});

#[wasm_bindgen]
pub struct Studio {
    songs: DomainStore<Song>,
    workflow_runs: DomainStore<WorkflowRun>,
}

/// Keeps a JS callback subscribed until `unsubscribe` is called or the handle is freed.
#[wasm_bindgen]
pub struct Subscription {
    store: StateStore,
    key: Option<ListenerKey>,
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl Subscription {
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn unsubscribe(&mut self) {
        if let Some(key) = self.key.take() {
            self.store.unsubscribe(key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
impl Studio {
    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen(constructor)]
    pub fn new(config: Option<StudioConfig>) -> Result<Studio, JsError> {
        LazyLock::force(&LOGGER);

        let host = browser::BrowserHost::new()
            .inspect_err(|e| log::error!("Error opening browser storage: {e}"))?;
        Ok(Self::with_host(Rc::new(host), config.unwrap_or_default())?)
    }

    /// Songs as the user should see them, staged changes included.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn songs(&self) -> Vec<Song> {
        self.songs.items().items()
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn workflow_runs(&self) -> Vec<WorkflowRun> {
        self.workflow_runs.items().items()
    }

    /// Replaces the confirmed songs with a list fetched from the server.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn load_songs(&self, songs: JsValue) -> Result<(), JsError> {
        let songs: Vec<Song> = serde_wasm_bindgen::from_value(songs)?;
        self.songs.items().set_canonical(songs);
        Ok(())
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn load_workflow_runs(&self, runs: JsValue) -> Result<(), JsError> {
        let runs: Vec<WorkflowRun> = serde_wasm_bindgen::from_value(runs)?;
        self.workflow_runs.items().set_canonical(runs);
        Ok(())
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn subscribe_songs(&self, callback: js_sys::Function) -> Subscription {
        subscribe_js(&self.songs, callback)
    }

    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub fn subscribe_workflow_runs(&self, callback: js_sys::Function) -> Subscription {
        subscribe_js(&self.workflow_runs, callback)
    }

    /// Called by the network layer before a request is sent and once it settles. Never throws.
    #[cfg_attr(target_arch = "wasm32", wasm_bindgen)]
    pub async fn execute_mutation_hook(&self, key: String, signal: MutationSignal) {
        let payload = HookPayload::from(signal);
        let mutations = if self.songs.mutations().is_registered(&key) {
            self.songs.mutations()
        } else if self.workflow_runs.mutations().is_registered(&key) {
            self.workflow_runs.mutations()
        } else {
            if cfg!(debug_assertions) {
                log::debug!("No collection registered `{key}`, skipping {}", payload.phase());
            }
            return;
        };
        mutations.execute_mutation_hook(&key, payload).await;
    }
}

impl Studio {
    pub fn with_host(host: Rc<dyn Host>, config: StudioConfig) -> Result<Self, StudioError> {
        let songs = DomainStore::open(host.clone(), &config, "songs")?;
        songs::register(&songs);
        let workflow_runs = DomainStore::open(host, &config, "workflow_runs")?;
        workflow_runs::register(&workflow_runs);
        Ok(Self {
            songs,
            workflow_runs,
        })
    }

    pub fn song_store(&self) -> &DomainStore<Song> {
        &self.songs
    }

    pub fn workflow_run_store(&self) -> &DomainStore<WorkflowRun> {
        &self.workflow_runs
    }
}

fn subscribe_js<E: tether::Entity>(
    domain: &DomainStore<E>,
    callback: js_sys::Function,
) -> Subscription {
    let name = domain.name();
    let key = domain.subscribe(move || {
        #[cfg(target_arch = "wasm32")]
        {
            if let Err(e) = callback.call0(&JsValue::null()) {
                log::error!("`{name}` subscriber threw: {e:?}");
            }
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = (name, &callback);
        }
    });
    Subscription {
        store: domain.store().clone(),
        key: Some(key),
    }
}
