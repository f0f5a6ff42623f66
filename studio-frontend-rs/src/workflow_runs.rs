use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether::{Entity, HookError, record};

use crate::domain::DomainStore;

pub const START_WORKFLOW_RUN: &str = "startWorkflowRun";
pub const CANCEL_WORKFLOW_RUN: &str = "cancelWorkflowRun";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, tsify::Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow: String,
    pub status: RunStatus,
    #[tsify(type = "string")]
    pub started_at: DateTime<Utc>,
    #[tsify(type = "string | null")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Entity for WorkflowRun {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Deserialize)]
struct StartRun {
    id: String,
    workflow: String,
}

pub(crate) fn register(runs: &DomainStore<WorkflowRun>) {
    // variables: `{ id, workflow }`
    let host = runs.host().clone();
    runs.register_optimistic(START_WORKFLOW_RUN, move |items, _, variables| {
        let StartRun { id, workflow } = serde_json::from_value(variables)?;
        items.add_optimistic(&WorkflowRun {
            id,
            workflow,
            status: RunStatus::Queued,
            started_at: timestamp(host.now_millis()),
            finished_at: None,
        });
        Ok(())
    });

    // variables: `{ id }`
    let host = runs.host().clone();
    runs.register_optimistic(CANCEL_WORKFLOW_RUN, move |items, id, _: Value| {
        let Some(run) = items.get(id) else {
            return Err(format!("no workflow run `{id}` to cancel").into());
        };
        if run.status.is_finished() {
            return Err(HookError::from(format!(
                "workflow run `{id}` already finished as {:?}",
                run.status
            )));
        }
        items.update_optimistic(
            id,
            record(json!({
                "status": RunStatus::Cancelled,
                "finished_at": timestamp(host.now_millis()),
            })),
        );
        Ok(())
    });
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StudioConfig;
    use futures::executor::block_on;
    use std::rc::Rc;
    use tether::simulation::SimulatedBrowser;
    use tether::{HookPayload, Host, RemoteError};

    fn open(browser: &SimulatedBrowser) -> DomainStore<WorkflowRun> {
        let host: Rc<dyn Host> = Rc::new(browser.open_tab());
        let runs = DomainStore::open(host, &StudioConfig::default(), "workflow_runs").unwrap();
        register(&runs);
        runs
    }

    fn signal(runs: &DomainStore<WorkflowRun>, key: &str, payload: HookPayload) {
        block_on(runs.mutations().execute_mutation_hook(key, payload));
    }

    #[test]
    fn test_started_run_is_queued_until_confirmed() {
        let browser = SimulatedBrowser::new();
        let runs = open(&browser);
        let variables = json!({ "id": "r1", "workflow": "nightly-build" });

        signal(
            &runs,
            START_WORKFLOW_RUN,
            HookPayload::Mutate {
                variables: variables.clone(),
            },
        );
        let staged = runs.items().get("r1").unwrap();
        assert_eq!(staged.status, RunStatus::Queued);
        assert_eq!(staged.started_at, browser.now());
        assert_eq!(runs.items().canonical("r1"), None);

        // the server has already picked it up
        let confirmed = WorkflowRun {
            status: RunStatus::Running,
            ..staged
        };
        signal(
            &runs,
            START_WORKFLOW_RUN,
            HookPayload::Success {
                data: serde_json::to_value(&confirmed).unwrap(),
                variables,
            },
        );
        assert_eq!(runs.items().canonical("r1"), Some(confirmed));
    }

    fn running(id: &str, browser: &SimulatedBrowser) -> WorkflowRun {
        WorkflowRun {
            id: id.to_string(),
            workflow: "deploy".to_string(),
            status: RunStatus::Running,
            started_at: browser.now(),
            finished_at: None,
        }
    }

    #[test]
    fn test_cancel_rolls_back_on_failure() {
        let browser = SimulatedBrowser::new();
        let runs = open(&browser);
        runs.items().set_canonical([running("r1", &browser)]);
        let variables = json!({ "id": "r1" });

        signal(
            &runs,
            CANCEL_WORKFLOW_RUN,
            HookPayload::Mutate {
                variables: variables.clone(),
            },
        );
        let cancelled = runs.items().get("r1").unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.finished_at, Some(browser.now()));

        signal(
            &runs,
            CANCEL_WORKFLOW_RUN,
            HookPayload::Error {
                error: RemoteError::from("run already finished"),
                variables,
            },
        );
        assert_eq!(runs.items().get("r1"), Some(running("r1", &browser)));
        assert!(runs.items().pending("r1").is_clean());
    }

    #[test]
    fn test_finished_or_unknown_runs_cannot_be_cancelled() {
        let browser = SimulatedBrowser::new();
        let runs = open(&browser);
        runs.items().set_canonical([WorkflowRun {
            status: RunStatus::Succeeded,
            finished_at: Some(browser.now()),
            ..running("done", &browser)
        }]);

        for id in ["done", "missing"] {
            signal(
                &runs,
                CANCEL_WORKFLOW_RUN,
                HookPayload::Mutate {
                    variables: json!({ "id": id }),
                },
            );
            assert!(runs.items().pending(id).is_clean(), "{id} was staged");
        }
        assert_eq!(
            runs.items().get("done").map(|run| run.status),
            Some(RunStatus::Succeeded)
        );
    }
}
