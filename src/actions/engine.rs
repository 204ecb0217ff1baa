// src/actions/engine.rs

//! The build-action engine
//!
//! Creates actions with monotonically increasing ids, enqueues them and moves
//! them to `Running` once every id in `start_after` reached a terminal state.
//! Running actions are tokio tasks driving the internal action
//! implementations; aborting sets the shared abort flag which the actions
//! honor at their cancellation points.

use crate::actions::{
    conduct_build, custom_command, prepare_build, reload_lib_deps, repo_management, ActionContext,
    BuildAction, BuildActionId, BuildActionStatus, BuildActionType,
};
use crate::error::{Error, Result};
use crate::setup::ServiceSetup;
use chrono::Utc;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Facade over the engine operations; all state lives in
/// [`BuildingState`](crate::setup::BuildingState)
pub struct ActionManager;

impl ActionManager {
    /// Register a new action, assigning a fresh id
    ///
    /// The draft's id, status, result and timestamps are overwritten.
    pub fn create(
        setup: &Arc<ServiceSetup>,
        mut draft: BuildAction,
    ) -> Arc<RwLock<BuildAction>> {
        let mut building = setup.building.write().expect("building lock poisoned");
        building.next_action_id += 1;
        draft.id = building.next_action_id;
        draft.status = BuildActionStatus::Created;
        draft.result = Default::default();
        draft.created = Some(Utc::now());
        draft.started = None;
        draft.finished = None;
        let id = draft.id;
        let action = Arc::new(RwLock::new(draft));
        building.actions.insert(id, Arc::clone(&action));
        debug!("created build action {id}");
        action
    }

    pub fn get(setup: &Arc<ServiceSetup>, id: BuildActionId) -> Option<Arc<RwLock<BuildAction>>> {
        let building = setup.building.read().expect("building lock poisoned");
        building.actions.get(&id).cloned()
    }

    /// Snapshot of all actions, newest first
    pub fn list(setup: &Arc<ServiceSetup>) -> Vec<BuildAction> {
        let building = setup.building.read().expect("building lock poisoned");
        let mut actions: Vec<BuildAction> = building
            .actions
            .values()
            .map(|action| action.read().expect("action lock poisoned").clone())
            .collect();
        actions.sort_by(|a, b| b.id.cmp(&a.id));
        actions
    }

    /// Move an action into the queue; it starts as soon as its
    /// `start_after` dependencies are done
    pub fn enqueue(setup: &Arc<ServiceSetup>, id: BuildActionId) -> Result<()> {
        let action = Self::get(setup, id)
            .ok_or_else(|| Error::Validation(format!("build action {id} does not exist")))?;
        {
            let mut guard = action.write().expect("action lock poisoned");
            if guard.status != BuildActionStatus::Created {
                return Err(Error::Validation(format!(
                    "build action {id} has already been enqueued"
                )));
            }
            guard.status = BuildActionStatus::Enqueued;
        }
        Self::try_start(setup, id);
        Ok(())
    }

    /// Request cancellation of a running (or queued) action
    pub fn abort(setup: &Arc<ServiceSetup>, id: BuildActionId) -> Result<()> {
        let action = Self::get(setup, id)
            .ok_or_else(|| Error::Validation(format!("build action {id} does not exist")))?;
        let abort = {
            let guard = action.read().expect("action lock poisoned");
            if guard.status == BuildActionStatus::Finished {
                return Err(Error::Validation(format!(
                    "build action {id} has already finished"
                )));
            }
            guard.abort.clone()
        };
        abort.abort();
        debug!("abort requested for build action {id}");
        Ok(())
    }

    /// Whether all `start_after` dependencies reached a terminal state
    fn dependencies_done(setup: &Arc<ServiceSetup>, ids: &[BuildActionId]) -> bool {
        let building = setup.building.read().expect("building lock poisoned");
        ids.iter().all(|dep_id| match building.actions.get(dep_id) {
            Some(dep) => dep.read().expect("action lock poisoned").status.is_terminal(),
            // a purged or unknown dependency no longer blocks
            None => true,
        })
    }

    fn try_start(setup: &Arc<ServiceSetup>, id: BuildActionId) {
        // actions are driven as tokio tasks; without a runtime (synchronous
        // callers) they simply stay enqueued
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let Some(action) = Self::get(setup, id) else {
            return;
        };
        {
            let shutting_down = setup
                .building
                .read()
                .expect("building lock poisoned")
                .shutting_down;
            if shutting_down {
                return;
            }
        }
        let start_after = {
            let guard = action.read().expect("action lock poisoned");
            if guard.status != BuildActionStatus::Enqueued {
                return;
            }
            guard.start_after.clone()
        };
        if !Self::dependencies_done(setup, &start_after) {
            return;
        }
        {
            let mut guard = action.write().expect("action lock poisoned");
            if guard.status != BuildActionStatus::Enqueued {
                return;
            }
            guard.status = BuildActionStatus::Running;
            guard.started = Some(Utc::now());
        }
        let context = ActionContext::new(Arc::clone(setup), action);
        debug!("starting build action {id}");
        tokio::spawn(Self::run_internal(context));
    }

    /// Re-examine queued actions after one concluded
    pub(crate) fn on_action_concluded(setup: &Arc<ServiceSetup>, concluded_id: BuildActionId) {
        debug!("build action {concluded_id} concluded");
        let queued: Vec<BuildActionId> = {
            let building = setup.building.read().expect("building lock poisoned");
            building
                .actions
                .iter()
                .filter(|(_, action)| {
                    action.read().expect("action lock poisoned").status
                        == BuildActionStatus::Enqueued
                })
                .map(|(&id, _)| id)
                .collect()
        };
        for id in queued {
            Self::try_start(setup, id);
        }
    }

    /// Dispatch to the internal action implementation
    async fn run_internal(context: ActionContext) {
        let action_type = context.snapshot(|action| action.action_type);
        match action_type {
            BuildActionType::ReloadLibraryDependencies => reload_lib_deps::run(&context).await,
            BuildActionType::PrepareBuild => prepare_build::run(&context).await,
            BuildActionType::ConductBuild => conduct_build::run(&context).await,
            BuildActionType::RemovePackages => repo_management::run_remove_packages(&context).await,
            BuildActionType::MovePackages => repo_management::run_move_packages(&context).await,
            BuildActionType::CleanRepository => {
                repo_management::run_clean_repository(&context).await
            }
            BuildActionType::CheckForProblems => {
                repo_management::run_check_for_problems(&context).await
            }
            BuildActionType::CheckForUpdates => {
                repo_management::run_check_for_updates(&context).await
            }
            BuildActionType::CustomCommand => custom_command::run(&context).await,
            BuildActionType::DummyBuildAction => custom_command::run_dummy(&context).await,
            BuildActionType::Invalid => context.report_error("invalid build action type"),
        }

        // an internal action must always conclude; failing to do so is a bug
        let finished =
            context.snapshot(|action| action.status == BuildActionStatus::Finished);
        if !finished {
            warn!(
                "internal action {} returned without concluding",
                context.id
            );
            context.report_error("internal action did not conclude");
        }
    }
}
