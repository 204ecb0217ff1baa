// src/actions/context.rs

//! Shared context handed to every internal build action
//!
//! Wraps the service setup plus the action record and provides the helpers
//! all actions use: input validation against the declared requirements,
//! logging into the action's output stream and the one-shot conclusion that
//! moves the action into its terminal state.

use crate::actions::{
    engine, AbortHandle, BuildAction, BuildActionId, BuildActionResult, BuildActionResultData,
    BuildActionStatus,
};
use crate::setup::ServiceSetup;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{error, info};

/// Which kind of config lock an action's main phase needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAccess {
    ReadConfig,
    WriteConfig,
}

/// How many databases of a kind an action requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbRequirement {
    #[default]
    None,
    One,
    OneOrMore,
    Maybe,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredDatabases {
    pub source: DbRequirement,
    pub destination: DbRequirement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredParameters {
    #[default]
    None,
    Packages,
    MaybePackages,
}

/// Database denotations resolved to indices into `Config::databases`
#[derive(Debug, Default)]
pub struct InitData {
    pub source_db_indices: Vec<usize>,
    pub destination_db_indices: Vec<usize>,
}

/// Context of one running internal action
#[derive(Clone)]
pub struct ActionContext {
    pub setup: Arc<ServiceSetup>,
    pub action: Arc<RwLock<BuildAction>>,
    pub id: BuildActionId,
    pub abort: AbortHandle,
}

impl ActionContext {
    pub fn new(setup: Arc<ServiceSetup>, action: Arc<RwLock<BuildAction>>) -> Self {
        let (id, abort) = {
            let guard = action.read().expect("action lock poisoned");
            (guard.id, guard.abort.clone())
        };
        Self {
            setup,
            action,
            id,
            abort,
        }
    }

    /// Read access to the action record
    pub fn snapshot<T>(&self, read: impl FnOnce(&BuildAction) -> T) -> T {
        read(&self.action.read().expect("action lock poisoned"))
    }

    /// Write access to the action record
    pub fn with_action_mut<T>(&self, write: impl FnOnce(&mut BuildAction) -> T) -> T {
        write(&mut self.action.write().expect("action lock poisoned"))
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Conclude with `Aborted` when the abort flag is set
    ///
    /// Cancellation point used at loop boundaries and before launching child
    /// processes; returns whether the action is over.
    pub fn report_aborted_if_aborted(&self) -> bool {
        if !self.is_aborted() {
            return false;
        }
        self.conclude(BuildActionResult::Aborted, BuildActionResultData::None);
        true
    }

    pub fn log_info(&self, message: impl AsRef<str>) {
        info!("build action {}: {}", self.id, message.as_ref());
        self.with_action_mut(|action| action.append_output(format!("==> {}", message.as_ref())));
    }

    pub fn log_sub(&self, message: impl AsRef<str>) {
        info!("build action {}: {}", self.id, message.as_ref());
        self.with_action_mut(|action| action.append_output(format!("  -> {}", message.as_ref())));
    }

    pub fn log_error(&self, message: impl AsRef<str>) {
        error!("build action {}: {}", self.id, message.as_ref());
        self.with_action_mut(|action| {
            action.append_output(format!("==> ERROR: {}", message.as_ref()))
        });
    }

    /// Report a validation or execution error as the action's failure result
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.log_error(&message);
        self.conclude(
            BuildActionResult::Failure,
            BuildActionResultData::Error(message),
        );
    }

    pub fn report_success(&self) {
        self.conclude(BuildActionResult::Success, BuildActionResultData::None);
    }

    /// Move the action to its terminal state; the result is set exactly once
    pub fn conclude(&self, result: BuildActionResult, data: BuildActionResultData) {
        {
            let mut action = self.action.write().expect("action lock poisoned");
            if action.status == BuildActionStatus::Finished {
                return;
            }
            action.status = BuildActionStatus::Finished;
            action.result = result;
            if data != BuildActionResultData::None
                || action.result_data == BuildActionResultData::None
            {
                action.result_data = data;
            }
            action.finished = Some(Utc::now());
            action.completion.notify_waiters();
        }
        engine::ActionManager::on_action_concluded(&self.setup, self.id);
    }

    /// Validate the action's inputs against its requirements and resolve the
    /// database denotations
    ///
    /// On violation the error is reported (the action is concluded) and
    /// `None` is returned. The config lock is only held for the validation
    /// itself; actions re-acquire it as [`ConfigAccess`] demands.
    pub fn init(
        &self,
        _access: ConfigAccess,
        required_dbs: RequiredDatabases,
        required_params: RequiredParameters,
    ) -> Option<InitData> {
        let (source_dbs, destination_dbs, package_names) = self.snapshot(|action| {
            (
                action.source_dbs.clone(),
                action.destination_dbs.clone(),
                action.package_names.clone(),
            )
        });

        match required_params {
            RequiredParameters::Packages if package_names.is_empty() => {
                self.report_error("no packages specified");
                return None;
            }
            _ => {}
        }

        let config = self.setup.config.read().expect("config lock poisoned");
        let mut data = InitData::default();
        for (denotations, indices, kind) in [
            (&source_dbs, &mut data.source_db_indices, "source"),
            (
                &destination_dbs,
                &mut data.destination_db_indices,
                "destination",
            ),
        ] {
            for denotation in denotations.iter() {
                let (name, arch) = crate::database::Config::parse_database_denotation(denotation);
                match config.database_index(name, arch) {
                    Some(index) => indices.push(index),
                    None => {
                        drop(config);
                        self.report_error(format!(
                            "specified {kind} database \"{denotation}\" does not exist"
                        ));
                        return None;
                    }
                }
            }
        }
        drop(config);

        for (requirement, count, kind) in [
            (required_dbs.source, data.source_db_indices.len(), "source"),
            (
                required_dbs.destination,
                data.destination_db_indices.len(),
                "destination",
            ),
        ] {
            match requirement {
                DbRequirement::One if count != 1 => {
                    self.report_error(format!("not exactly one {kind} database specified"));
                    return None;
                }
                DbRequirement::OneOrMore if count == 0 => {
                    self.report_error(format!("no {kind} database(s) specified"));
                    return None;
                }
                DbRequirement::None if count != 0 => {
                    self.report_error(format!(
                        "no {kind} database can be specified for this action type"
                    ));
                    return None;
                }
                _ => {}
            }
        }

        Some(data)
    }

    /// The action's working directory below the engine's build-data dir
    ///
    /// An empty `directory` is defaulted to `<type-slug>-<id>` first.
    pub fn working_directory(&self) -> PathBuf {
        let directory = self.ensure_directory();
        let building = self.setup.building.read().expect("building lock poisoned");
        building.build_data_dir().join(directory)
    }

    pub fn ensure_directory(&self) -> String {
        let (directory, action_type) = self.snapshot(|action| (action.directory.clone(), action.action_type));
        if !directory.is_empty() {
            return directory;
        }
        let slug = {
            let building = self.setup.building.read().expect("building lock poisoned");
            building.meta.type_info_for_id(action_type).type_slug
        };
        let name = format!("{slug}-{}", self.id);
        self.with_action_mut(|action| {
            if action.directory.is_empty() {
                action.directory = name.clone();
            }
            action.directory.clone()
        })
    }

    /// Wait until the action reaches its terminal state
    pub async fn finished(&self) {
        loop {
            let notify = self.snapshot(|action| Arc::clone(&action.completion));
            let notified = notify.notified();
            tokio::pin!(notified);
            // register before checking the status so a conclusion between
            // the check and the await is not missed
            notified.as_mut().enable();
            if self.snapshot(|action| action.status == BuildActionStatus::Finished) {
                return;
            }
            notified.await;
        }
    }
}
