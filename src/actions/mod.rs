// src/actions/mod.rs

//! Build actions: typed, persistent units of work processed by the engine
//!
//! A [`BuildAction`] is created, enqueued and then driven to a terminal state
//! by one of the internal action implementations in the submodules. Every
//! mutation of an action's state happens under the building lock; the
//! append-only `output` buffer doubles as the user-visible log stream.

pub mod conduct_build;
pub mod context;
pub mod custom_command;
pub mod engine;
pub mod meta;
pub mod prepare_build;
pub mod process;
pub mod reload_lib_deps;
pub mod repo_management;

pub use context::ActionContext;
pub use engine::ActionManager;
pub use meta::BuildActionMetaInfo;

use crate::database::{PackageUpdates, UnresolvedDependencies};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub type BuildActionId = u64;

/// Bit flags of a build action; meaning depends on the action type
pub type BuildActionFlags = u64;

/// Per-type flag bits (documented in the meta-info table)
pub mod flags {
    pub const RELOAD_LIB_DEPS_FORCE_RELOAD: u64 = 1 << 0;
    pub const RELOAD_LIB_DEPS_SKIP_DEPENDENCIES: u64 = 1 << 1;

    pub const PREPARE_BUILD_FORCE_BUMP_PKGREL: u64 = 1 << 0;
    pub const PREPARE_BUILD_CLEAN_SRC_DIR: u64 = 1 << 1;
    pub const PREPARE_BUILD_KEEP_ORDER: u64 = 1 << 2;
    pub const PREPARE_BUILD_KEEP_PKGREL_AND_EPOCH: u64 = 1 << 3;

    pub const CONDUCT_BUILD_AS_FAR_AS_POSSIBLE: u64 = 1 << 0;
    pub const CONDUCT_SAVE_CHROOT_OF_FAILURES: u64 = 1 << 1;
    pub const CONDUCT_UPDATE_CHECKSUMS: u64 = 1 << 2;
    pub const CONDUCT_AUTO_STAGING: u64 = 1 << 3;

    pub const CLEAN_REPOSITORY_DRY_RUN: u64 = 1 << 0;
}

/// Setting keys understood by the individual action types
pub mod settings {
    pub const PKGBUILDS_DIRS: &str = "pkgbuilds-dir";
    pub const CHROOT_DIR: &str = "chroot-dir";
    pub const CHROOT_USER: &str = "chroot-user";
    pub const CCACHE_DIR: &str = "ccache-dir";
    pub const PKG_CACHE_DIR: &str = "pkg-cache-dir";
    pub const TEST_FILES_DIR: &str = "test-files-dir";
    pub const COMMAND: &str = "cmd";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildActionType {
    #[default]
    Invalid,
    RemovePackages,
    MovePackages,
    CheckForUpdates,
    ReloadLibraryDependencies,
    PrepareBuild,
    ConductBuild,
    CheckForProblems,
    CleanRepository,
    DummyBuildAction,
    CustomCommand,
}

/// Lifecycle state; strictly monotone over the life of an action
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum BuildActionStatus {
    #[default]
    Created,
    Enqueued,
    AwaitingConfirmation,
    Running,
    Finished,
}

impl BuildActionStatus {
    pub fn is_terminal(self) -> bool {
        self == BuildActionStatus::Finished
    }
}

/// Outcome; set exactly once, in the transition to `Finished`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildActionResult {
    #[default]
    None,
    Success,
    Failure,
    ConfirmationDeclined,
    Aborted,
}

/// Errors, warnings and notes accumulated by an action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildActionMessages {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

/// One problem found in a repository by CheckForProblems
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryProblem {
    pub desc: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pkg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolved: Option<UnresolvedDependencies>,
}

/// Snapshot of a database taken at build-preparation time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbConfigSnapshot {
    pub name: String,
    pub arch: String,
    pub local_pkg_dir: String,
    pub database_file: String,
}

/// Everything ConductBuild needs to know about one package to build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageBuildData {
    pub pkgbase: String,
    /// Full version including epoch and pkgrel
    pub version: String,
    /// Output packages of the build (more than one for split packages)
    pub subpackages: Vec<String>,
    /// Directory the PKGBUILD was found in
    pub source_directory: String,
    pub arch: String,
    /// pkgbases within the build set this package depends on
    pub dependencies: Vec<String>,
}

/// Result data of PrepareBuild, persisted as `build-preparation.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPreparation {
    pub target_db: String,
    pub target_arch: String,
    pub staging_db: String,
    pub packages: BTreeMap<String, PackageBuildData>,
    pub batches: Vec<Vec<String>>,
    /// Cycle members that could not be assigned to any batch
    pub cyclic_leftovers: Vec<String>,
    pub db_config: Vec<DbConfigSnapshot>,
    pub staging_db_config: Vec<DbConfigSnapshot>,
    pub warnings: Vec<String>,
    pub error: String,
    pub manually_ordered: bool,
}

/// Per-package progress of ConductBuild
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageBuildProgress {
    pub finished: Option<DateTime<Utc>>,
    pub added_to_repo: bool,
    pub error: String,
    pub updated_version: String,
}

/// Libraries of a reverse dependency affected by newly built packages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageRebuildInfo {
    pub libprovides: Vec<String>,
}

/// Mapping `db → pkg → affected libprovides` produced by auto-staging
pub type RebuildList = BTreeMap<String, BTreeMap<String, PackageRebuildInfo>>;

/// Result data of ConductBuild, persisted as `build-progress.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub progress_by_package: BTreeMap<String, PackageBuildProgress>,
    pub rebuild_list: RebuildList,
}

/// Per-package outcome of a package-movement action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMovementResult {
    pub processed_packages: Vec<String>,
    pub failed_packages: Vec<(String, String)>,
    pub error_message: String,
}

/// Typed result payload of a finished action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum BuildActionResultData {
    #[default]
    None,
    Error(String),
    Messages(BuildActionMessages),
    BuildPreparation(BuildPreparation),
    BuildProgress(BuildProgress),
    UpdateList(PackageUpdates),
    RepositoryProblems(BTreeMap<String, Vec<RepositoryProblem>>),
    Movement(PackageMovementResult),
}

impl BuildActionResultData {
    /// The error string, for assertions and display
    pub fn as_error(&self) -> Option<&str> {
        match self {
            BuildActionResultData::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Cooperative cancellation handle shared between the engine and the running
/// internal action
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the abort flag is set
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so an abort between the
            // check and the await is not missed
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// A typed, persistent build action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildAction {
    pub id: BuildActionId,
    pub task_name: String,
    pub template_name: String,
    #[serde(rename = "type")]
    pub action_type: BuildActionType,
    pub status: BuildActionStatus,
    pub result: BuildActionResult,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Working directory name below the engine's build-data directory
    pub directory: String,
    pub source_dbs: Vec<String>,
    pub destination_dbs: Vec<String>,
    pub package_names: Vec<String>,
    pub flags: BuildActionFlags,
    pub settings: HashMap<String, String>,
    pub log_files: Vec<String>,
    /// Append-only log stream, echoed from the per-action logger
    pub output: String,
    pub result_data: BuildActionResultData,
    /// Actions that must reach a terminal state before this one starts
    pub start_after: Vec<BuildActionId>,
    #[serde(skip)]
    pub abort: AbortHandle,
    /// Notified when the action reaches `Finished`
    #[serde(skip)]
    pub completion: Arc<Notify>,
}

impl BuildAction {
    pub fn new(id: BuildActionId, action_type: BuildActionType) -> Self {
        Self {
            id,
            action_type,
            created: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: BuildActionFlags) -> bool {
        self.flags & flag != 0
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Append a line to the output buffer; callers hold the building lock
    pub fn append_output(&mut self, line: impl AsRef<str>) {
        self.output.push_str(line.as_ref());
        if !line.as_ref().ends_with('\n') {
            self.output.push('\n');
        }
    }

    /// Register a log file under its short name (e.g. "repo-add")
    pub fn register_log_file(&mut self, name: &str) {
        if !self.log_files.iter().any(|entry| entry == name) {
            self.log_files.push(name.to_string());
        }
    }
}
