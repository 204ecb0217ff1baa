// src/setup.rs

//! Process-wide service state
//!
//! [`ServiceSetup`] owns the package [`Config`], the build-engine state and
//! the storage environment. It is created once at startup and handed by
//! reference to every build action and HTTP handler. The TOML server
//! configuration selects the working directory, tool paths, chroot settings
//! and the managed databases.

use crate::actions::{BuildAction, BuildActionId, BuildActionMetaInfo};
use crate::database::{Config, SignatureLevel};
use crate::error::{Error, Result};
use crate::storage::{PackageCache, StorageEnv};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, info};

/// Paths of the external tools the engine drives
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub makepkg: String,
    pub makechrootpkg: String,
    pub updpkgsums: String,
    pub repo_add: String,
    pub repo_remove: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            makepkg: "makepkg".to_string(),
            makechrootpkg: "makechrootpkg".to_string(),
            updpkgsums: "updpkgsums".to_string(),
            repo_add: "repo-add".to_string(),
            repo_remove: "repo-remove".to_string(),
        }
    }
}

/// Mutable state of the build engine, protected by the building lock
#[derive(Debug, Default)]
pub struct BuildingState {
    /// `<working directory>/building`
    pub working_directory: PathBuf,
    pub tools: ToolPaths,
    pub chroot_dir: String,
    pub chroot_user: String,
    pub ccache_dir: String,
    pub package_cache_dir: String,
    pub test_files_dir: String,
    pub actions: HashMap<BuildActionId, Arc<RwLock<BuildAction>>>,
    pub meta: BuildActionMetaInfo,
    pub shutting_down: bool,
    pub(crate) next_action_id: BuildActionId,
}

impl BuildingState {
    /// Directory holding the per-action working directories
    pub fn build_data_dir(&self) -> PathBuf {
        self.working_directory.join("build-data")
    }

    /// Directory holding the working directories of custom commands
    pub fn custom_commands_dir(&self) -> PathBuf {
        self.working_directory.join("custom-commands")
    }
}

/// The service's root object
#[derive(Default)]
pub struct ServiceSetup {
    pub working_directory: PathBuf,
    pub config_file_path: PathBuf,
    pub web_bind_address: String,
    pub config: RwLock<Config>,
    pub building: RwLock<BuildingState>,
    pub package_cache: PackageCache,
    storage: OnceLock<Arc<StorageEnv>>,
}

impl ServiceSetup {
    /// Load the TOML server configuration and apply it
    ///
    /// Called once at startup, before the setup is shared across tasks.
    pub fn load_config_files(&mut self) -> Result<()> {
        let content = std::fs::read_to_string(&self.config_file_path).map_err(|e| {
            Error::Config(format!(
                "Unable to read config file {}: {e}",
                self.config_file_path.display()
            ))
        })?;
        let file: ServerConfigFile = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Unable to parse config file: {e}")))?;
        self.apply_config(file)
    }

    pub fn apply_config(&mut self, file: ServerConfigFile) -> Result<()> {
        self.working_directory = file.working_directory.clone();
        self.web_bind_address = file.web.bind.clone();
        let mut config = self.config.write().expect("config lock poisoned");
        let mut building = self.building.write().expect("building lock poisoned");

        building.working_directory = file.working_directory.join("building");
        building.tools = ToolPaths {
            makepkg: file.building.makepkg_path,
            makechrootpkg: file.building.makechrootpkg_path,
            updpkgsums: file.building.updpkgsums_path,
            repo_add: file.building.repo_add_path,
            repo_remove: file.building.repo_remove_path,
        };
        building.chroot_dir = file.building.chroot_dir;
        building.chroot_user = file.building.chroot_user;
        building.ccache_dir = file.building.ccache_dir;
        building.package_cache_dir = file.building.package_cache_dir;
        building.test_files_dir = file.building.test_files_dir;

        config.pacman_database_path = file.pacman_database_path;
        config.package_cache_dirs = file.package_cache_dirs;
        config.mark_all_databases_to_be_discarded();
        for (denotation, section) in &file.database {
            let (name, arch) = Config::parse_database_denotation(denotation);
            let arch = arch.to_string();
            let name = name.to_string();
            let db = config.find_or_create_database(&name, &arch);
            db.to_be_discarded = false;
            db.path = section.path.clone();
            db.files_path = section.files_path.clone();
            db.mirrors = section.mirrors.clone();
            db.dependencies = section.dependencies.clone();
            db.local_pkg_dir = section.local_pkg_dir.clone();
            db.local_db_dir = section.local_db_dir.clone();
            db.sync_from_mirror = section.sync_from_mirror;
            db.signature_level = SignatureLevel::from_config_value(&section.sig_level)?;
        }
        config.discard_databases();

        info!(
            "Loaded configuration with {} databases",
            config.databases.len()
        );
        Ok(())
    }

    /// Load the packages of every configured database from its `.db` file
    pub fn load_all_packages(&self) -> Result<()> {
        let mut config = self.config.write().expect("config lock poisoned");
        for db in &mut config.databases {
            if db.path.is_empty() || !Path::new(&db.path).is_file() {
                debug!("Skipping package load for {}: no database file", db.name);
                continue;
            }
            db.load_packages()?;
        }
        Ok(())
    }

    /// Open (or return) the storage environment at
    /// `<working directory>/index.db`
    pub fn storage(&self) -> Result<Arc<StorageEnv>> {
        if let Some(env) = self.storage.get() {
            return Ok(Arc::clone(env));
        }
        let env = StorageEnv::open(&self.working_directory.join("index.db"))?;
        let _ = self.storage.set(Arc::clone(&env));
        Ok(env)
    }

    /// Restore in-memory package state from the storage environment
    pub fn restore_packages_from_storage(&self) -> Result<u64> {
        let env = self.storage()?;
        let mut config = self.config.write().expect("config lock poisoned");
        let mut restored = 0u64;
        for db in &mut config.databases {
            let storage = env.database_storage(&format!("{}@{}", db.name, db.arch));
            for (_id, package) in storage.all_entries()? {
                db.update_package(package);
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Write the current packages of a database through the storage cache
    pub fn persist_database(&self, name: &str, arch: &str) -> Result<u64> {
        let env = self.storage()?;
        let config = self.config.read().expect("config lock poisoned");
        let Some(db) = config.find_database(name, arch) else {
            return Ok(0);
        };
        let storage = env.database_storage(&format!("{name}@{arch}"));
        let mut persisted = 0u64;
        for package in db.packages.values() {
            if self
                .package_cache
                .store(&storage, package.clone(), false)?
                .updated
            {
                persisted += 1;
            }
        }
        Ok(persisted)
    }
}

/// Locate an executable: explicit paths are used as-is, bare names are
/// searched in `PATH`
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Top-level structure of the TOML server configuration
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServerConfigFile {
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    #[serde(default)]
    pub pacman_database_path: String,
    #[serde(default)]
    pub package_cache_dirs: Vec<String>,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub building: BuildingSection,
    #[serde(default)]
    pub database: HashMap<String, DatabaseSection>,
}

fn default_working_directory() -> PathBuf {
    PathBuf::from("/var/lib/repoforge")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WebSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildingSection {
    #[serde(default)]
    pub chroot_dir: String,
    #[serde(default = "default_chroot_user")]
    pub chroot_user: String,
    #[serde(default)]
    pub ccache_dir: String,
    #[serde(default)]
    pub package_cache_dir: String,
    #[serde(default)]
    pub test_files_dir: String,
    #[serde(default = "default_makepkg")]
    pub makepkg_path: String,
    #[serde(default = "default_makechrootpkg")]
    pub makechrootpkg_path: String,
    #[serde(default = "default_updpkgsums")]
    pub updpkgsums_path: String,
    #[serde(default = "default_repo_add")]
    pub repo_add_path: String,
    #[serde(default = "default_repo_remove")]
    pub repo_remove_path: String,
}

impl Default for BuildingSection {
    fn default() -> Self {
        Self {
            chroot_dir: String::new(),
            chroot_user: default_chroot_user(),
            ccache_dir: String::new(),
            package_cache_dir: String::new(),
            test_files_dir: String::new(),
            makepkg_path: default_makepkg(),
            makechrootpkg_path: default_makechrootpkg(),
            updpkgsums_path: default_updpkgsums(),
            repo_add_path: default_repo_add(),
            repo_remove_path: default_repo_remove(),
        }
    }
}

fn default_chroot_user() -> String {
    "repoforge".to_string()
}
fn default_makepkg() -> String {
    "makepkg".to_string()
}
fn default_makechrootpkg() -> String {
    "makechrootpkg".to_string()
}
fn default_updpkgsums() -> String {
    "updpkgsums".to_string()
}
fn default_repo_add() -> String {
    "repo-add".to_string()
}
fn default_repo_remove() -> String {
    "repo-remove".to_string()
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DatabaseSection {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub files_path: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub local_pkg_dir: String,
    #[serde(default)]
    pub local_db_dir: String,
    #[serde(default)]
    pub sync_from_mirror: bool,
    #[serde(default)]
    pub sig_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
working-directory = "/tmp/repoforge-test"
pacman-database-path = "/var/lib/pacman"
package-cache-dirs = ["/var/cache/pacman/pkg"]

[web]
bind = "127.0.0.1:8190"

[building]
chroot-dir = "/srv/chroot"
chroot-user = "builder"

[database."core@x86_64"]
path = "repos/core/os/x86_64/core.db"
local-pkg-dir = "repos/core/os/x86_64"
mirrors = ["https://mirror.example.org/core/os/x86_64"]

[database."extra@x86_64"]
path = "repos/extra/os/x86_64/extra.db"
dependencies = ["core"]
sync-from-mirror = true
sig-level = "Required"
"#;

    #[test]
    fn test_parse_and_apply_config() {
        let file: ServerConfigFile = toml::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(file.web.bind, "127.0.0.1:8190");
        assert_eq!(file.database.len(), 2);

        let mut setup = ServiceSetup::default();
        setup.apply_config(file).unwrap();
        assert_eq!(setup.web_bind_address, "127.0.0.1:8190");

        let config = setup.config.read().unwrap();
        assert_eq!(config.databases.len(), 2);
        let core = config.find_database("core", "x86_64").unwrap();
        assert_eq!(core.local_pkg_dir, "repos/core/os/x86_64");
        assert_eq!(core.mirrors.len(), 1);
        let extra = config.find_database("extra", "x86_64").unwrap();
        assert_eq!(extra.dependencies, vec!["core"]);
        assert!(extra.sync_from_mirror);
        assert_eq!(extra.signature_level, SignatureLevel::Required);

        let building = setup.building.read().unwrap();
        assert_eq!(building.chroot_user, "builder");
        assert_eq!(building.chroot_dir, "/srv/chroot");
        assert_eq!(building.tools.makepkg, "makepkg");
    }

    #[test]
    fn test_reapplying_config_discards_removed_databases() {
        let mut setup = ServiceSetup::default();
        let file: ServerConfigFile = toml::from_str(SAMPLE_CONFIG).unwrap();
        setup.apply_config(file).unwrap();

        let reduced = r#"
working-directory = "/tmp/repoforge-test"

[database."core@x86_64"]
path = "repos/core/os/x86_64/core.db"
"#;
        let file: ServerConfigFile = toml::from_str(reduced).unwrap();
        setup.apply_config(file).unwrap();
        let config = setup.config.read().unwrap();
        assert_eq!(config.databases.len(), 1);
        assert!(config.find_database("extra", "x86_64").is_none());
    }

    #[test]
    fn test_invalid_sig_level_is_config_error() {
        let bad = r#"
[database."core@x86_64"]
sig-level = "Sometimes"
"#;
        let file: ServerConfigFile = toml::from_str(bad).unwrap();
        let mut setup = ServiceSetup::default();
        assert!(matches!(
            setup.apply_config(file),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_find_executable() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("definitely-not-a-real-tool-42").is_none());
    }
}
