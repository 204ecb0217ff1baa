// src/database/mod.rs

//! In-memory repository state
//!
//! A [`Database`] mirrors one pacman repository: the packages parsed from its
//! `.db` file plus four derived indices that answer "who provides/requires
//! this dependency or library" without scanning. The indices are kept in sync
//! by funnelling every mutation through [`Database::update_package`],
//! [`Database::remove_package`] and friends.

pub mod config;

pub use config::{BuildOrderOptions, BuildOrderResult, Config, PackageSearchResult, SearchMode};

use crate::error::{Error, Result};
use crate::packages::{walk_through_archive, Dependency, DependencyMode, DependencySet, Package};
use crate::packages::{InstallInfo, PackageInfo, PackageOrigin, SourceInfo};
use crate::version::pkg_vercmp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How a database is used by pacman
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseUsage {
    pub sync: bool,
    pub search: bool,
    pub install: bool,
    pub upgrade: bool,
}

/// Signature verification level of a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignatureLevel {
    #[default]
    Default,
    Never,
    Optional,
    Required,
}

impl SignatureLevel {
    pub fn from_config_value(value: &str) -> Result<Self> {
        match value {
            "Default" | "default" | "" => Ok(SignatureLevel::Default),
            "Never" | "never" => Ok(SignatureLevel::Never),
            "Optional" | "optional" => Ok(SignatureLevel::Optional),
            "Required" | "required" => Ok(SignatureLevel::Required),
            other => Err(Error::Config(format!("Invalid signature level: {other}"))),
        }
    }
}

/// Identifying information of a database, used on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub arch: String,
}

/// Where a binary package lives within the repository directory
#[derive(Debug, Clone, Default)]
pub struct PackageLocation {
    /// `local_pkg_dir/<file name>`; possibly a symlink
    pub path_within_repo: PathBuf,
    /// Resolved target when `path_within_repo` is a symlink
    pub storage_location: PathBuf,
    pub exists: bool,
    pub error: Option<String>,
}

/// Dependencies and libraries of a package that no database in scope provides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedDependencies {
    pub deps: Vec<Dependency>,
    pub libs: Vec<String>,
}

/// Result of classifying the packages of update sources against a database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageUpdates {
    pub version_updates: Vec<PackageUpdate>,
    pub package_updates: Vec<PackageUpdate>,
    pub downgrades: Vec<PackageUpdate>,
    pub orphans: Vec<PackageSearchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageUpdate {
    pub old_version: PackageSearchResult,
    pub new_version: PackageSearchResult,
}

/// A named, arch-scoped collection of packages backed by a `.db` file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub path: String,
    pub files_path: String,
    pub mirrors: Vec<String>,
    pub packages: HashMap<String, Package>,
    pub usage: DatabaseUsage,
    pub signature_level: SignatureLevel,
    pub arch: String,
    /// Names of other databases this database's packages may depend on
    pub dependencies: Vec<String>,
    pub provided_deps: DependencySet,
    pub required_deps: DependencySet,
    pub provided_libs: HashMap<String, Vec<String>>,
    pub required_libs: HashMap<String, Vec<String>>,
    pub local_pkg_dir: String,
    pub local_db_dir: String,
    pub last_update: Option<DateTime<Utc>>,
    pub sync_from_mirror: bool,
    pub to_be_discarded: bool,
}

impl Database {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            arch: "x86_64".to_string(),
            ..Default::default()
        }
    }

    pub fn info(&self) -> DatabaseInfo {
        DatabaseInfo {
            name: self.name.clone(),
            arch: self.arch.clone(),
        }
    }

    /// Derive the `.files` database path from the regular `.db` path
    pub fn files_path_from_regular_path(&self) -> String {
        match self.path.strip_suffix(".db") {
            Some(prefix) => format!("{prefix}.files"),
            None => String::new(),
        }
    }

    /// Register a package's projections in the four dependency indices
    pub fn add_package_dependencies(&mut self, package: &Package) {
        let own = Dependency {
            name: package.name.clone(),
            version: Some(package.version.clone()),
            mode: DependencyMode::Equal,
        };
        self.provided_deps.add(&own, &package.name);
        for provide in &package.provides {
            self.provided_deps.add(provide, &package.name);
        }
        for dependency in &package.dependencies {
            self.required_deps.add(dependency, &package.name);
        }
        for library in &package.libprovides {
            let entry = self.provided_libs.entry(library.clone()).or_default();
            if !entry.contains(&package.name) {
                entry.push(package.name.clone());
            }
        }
        for library in &package.libdepends {
            let entry = self.required_libs.entry(library.clone()).or_default();
            if !entry.contains(&package.name) {
                entry.push(package.name.clone());
            }
        }
    }

    /// Remove all projections of a package from the dependency indices
    pub fn remove_package_dependencies(&mut self, package: &Package) {
        self.provided_deps.remove(&package.name, &package.name);
        for provide in &package.provides {
            self.provided_deps.remove(&provide.name, &package.name);
        }
        for dependency in &package.dependencies {
            self.required_deps.remove(&dependency.name, &package.name);
        }
        for library in &package.libprovides {
            if let Some(entry) = self.provided_libs.get_mut(library) {
                entry.retain(|name| name != &package.name);
                if entry.is_empty() {
                    self.provided_libs.remove(library);
                }
            }
        }
        for library in &package.libdepends {
            if let Some(entry) = self.required_libs.get_mut(library) {
                entry.retain(|name| name != &package.name);
                if entry.is_empty() {
                    self.required_libs.remove(library);
                }
            }
        }
    }

    /// Replace or insert a package by name
    ///
    /// When a package with the same identity (name, version, build date) is
    /// already present its contents-derived fields survive the update.
    pub fn update_package(&mut self, mut package: Package) {
        if let Some(existing) = self.packages.get(&package.name) {
            package.add_deps_and_provides_from_other_package(existing);
            if package.timestamp < existing.timestamp {
                package.timestamp = existing.timestamp;
            }
        }
        self.force_update_package(package);
    }

    /// Replace or insert a package without preserving contents-derived fields
    pub fn force_update_package(&mut self, package: Package) {
        if let Some(existing) = self.packages.remove(&package.name) {
            self.remove_package_dependencies(&existing);
        }
        self.add_package_dependencies(&package);
        self.packages.insert(package.name.clone(), package);
    }

    /// Remove the named package, unregistering all its index projections
    pub fn remove_package(&mut self, package_name: &str) -> Option<Package> {
        let package = self.packages.remove(package_name)?;
        self.remove_package_dependencies(&package);
        Some(package)
    }

    /// Replace the whole package set in one call
    ///
    /// Packages absent from `new_packages` are removed; callers hold the
    /// config writer lock so readers never observe the intermediate state.
    pub fn replace_packages(&mut self, new_packages: Vec<Package>, last_modified: DateTime<Utc>) {
        let new_names: std::collections::HashSet<String> = new_packages
            .iter()
            .map(|package| package.name.clone())
            .collect();
        let stale: Vec<String> = self
            .packages
            .keys()
            .filter(|name| !new_names.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.remove_package(&name);
        }
        for package in new_packages {
            self.update_package(package);
        }
        self.last_update = Some(last_modified);
    }

    pub fn clear_packages(&mut self) {
        self.packages.clear();
        self.provided_deps.clear();
        self.required_deps.clear();
        self.provided_libs.clear();
        self.required_libs.clear();
    }

    /// Scan packages with a user-supplied predicate
    pub fn find_packages(&self, pred: impl Fn(&Database, &Package) -> bool) -> Vec<&Package> {
        let mut matches: Vec<&Package> = self
            .packages
            .values()
            .filter(|package| pred(self, package))
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        matches
    }

    /// Whether any package in this database satisfies the dependency
    pub fn provides_dependency(&self, dependency: &Dependency) -> bool {
        !self.provided_deps.matching_packages(dependency).is_empty()
    }

    /// Rebuild `packages` and the indices from the repository `.db` file
    pub fn load_packages(&mut self) -> Result<()> {
        let path = PathBuf::from(&self.path);
        let last_modified = file_mtime(&path);
        let mut packages_by_dir: HashMap<String, Package> = HashMap::new();

        walk_through_archive(
            &path,
            &|_directory, file_name| matches!(file_name, "desc" | "depends"),
            |directory, file| {
                let package = packages_by_dir.entry(directory.to_string()).or_default();
                let content = String::from_utf8_lossy(&file.content);
                parse_database_description(package, &content);
            },
            |_directory| {},
        )?;

        let mut packages: Vec<Package> = packages_by_dir
            .into_values()
            .filter(|package| !package.name.is_empty())
            .collect();
        for package in &mut packages {
            package.origin = PackageOrigin::DatabaseFileList;
            package.timestamp = last_modified;
        }
        debug!(
            "Loaded {} packages for database {}",
            packages.len(),
            self.name
        );
        self.replace_packages(packages, last_modified.unwrap_or_else(Utc::now));
        Ok(())
    }

    /// Dependencies and libraries that would be unresolved after applying the
    /// given change
    ///
    /// Resolution considers this database, every database in its
    /// `dependencies` closure and `new_packages`; providers listed in
    /// `removed_packages` no longer count.
    pub fn detect_unresolved_packages(
        &self,
        config: &Config,
        new_packages: &[Package],
        removed_packages: &DependencySet,
    ) -> Vec<(String, UnresolvedDependencies)> {
        let mut scope: Vec<&Database> = vec![self];
        if let Ok(order) = config.compute_database_dependency_order(self) {
            for index in order {
                let db = &config.databases[index];
                if db.name != self.name || db.arch != self.arch {
                    scope.push(db);
                }
            }
        }

        let dependency_resolved = |dependency: &Dependency| -> bool {
            let removed = removed_packages.packages_for(&dependency.name);
            for db in &scope {
                let providers = db.provided_deps.matching_packages(dependency);
                if providers.iter().any(|provider| !removed.contains(provider)) {
                    return true;
                }
            }
            new_packages
                .iter()
                .any(|package| package.provides_dependency(dependency))
        };
        let library_resolved = |library: &str| -> bool {
            scope
                .iter()
                .any(|db| db.provided_libs.contains_key(library))
                || new_packages
                    .iter()
                    .any(|package| package.libprovides.iter().any(|entry| entry == library))
        };

        let mut unresolved = Vec::new();
        let candidates = self
            .packages
            .values()
            .chain(new_packages.iter());
        for package in candidates {
            let mut entry = UnresolvedDependencies::default();
            for dependency in &package.dependencies {
                if !dependency_resolved(dependency) {
                    entry.deps.push(dependency.clone());
                }
            }
            for library in &package.libdepends {
                if !library_resolved(library) {
                    entry.libs.push(library.clone());
                }
            }
            if !entry.deps.is_empty() || !entry.libs.is_empty() {
                unresolved.push((package.name.clone(), entry));
            }
        }
        unresolved.sort_by(|a, b| a.0.cmp(&b.0));
        unresolved
    }

    /// Classify the packages of `sources` against this database
    pub fn check_for_updates(&self, sources: &[&Database]) -> PackageUpdates {
        let mut updates = PackageUpdates::default();
        for (name, package) in &self.packages {
            let mut newest: Option<(&Database, &Package)> = None;
            for source in sources {
                if let Some(candidate) = source.packages.get(name) {
                    let is_newer = match &newest {
                        Some((_, current)) => {
                            pkg_vercmp(&candidate.version, &current.version) == Ordering::Greater
                        }
                        None => true,
                    };
                    if is_newer {
                        newest = Some((source, candidate));
                    }
                }
            }
            let Some((source, candidate)) = newest else {
                updates
                    .orphans
                    .push(PackageSearchResult::detached(self.info(), package.clone()));
                continue;
            };
            let update = PackageUpdate {
                old_version: PackageSearchResult::detached(self.info(), package.clone()),
                new_version: PackageSearchResult::detached(source.info(), candidate.clone()),
            };
            match pkg_vercmp(&candidate.version, &package.version) {
                Ordering::Greater => updates.version_updates.push(update),
                Ordering::Less => updates.downgrades.push(update),
                Ordering::Equal => {
                    let old_build = package.package_info.as_ref().and_then(|info| info.build_date);
                    let new_build = candidate
                        .package_info
                        .as_ref()
                        .and_then(|info| info.build_date);
                    if new_build > old_build {
                        updates.package_updates.push(update);
                    }
                }
            }
        }
        updates
    }

    /// Resolve `local_pkg_dir/<file_name>` to its storage location
    ///
    /// Follows one level of relative symlinks; the symlink target becomes the
    /// storage location while `path_within_repo` keeps pointing at the link.
    pub fn locate_package(&self, file_name: &str) -> PackageLocation {
        let mut location = PackageLocation {
            path_within_repo: Path::new(&self.local_pkg_dir).join(file_name),
            ..Default::default()
        };
        let metadata = match std::fs::symlink_metadata(&location.path_within_repo) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return location,
            Err(e) => {
                location.error = Some(e.to_string());
                return location;
            }
        };
        if !metadata.file_type().is_symlink() {
            location.exists = metadata.is_file();
            return location;
        }
        match std::fs::read_link(&location.path_within_repo) {
            Ok(target) => {
                location.storage_location = if target.is_absolute() {
                    target
                } else {
                    match location.path_within_repo.parent() {
                        Some(parent) => parent.join(&target),
                        None => target,
                    }
                };
                location.exists = location.storage_location.is_file();
            }
            Err(e) => location.error = Some(e.to_string()),
        }
        location
    }
}

/// Modification time of a file as UTC timestamp
pub fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Parse a `desc`/`depends` file of a repository database entry
///
/// The format is a sequence of `%SECTION%` headers each followed by one value
/// per line, terminated by a blank line.
fn parse_database_description(package: &mut Package, content: &str) {
    let mut section = "";
    for line in content.lines() {
        let line = line.trim_end();
        if line.starts_with('%') && line.ends_with('%') && line.len() > 2 {
            section = &line[1..line.len() - 1];
            continue;
        }
        if line.is_empty() {
            continue;
        }
        apply_description_value(package, section, line);
    }
}

fn apply_description_value(package: &mut Package, section: &str, value: &str) {
    match section {
        "NAME" => package.name = value.to_string(),
        "VERSION" => package.version = value.to_string(),
        "DESC" => package.description = value.to_string(),
        "URL" => package.upstream_url = value.to_string(),
        "LICENSE" => package.licenses.push(value.to_string()),
        "GROUPS" => package.groups.push(value.to_string()),
        "DEPENDS" => package.dependencies.push(Dependency::parse(value)),
        "OPTDEPENDS" => package.optional_dependencies.push(Dependency::parse(value)),
        "PROVIDES" => package.provides.push(Dependency::parse(value)),
        "REPLACES" => package.replaces.push(Dependency::parse(value)),
        "CONFLICTS" => package.conflicts.push(Dependency::parse(value)),
        "FILENAME" => package_info(package).file_name = value.to_string(),
        "ARCH" => package_info(package).arch = value.to_string(),
        "PACKAGER" => package_info(package).packager = value.to_string(),
        "CSIZE" => package_info(package).size = value.parse().unwrap_or(0),
        "BUILDDATE" => {
            package_info(package).build_date = value
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
        }
        "ISIZE" => {
            package.install_info.get_or_insert_with(InstallInfo::default).installed_size =
                value.parse().unwrap_or(0);
        }
        "MAKEDEPENDS" => source_info(package)
            .make_dependencies
            .push(Dependency::parse(value)),
        "CHECKDEPENDS" => source_info(package)
            .check_dependencies
            .push(Dependency::parse(value)),
        _ => {}
    }
}

fn package_info(package: &mut Package) -> &mut PackageInfo {
    package.package_info.get_or_insert_with(PackageInfo::default)
}

fn source_info(package: &mut Package) -> &mut SourceInfo {
    package.source_info.get_or_insert_with(SourceInfo::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::archive::write_test_archive;

    fn package_with_deps(name: &str, version: &str, deps: &[&str], libs: &[&str]) -> Package {
        let mut package = Package::new(name, version);
        package.dependencies = deps.iter().map(|dep| Dependency::parse(dep)).collect();
        package.libdepends = libs.iter().map(|lib| lib.to_string()).collect();
        package
    }

    #[test]
    fn test_indices_track_updates_and_removal() {
        let mut db = Database::new("core", "core.db");
        let mut package = package_with_deps("cmake", "3.8.2-1", &["curl"], &[]);
        package.provides = vec![Dependency::parse("cmake-git=3.8.2")];
        package.libprovides = vec!["elf-x86_64::libcmake.so".to_string()];
        package.libdepends = vec!["elf-x86_64::libstdc++.so.6".to_string()];
        db.update_package(package);

        assert_eq!(db.provided_deps.packages_for("cmake"), vec!["cmake"]);
        assert_eq!(db.provided_deps.packages_for("cmake-git"), vec!["cmake"]);
        assert_eq!(db.required_deps.packages_for("curl"), vec!["cmake"]);
        assert_eq!(
            db.provided_libs["elf-x86_64::libcmake.so"],
            vec!["cmake".to_string()]
        );
        assert_eq!(
            db.required_libs["elf-x86_64::libstdc++.so.6"],
            vec!["cmake".to_string()]
        );

        db.remove_package("cmake");
        assert!(db.packages.is_empty());
        assert!(db.provided_deps.is_empty());
        assert!(db.required_deps.is_empty());
        assert!(db.provided_libs.is_empty());
        assert!(db.required_libs.is_empty());
    }

    #[test]
    fn test_update_preserves_contents_derived_fields() {
        let mut db = Database::new("core", "core.db");
        let mut analyzed = Package::new("cmake", "3.8.2-1");
        analyzed.package_info = Some(PackageInfo::default());
        analyzed.libdepends = vec!["elf-x86_64::libstdc++.so.6".to_string()];
        analyzed.origin = PackageOrigin::PackageContents;
        db.force_update_package(analyzed);

        // a fresh database entry of the same identity keeps the parsed libs
        let mut from_db = Package::new("cmake", "3.8.2-1");
        from_db.package_info = Some(PackageInfo::default());
        from_db.origin = PackageOrigin::DatabaseFileList;
        db.update_package(from_db);

        let stored = &db.packages["cmake"];
        assert_eq!(stored.libdepends, vec!["elf-x86_64::libstdc++.so.6"]);
        assert_eq!(stored.origin, PackageOrigin::PackageContents);

        // force update drops them
        let mut plain = Package::new("cmake", "3.8.2-1");
        plain.package_info = Some(PackageInfo::default());
        db.force_update_package(plain);
        assert!(db.packages["cmake"].libdepends.is_empty());
    }

    #[test]
    fn test_replace_packages_removes_absent_names() {
        let mut db = Database::new("core", "core.db");
        db.update_package(Package::new("stays", "1-1"));
        db.update_package(Package::new("goes", "1-1"));
        db.replace_packages(
            vec![Package::new("stays", "2-1"), Package::new("fresh", "1-1")],
            Utc::now(),
        );
        assert_eq!(db.packages.len(), 2);
        assert!(db.packages.contains_key("stays"));
        assert!(db.packages.contains_key("fresh"));
        assert!(!db.packages.contains_key("goes"));
        assert!(db.provided_deps.packages_for("goes").is_empty());
        assert_eq!(db.packages["stays"].version, "2-1");
    }

    #[test]
    fn test_load_packages_from_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("core.db.tar.gz");
        let desc = b"%FILENAME%\ncmake-3.8.2-1-x86_64.pkg.tar.xz\n\n%NAME%\ncmake\n\n%VERSION%\n3.8.2-1\n\n%ARCH%\nx86_64\n\n%DEPENDS%\ncurl\nlibarchive\n\n%BUILDDATE%\n1497296234\n";
        write_test_archive(
            &db_path,
            &["cmake-3.8.2-1"],
            &[("cmake-3.8.2-1/desc", desc.as_slice())],
        )
        .unwrap();

        let mut db = Database::new("core", db_path.to_str().unwrap().to_string());
        db.load_packages().unwrap();

        assert_eq!(db.packages.len(), 1);
        let package = &db.packages["cmake"];
        assert_eq!(package.version, "3.8.2-1");
        assert_eq!(package.origin, PackageOrigin::DatabaseFileList);
        assert_eq!(package.dependencies.len(), 2);
        assert_eq!(
            package.package_info.as_ref().unwrap().file_name,
            "cmake-3.8.2-1-x86_64.pkg.tar.xz"
        );
        assert_eq!(db.required_deps.packages_for("curl"), vec!["cmake"]);
    }

    #[test]
    fn test_check_for_updates() {
        let mut db = Database::new("boost", "boost.db");
        db.update_package(Package::new("boost", "1.72.0-1"));
        db.update_package(Package::new("stale", "1-1"));
        db.update_package(Package::new("ahead", "9-1"));

        let mut source = Database::new("boost-testing", "boost-testing.db");
        source.update_package(Package::new("boost", "1.73.0-1"));
        source.update_package(Package::new("ahead", "1-1"));

        let updates = db.check_for_updates(&[&source]);
        assert_eq!(updates.version_updates.len(), 1);
        assert_eq!(updates.version_updates[0].new_version.pkg.version, "1.73.0-1");
        assert_eq!(updates.downgrades.len(), 1);
        assert_eq!(updates.orphans.len(), 1);
        assert_eq!(updates.orphans[0].pkg.name, "stale");
    }

    #[test]
    fn test_locate_package_follows_relative_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("os/x86_64");
        let any = dir.path().join("os/any");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::create_dir_all(&any).unwrap();
        let target = any.join("tool-1-1-any.pkg.tar.zst");
        std::fs::write(&target, b"pkg").unwrap();
        std::os::unix::fs::symlink(
            "../any/tool-1-1-any.pkg.tar.zst",
            repo.join("tool-1-1-any.pkg.tar.zst"),
        )
        .unwrap();

        let mut db = Database::new("misc", "misc.db");
        db.local_pkg_dir = repo.to_str().unwrap().to_string();
        let location = db.locate_package("tool-1-1-any.pkg.tar.zst");
        assert!(location.exists);
        assert!(location.error.is_none());
        assert!(location
            .storage_location
            .to_string_lossy()
            .ends_with("any/tool-1-1-any.pkg.tar.zst"));

        let missing = db.locate_package("absent-1-1-any.pkg.tar.zst");
        assert!(!missing.exists);
        assert!(missing.error.is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let mut db = Database::new("core", "core.db");
        db.dependencies = vec!["base".to_string()];
        let mut package = Package::from_pkg_file_name("cmake-3.8.2-1-x86_64.pkg.tar.xz").unwrap();
        package.libdepends = vec!["elf-x86_64::libstdc++.so.6".to_string()];
        db.update_package(package.clone());

        let json = serde_json::to_string(&package).unwrap();
        let restored: Package = serde_json::from_str(&json).unwrap();
        assert_eq!(package, restored);

        let json = serde_json::to_string(&db).unwrap();
        let restored: Database = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.name, db.name);
        assert_eq!(restored.dependencies, db.dependencies);
        assert_eq!(restored.packages, db.packages);
        assert_eq!(restored.provided_deps, db.provided_deps);
        assert_eq!(restored.required_libs, db.required_libs);
    }

    #[test]
    fn test_detect_unresolved_packages() {
        let mut config = Config::default();
        let mut core = Database::new("core", "core.db");
        core.update_package(Package::new("glibc", "2.34-1"));
        config.databases.push(core);

        let mut db = Database::new("extra", "extra.db");
        db.dependencies = vec!["core".to_string()];
        db.update_package(package_with_deps(
            "tool",
            "1-1",
            &["glibc", "missing-dep"],
            &["elf-x86_64::libmissing.so"],
        ));
        config.databases.push(db.clone());

        let unresolved = db.detect_unresolved_packages(&config, &[], &DependencySet::new());
        assert_eq!(unresolved.len(), 1);
        let (name, entry) = &unresolved[0];
        assert_eq!(name, "tool");
        assert_eq!(entry.deps.len(), 1);
        assert_eq!(entry.deps[0].name, "missing-dep");
        assert_eq!(entry.libs, vec!["elf-x86_64::libmissing.so"]);
    }
}
