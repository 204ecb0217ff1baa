// src/database/config.rs

//! Service-wide package configuration
//!
//! [`Config`] owns every [`Database`] plus the distinguished AUR database and
//! answers cross-database queries: package search in its various modes,
//! database dependency ordering and build-order computation. It is shared
//! behind a reader-writer lock; all methods here take `&self`/`&mut self` and
//! leave the locking to the caller.

use crate::database::{Database, DatabaseInfo, SignatureLevel};
use crate::packages::{Dependency, DependencySet, Package};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Result of a package search: the package and the database it came from
///
/// While the config lock is held the `db_index` side references the live
/// database; on the wire only the `db` info survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSearchResult {
    #[serde(skip)]
    pub db_index: Option<usize>,
    pub db: DatabaseInfo,
    pub pkg: Package,
}

impl PackageSearchResult {
    pub fn live(db_index: usize, db: &Database, pkg: Package) -> Self {
        Self {
            db_index: Some(db_index),
            db: db.info(),
            pkg,
        }
    }

    /// A result that no longer references a live database
    pub fn detached(db: DatabaseInfo, pkg: Package) -> Self {
        Self {
            db_index: None,
            db,
            pkg,
        }
    }
}

/// Search modes exposed by the packages API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMode {
    Name,
    NameContains,
    Regex,
    Provides,
    Depends,
    Libprovides,
    Libdepends,
}

impl SearchMode {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "name" => Some(SearchMode::Name),
            "name-contains" => Some(SearchMode::NameContains),
            "regex" => Some(SearchMode::Regex),
            "provides" => Some(SearchMode::Provides),
            "depends" => Some(SearchMode::Depends),
            "libprovides" => Some(SearchMode::Libprovides),
            "libdepends" => Some(SearchMode::Libdepends),
            _ => None,
        }
    }
}

/// Options of [`Config::compute_build_order`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOrderOptions {
    /// Include dependencies whose only provider is a source-only (AUR)
    /// package
    pub include_source_only_dependencies: bool,
    /// Include every transitive dependency (implies the above)
    pub include_all_dependencies: bool,
    /// Add make and check dependencies as edges
    pub consider_build_dependencies: bool,
}

impl BuildOrderOptions {
    fn includes_source_only(&self) -> bool {
        self.include_source_only_dependencies || self.include_all_dependencies
    }
}

/// Result of a build-order computation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOrderResult {
    pub order: Vec<PackageSearchResult>,
    /// Cycle members that could not be emitted into `order`
    pub cycle: Vec<PackageSearchResult>,
    /// Dependencies deliberately skipped (e.g. source-only providers without
    /// the corresponding option)
    pub ignored: Vec<String>,
    pub success: bool,
}

/// Signature-level configuration shared by all databases
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureLevelConfig {
    pub default_level: SignatureLevel,
}

/// The full in-memory repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub databases: Vec<Database>,
    /// Source-only packages from the AUR
    pub aur: Database,
    pub architectures: BTreeSet<String>,
    pub pacman_database_path: String,
    pub package_cache_dirs: Vec<String>,
    pub signature_level: SignatureLevelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            databases: Vec::new(),
            aur: Database::new("aur", String::new()),
            architectures: BTreeSet::new(),
            pacman_database_path: String::new(),
            package_cache_dirs: Vec::new(),
            signature_level: SignatureLevelConfig::default(),
        }
    }
}

impl Config {
    /// Split a database denotation like "core@i686" into name and arch
    pub fn parse_database_denotation(denotation: &str) -> (&str, &str) {
        match denotation.split_once('@') {
            Some((name, arch)) => (name, arch),
            None => (denotation, "x86_64"),
        }
    }

    /// Split a package denotation like "core/cmake" or "core@i686/cmake"
    ///
    /// Returns (db name, db arch, package name); db parts are empty when the
    /// denotation does not restrict the database.
    pub fn parse_package_denotation(denotation: &str) -> (&str, &str, &str) {
        match denotation.split_once('/') {
            Some((db, package)) => {
                let (name, arch) = Self::parse_database_denotation(db);
                (name, arch, package)
            }
            None => ("", "", denotation),
        }
    }

    pub fn find_database(&self, name: &str, arch: &str) -> Option<&Database> {
        self.databases
            .iter()
            .find(|db| db.name == name && db.arch == arch)
    }

    pub fn find_database_mut(&mut self, name: &str, arch: &str) -> Option<&mut Database> {
        self.databases
            .iter_mut()
            .find(|db| db.name == name && db.arch == arch)
    }

    pub fn database_index(&self, name: &str, arch: &str) -> Option<usize> {
        self.databases
            .iter()
            .position(|db| db.name == name && db.arch == arch)
    }

    pub fn find_or_create_database(&mut self, name: &str, arch: &str) -> &mut Database {
        if let Some(index) = self.database_index(name, arch) {
            return &mut self.databases[index];
        }
        let mut db = Database::new(name, String::new());
        db.arch = arch.to_string();
        self.architectures.insert(arch.to_string());
        self.databases.push(db);
        self.databases.last_mut().expect("database just pushed")
    }

    /// Mark all databases so a subsequent reload can drop the ones that are
    /// no longer configured
    pub fn mark_all_databases_to_be_discarded(&mut self) {
        for db in &mut self.databases {
            db.to_be_discarded = true;
        }
    }

    pub fn discard_databases(&mut self) {
        self.databases.retain(|db| !db.to_be_discarded);
    }

    /// Search packages across all databases
    pub fn find_packages(&self, mode: SearchMode, term: &str) -> Vec<PackageSearchResult> {
        match mode {
            SearchMode::Name => {
                let (db_name, db_arch, package) = Self::parse_package_denotation(term);
                let mut results = Vec::new();
                for (index, db) in self.databases.iter().enumerate() {
                    if !db_name.is_empty() && (db.name != db_name || db.arch != db_arch) {
                        continue;
                    }
                    if let Some(found) = db.packages.get(package) {
                        results.push(PackageSearchResult::live(index, db, found.clone()));
                    }
                }
                results
            }
            SearchMode::NameContains => self.find_packages_with(|_db, package| {
                package.name.contains(term) || package.description.contains(term)
            }),
            SearchMode::Regex => match Regex::new(term) {
                Ok(regex) => {
                    self.find_packages_with(|_db, package| regex.is_match(&package.name))
                }
                Err(_) => Vec::new(),
            },
            SearchMode::Provides => {
                self.find_packages_by_dependency(&Dependency::parse(term), false)
            }
            SearchMode::Depends => self.find_packages_by_dependency(&Dependency::parse(term), true),
            SearchMode::Libprovides => self.find_packages_providing_library(term, false),
            SearchMode::Libdepends => self.find_packages_providing_library(term, true),
        }
    }

    /// Search packages with an arbitrary predicate
    pub fn find_packages_with(
        &self,
        pred: impl Fn(&Database, &Package) -> bool,
    ) -> Vec<PackageSearchResult> {
        let mut results = Vec::new();
        for (index, db) in self.databases.iter().enumerate() {
            for package in db.find_packages(&pred) {
                results.push(PackageSearchResult::live(index, db, package.clone()));
            }
        }
        results
    }

    /// Packages providing (`reverse = false`) or requiring (`reverse = true`)
    /// the given dependency
    pub fn find_packages_by_dependency(
        &self,
        dependency: &Dependency,
        reverse: bool,
    ) -> Vec<PackageSearchResult> {
        let mut results = Vec::new();
        for (index, db) in self.databases.iter().enumerate() {
            let index_set = if reverse {
                &db.required_deps
            } else {
                &db.provided_deps
            };
            let names: Vec<String> = if reverse {
                index_set
                    .packages_for(&dependency.name)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            } else {
                index_set
                    .matching_packages(dependency)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            };
            for name in names {
                if let Some(package) = db.packages.get(&name) {
                    results.push(PackageSearchResult::live(index, db, package.clone()));
                }
            }
        }
        results
    }

    /// First package providing the dependency, in database order
    pub fn find_package(&self, dependency: &Dependency) -> Option<PackageSearchResult> {
        self.find_packages_by_dependency(dependency, false)
            .into_iter()
            .next()
    }

    /// Packages providing (`reverse = false`) or needing (`reverse = true`)
    /// the given library key
    pub fn find_packages_providing_library(
        &self,
        library: &str,
        reverse: bool,
    ) -> Vec<PackageSearchResult> {
        let mut results = Vec::new();
        for (index, db) in self.databases.iter().enumerate() {
            let map = if reverse {
                &db.required_libs
            } else {
                &db.provided_libs
            };
            if let Some(names) = map.get(library) {
                for name in names {
                    if let Some(package) = db.packages.get(name) {
                        results.push(PackageSearchResult::live(index, db, package.clone()));
                    }
                }
            }
        }
        results
    }

    /// Topological order of `db` and its transitive database dependencies
    ///
    /// The returned indices start with `db` itself; children are visited in
    /// the order they appear in `dependencies`. Cycles and unresolved names
    /// are reported as an error string.
    pub fn compute_database_dependency_order(
        &self,
        db: &Database,
    ) -> std::result::Result<Vec<usize>, String> {
        let start = self
            .database_index(&db.name, &db.arch)
            .ok_or_else(|| format!("database \"{}@{}\" is not configured", db.name, db.arch))?;

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<usize, u8> = HashMap::new();
        let mut post_order = Vec::new();
        self.dependency_order_visit(start, &mut state, &mut post_order)?;
        post_order.reverse();
        Ok(post_order)
    }

    fn dependency_order_visit(
        &self,
        index: usize,
        state: &mut HashMap<usize, u8>,
        post_order: &mut Vec<usize>,
    ) -> std::result::Result<(), String> {
        match state.get(&index) {
            Some(1) => {
                return Err(format!(
                    "cyclic dependency involving database \"{}\"",
                    self.databases[index].name
                ))
            }
            Some(2) => return Ok(()),
            _ => {}
        }
        state.insert(index, 1);
        let arch = self.databases[index].arch.clone();
        let dependency_names = self.databases[index].dependencies.clone();
        for name in &dependency_names {
            let child = self.database_index(name, &arch).ok_or_else(|| {
                format!(
                    "database \"{}\" required by \"{}\" does not exist",
                    name, self.databases[index].name
                )
            })?;
            self.dependency_order_visit(child, state, post_order)?;
        }
        state.insert(index, 2);
        post_order.push(index);
        Ok(())
    }

    /// Databases that (transitively) depend on `db`
    pub fn compute_databases_requiring_database(&self, db: &Database) -> Vec<usize> {
        let mut requiring = Vec::new();
        for (index, candidate) in self.databases.iter().enumerate() {
            if candidate.name == db.name && candidate.arch == db.arch {
                continue;
            }
            if let Ok(order) = self.compute_database_dependency_order(candidate) {
                if order
                    .iter()
                    .any(|&i| self.databases[i].name == db.name && self.databases[i].arch == db.arch)
                {
                    requiring.push(index);
                }
            }
        }
        requiring
    }

    /// Pull the runtime dependency closure of `package` within `relevant_dbs`
    ///
    /// Providers are added to `runtime_dependencies` as (database index,
    /// package name); dependencies without any provider are recorded in
    /// `missing_dependencies` keyed by the requiring package.
    pub fn pull_dependent_packages(
        &self,
        package: &Package,
        relevant_dbs: &HashSet<usize>,
        runtime_dependencies: &mut HashSet<(usize, String)>,
        missing_dependencies: &mut DependencySet,
    ) {
        for dependency in &package.dependencies {
            let mut found = false;
            for &db_index in relevant_dbs {
                let db = &self.databases[db_index];
                for provider in db.provided_deps.matching_packages(dependency) {
                    found = true;
                    let key = (db_index, provider.to_string());
                    if runtime_dependencies.insert(key) {
                        if let Some(provider_package) = db.packages.get(provider) {
                            self.pull_dependent_packages(
                                provider_package,
                                relevant_dbs,
                                runtime_dependencies,
                                missing_dependencies,
                            );
                        }
                    }
                }
            }
            if !found {
                missing_dependencies.add(dependency, &package.name);
            }
        }
    }

    /// Expand dependency denotations to producing packages and sort them so
    /// that dependencies come before their dependents
    pub fn compute_build_order(
        &self,
        dependency_denotations: &[String],
        options: BuildOrderOptions,
    ) -> BuildOrderResult {
        let mut result = BuildOrderResult::default();
        let mut visit = BuildOrderVisit {
            config: self,
            options,
            state: HashMap::new(),
            stack: Vec::new(),
            requested: HashSet::new(),
            result: &mut result,
        };

        // resolve the user-supplied set first so edges between its members
        // are honored even without IncludeAllDependencies
        let mut success = true;
        let mut seeds = Vec::new();
        for denotation in dependency_denotations {
            let dependency = Dependency::parse(denotation);
            match visit.resolve_providers(&dependency) {
                Resolution::Found(providers) => {
                    for provider in &providers {
                        visit.requested.insert(provider.key());
                    }
                    seeds.push(providers);
                }
                Resolution::SourceOnlySkipped => visit.result.ignored.push(denotation.clone()),
                Resolution::NotFound => {
                    visit.result.ignored.push(denotation.clone());
                    success = false;
                }
            }
        }

        for providers in seeds {
            for provider in providers {
                success &= visit.visit(provider);
            }
        }

        result.success = success && result.cycle.is_empty();
        result
    }
}

/// Outcome of resolving a dependency to producing packages
enum Resolution {
    Found(Vec<Provider>),
    /// Only a source-only provider exists and the options exclude it
    SourceOnlySkipped,
    NotFound,
}

/// A provider located during build-order computation
#[derive(Debug, Clone)]
struct Provider {
    /// Index into `Config::databases`; `None` for the AUR
    db_index: Option<usize>,
    name: String,
}

impl Provider {
    fn key(&self) -> (isize, String) {
        let db = self.db_index.map(|index| index as isize).unwrap_or(-1);
        (db, self.name.clone())
    }
}

struct BuildOrderVisit<'a> {
    config: &'a Config,
    options: BuildOrderOptions,
    /// 1 = on stack, 2 = done
    state: HashMap<(isize, String), u8>,
    stack: Vec<(isize, String)>,
    requested: HashSet<(isize, String)>,
    result: &'a mut BuildOrderResult,
}

impl BuildOrderVisit<'_> {
    fn package(&self, provider: &Provider) -> Option<(&Database, &Package)> {
        let db = match provider.db_index {
            Some(index) => &self.config.databases[index],
            None => &self.config.aur,
        };
        db.packages.get(&provider.name).map(|package| (db, package))
    }

    fn search_result(&self, provider: &Provider) -> Option<PackageSearchResult> {
        let (db, package) = self.package(provider)?;
        Some(match provider.db_index {
            Some(index) => PackageSearchResult::live(index, db, package.clone()),
            None => PackageSearchResult::detached(db.info(), package.clone()),
        })
    }

    fn resolve_providers(&self, dependency: &Dependency) -> Resolution {
        let mut providers = Vec::new();
        for (index, db) in self.config.databases.iter().enumerate() {
            for name in db.provided_deps.matching_packages(dependency) {
                providers.push(Provider {
                    db_index: Some(index),
                    name: name.to_string(),
                });
            }
        }
        if !providers.is_empty() {
            return Resolution::Found(providers);
        }
        let aur_providers: Vec<Provider> = self
            .config
            .aur
            .provided_deps
            .matching_packages(dependency)
            .into_iter()
            .map(|name| Provider {
                db_index: None,
                name: name.to_string(),
            })
            .collect();
        if aur_providers.is_empty() {
            return Resolution::NotFound;
        }
        if !self.options.includes_source_only() {
            return Resolution::SourceOnlySkipped;
        }
        Resolution::Found(aur_providers)
    }

    fn visit(&mut self, provider: Provider) -> bool {
        let key = provider.key();
        match self.state.get(&key) {
            Some(2) => return true,
            Some(1) => {
                // back edge: everything from the first occurrence on the
                // stack participates in the cycle
                let position = self.stack.iter().position(|entry| entry == &key);
                if let Some(position) = position {
                    let members: Vec<(isize, String)> = self.stack[position..].to_vec();
                    for member in members {
                        let member_provider = Provider {
                            db_index: (member.0 >= 0).then_some(member.0 as usize),
                            name: member.1.clone(),
                        };
                        if !self
                            .result
                            .cycle
                            .iter()
                            .any(|entry| entry.pkg.name == member.1)
                        {
                            if let Some(search_result) = self.search_result(&member_provider) {
                                self.result.cycle.push(search_result);
                            }
                        }
                    }
                }
                return false;
            }
            _ => {}
        }

        let Some((_db, package)) = self.package(&provider) else {
            return true;
        };
        let package = package.clone();

        self.state.insert(key.clone(), 1);
        self.stack.push(key.clone());

        let mut edges: Vec<Dependency> = package.dependencies.clone();
        if self.options.consider_build_dependencies {
            if let Some(source_info) = &package.source_info {
                edges.extend(source_info.make_dependencies.iter().cloned());
                edges.extend(source_info.check_dependencies.iter().cloned());
            }
        }

        let mut success = true;
        for dependency in &edges {
            let Resolution::Found(children) = self.resolve_providers(dependency) else {
                continue;
            };
            for child in children {
                let child_key = child.key();
                if child_key == key {
                    continue; // self-provision
                }
                let in_scope = self.options.include_all_dependencies
                    || self.requested.contains(&child_key)
                    || (self.options.includes_source_only() && child.db_index.is_none());
                if in_scope {
                    success &= self.visit(child);
                }
            }
        }

        self.stack.pop();
        // a node that became part of a cycle stays un-emitted
        if self
            .result
            .cycle
            .iter()
            .any(|entry| entry.pkg.name == provider.name)
        {
            self.state.insert(key, 2);
            return false;
        }
        self.state.insert(key, 2);
        if let Some(search_result) = self.search_result(&provider) {
            self.result.order.push(search_result);
        }
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_packages(name: &str, packages: &[(&str, &str, &[&str])]) -> Database {
        let mut db = Database::new(name, format!("{name}.db"));
        for (package_name, version, deps) in packages {
            let mut package = Package::new(*package_name, *version);
            package.dependencies = deps.iter().map(|dep| Dependency::parse(dep)).collect();
            db.update_package(package);
        }
        db
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        let mut core = db_with_packages(
            "core",
            &[("glibc", "2.34-1", &[]), ("zlib", "1:1.2.11-4", &["glibc"])],
        );
        core.local_pkg_dir = "repos/core/os/x86_64".to_string();
        config.databases.push(core);
        let mut extra = db_with_packages("extra", &[("cmake", "3.8.2-1", &["zlib"])]);
        extra.dependencies = vec!["core".to_string()];
        config.databases.push(extra);
        config
    }

    #[test]
    fn test_denotation_parsing() {
        assert_eq!(Config::parse_database_denotation("core@i686"), ("core", "i686"));
        assert_eq!(Config::parse_database_denotation("core"), ("core", "x86_64"));
        assert_eq!(
            Config::parse_package_denotation("core/cmake"),
            ("core", "x86_64", "cmake")
        );
        assert_eq!(Config::parse_package_denotation("cmake"), ("", "", "cmake"));
    }

    #[test]
    fn test_find_packages_by_name() {
        let config = test_config();
        let results = config.find_packages(SearchMode::Name, "cmake");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].db.name, "extra");
        assert_eq!(results[0].db_index, Some(1));

        let scoped = config.find_packages(SearchMode::Name, "core/cmake");
        assert!(scoped.is_empty());
    }

    #[test]
    fn test_find_packages_by_dependency() {
        let config = test_config();
        let providers = config.find_packages_by_dependency(&Dependency::parse("zlib>=1.2"), false);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].pkg.name, "zlib");

        let requirers = config.find_packages_by_dependency(&Dependency::parse("zlib"), true);
        assert_eq!(requirers.len(), 1);
        assert_eq!(requirers[0].pkg.name, "cmake");
    }

    #[test]
    fn test_database_dependency_order() {
        let config = test_config();
        let extra = config.find_database("extra", "x86_64").unwrap();
        let order = config.compute_database_dependency_order(extra).unwrap();
        let names: Vec<&str> = order
            .iter()
            .map(|&index| config.databases[index].name.as_str())
            .collect();
        assert_eq!(names, vec!["extra", "core"]);
    }

    #[test]
    fn test_database_dependency_cycle_is_reported() {
        let mut config = test_config();
        config.databases[0].dependencies = vec!["extra".to_string()];
        let extra = config.databases[1].clone();
        let error = config.compute_database_dependency_order(&extra).unwrap_err();
        assert!(error.contains("cyclic"), "unexpected error: {error}");
    }

    #[test]
    fn test_database_dependency_unknown_name() {
        let mut config = test_config();
        config.databases[1].dependencies = vec!["missing".to_string()];
        let extra = config.databases[1].clone();
        let error = config.compute_database_dependency_order(&extra).unwrap_err();
        assert!(error.contains("missing"), "unexpected error: {error}");
    }

    #[test]
    fn test_build_order_sorts_dependencies_first() {
        let config = test_config();
        let result = config.compute_build_order(
            &["cmake".to_string(), "zlib".to_string()],
            BuildOrderOptions::default(),
        );
        assert!(result.success);
        let names: Vec<&str> = result.order.iter().map(|entry| entry.pkg.name.as_str()).collect();
        assert_eq!(names, vec!["zlib", "cmake"]);
        assert!(result.cycle.is_empty());
    }

    #[test]
    fn test_build_order_includes_all_dependencies() {
        let config = test_config();
        let result = config.compute_build_order(
            &["cmake".to_string()],
            BuildOrderOptions {
                include_all_dependencies: true,
                ..Default::default()
            },
        );
        assert!(result.success);
        let names: Vec<&str> = result.order.iter().map(|entry| entry.pkg.name.as_str()).collect();
        assert_eq!(names, vec!["glibc", "zlib", "cmake"]);
    }

    #[test]
    fn test_build_order_ignores_source_only_without_option() {
        let mut config = test_config();
        config.aur.update_package(Package::new("aur-only", "1-1"));

        let result =
            config.compute_build_order(&["aur-only".to_string()], BuildOrderOptions::default());
        assert_eq!(result.ignored, vec!["aur-only"]);
        assert!(result.order.is_empty());

        let result = config.compute_build_order(
            &["aur-only".to_string()],
            BuildOrderOptions {
                include_source_only_dependencies: true,
                ..Default::default()
            },
        );
        assert!(result.success);
        assert_eq!(result.order.len(), 1);
        assert_eq!(result.order[0].pkg.name, "aur-only");
    }

    #[test]
    fn test_build_order_considers_build_dependencies() {
        let mut config = test_config();
        {
            let extra = config.find_database_mut("extra", "x86_64").unwrap();
            let mut tool = Package::new("buildtool", "1-1");
            tool.source_info = Some(crate::packages::SourceInfo {
                make_dependencies: vec![Dependency::parse("cmake")],
                ..Default::default()
            });
            extra.update_package(tool);
        }

        // without the option the make dependency imposes no ordering
        let result = config.compute_build_order(
            &["buildtool".to_string(), "cmake".to_string()],
            BuildOrderOptions::default(),
        );
        assert!(result.success);

        let result = config.compute_build_order(
            &["buildtool".to_string(), "cmake".to_string()],
            BuildOrderOptions {
                consider_build_dependencies: true,
                ..Default::default()
            },
        );
        assert!(result.success);
        let names: Vec<&str> = result.order.iter().map(|entry| entry.pkg.name.as_str()).collect();
        let cmake_position = names.iter().position(|name| *name == "cmake").unwrap();
        let tool_position = names.iter().position(|name| *name == "buildtool").unwrap();
        assert!(cmake_position < tool_position, "order was {names:?}");
    }

    #[test]
    fn test_build_order_reports_cycles() {
        let mut config = Config::default();
        let db = db_with_packages(
            "cyclic",
            &[("a", "1-1", &["b"]), ("b", "1-1", &["a"])],
        );
        config.databases.push(db);

        let result = config.compute_build_order(
            &["a".to_string(), "b".to_string()],
            BuildOrderOptions::default(),
        );
        assert!(!result.success);
        assert!(!result.cycle.is_empty());
    }

    #[test]
    fn test_pull_dependent_packages() {
        let config = test_config();
        let cmake = config.databases[1].packages["cmake"].clone();
        let relevant: HashSet<usize> = [0usize, 1usize].into_iter().collect();
        let mut closure = HashSet::new();
        let mut missing = DependencySet::new();
        config.pull_dependent_packages(&cmake, &relevant, &mut closure, &mut missing);

        let names: BTreeSet<&str> = closure.iter().map(|(_, name)| name.as_str()).collect();
        assert_eq!(names, BTreeSet::from(["glibc", "zlib"]));
        assert!(missing.is_empty());
    }

    #[test]
    fn test_search_result_serializes_info_only() {
        let config = test_config();
        let results = config.find_packages(SearchMode::Name, "cmake");
        let json = serde_json::to_value(&results[0]).unwrap();
        assert_eq!(json["db"]["name"], "extra");
        assert_eq!(json["db"]["arch"], "x86_64");
        assert!(json.get("db_index").is_none());
    }
}
