// src/actions/prepare_build.rs

//! Build-plan construction
//!
//! Locates the PKGBUILD of every requested package, pulls in packages whose
//! dependencies no configured database provides, partitions the build set
//! into batches by longest-path layering and materializes the plan as
//! `build-preparation.json` plus an initial `build-progress.json` in the
//! action's working directory.

use crate::actions::context::{
    ConfigAccess, DbRequirement, RequiredDatabases, RequiredParameters,
};
use crate::actions::{
    flags, settings, ActionContext, BuildActionResult, BuildActionResultData, BuildPreparation,
    BuildProgress, DbConfigSnapshot, PackageBuildData, PackageBuildProgress,
};
use crate::packages::pkgbuild::PkgbuildInfo;
use crate::packages::Dependency;
use crate::version::pkg_vercmp;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A package located for building
struct SourcePackage {
    info: PkgbuildInfo,
    pkgbuild_path: PathBuf,
    /// pkgrel after a potential version bump
    effective_pkgrel: String,
}

pub async fn run(context: &ActionContext) {
    let (clean_src_dir, keep_order, keep_pkgrel_and_epoch, force_bump_pkgrel) =
        context.snapshot(|action| {
            (
                action.has_flag(flags::PREPARE_BUILD_CLEAN_SRC_DIR),
                action.has_flag(flags::PREPARE_BUILD_KEEP_ORDER),
                action.has_flag(flags::PREPARE_BUILD_KEEP_PKGREL_AND_EPOCH),
                action.has_flag(flags::PREPARE_BUILD_FORCE_BUMP_PKGREL),
            )
        });
    let Some(init_data) = context.init(
        ConfigAccess::ReadConfig,
        RequiredDatabases {
            source: DbRequirement::Maybe,
            destination: DbRequirement::One,
        },
        RequiredParameters::Packages,
    ) else {
        return;
    };

    // PKGBUILD search path: user-supplied directories first
    let pkgbuilds_dirs: Vec<PathBuf> = {
        let user_dirs = context
            .snapshot(|action| action.setting(settings::PKGBUILDS_DIRS).map(str::to_string))
            .unwrap_or_default();
        let building = context.setup.building.read().expect("building lock poisoned");
        user_dirs
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .chain(std::iter::once(
                building.working_directory.join("pkgbuilds"),
            ))
            .collect()
    };

    let mut preparation = BuildPreparation::default();
    let package_names = context.snapshot(|action| action.package_names.clone());

    // snapshot the destination database configuration
    let existing_versions: HashMap<String, String>;
    {
        let config = context.setup.config.read().expect("config lock poisoned");
        let destination_db = &config.databases[init_data.destination_db_indices[0]];
        preparation.target_db = destination_db.name.clone();
        preparation.target_arch = destination_db.arch.clone();
        preparation.staging_db = format!("{}-staging", destination_db.name);

        let snapshot = |index: usize| {
            let db = &config.databases[index];
            DbConfigSnapshot {
                name: db.name.clone(),
                arch: db.arch.clone(),
                local_pkg_dir: db.local_pkg_dir.clone(),
                database_file: Path::new(&db.path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            }
        };
        match config.compute_database_dependency_order(destination_db) {
            Ok(order) => preparation.db_config = order.into_iter().map(snapshot).collect(),
            Err(error) => {
                context.report_error(format!(
                    "unable to determine database configuration: {error}"
                ));
                return;
            }
        }
        if let Some(staging_db) =
            config.find_database(&preparation.staging_db, &preparation.target_arch)
        {
            match config.compute_database_dependency_order(staging_db) {
                Ok(order) => {
                    preparation.staging_db_config = order.into_iter().map(snapshot).collect()
                }
                Err(error) => preparation.warnings.push(format!(
                    "unable to determine staging database configuration: {error}"
                )),
            }
        }

        existing_versions = destination_db
            .packages
            .values()
            .map(|package| (package.name.clone(), package.version.clone()))
            .collect();
    }

    // locate and parse the PKGBUILD of every requested package; fail the
    // action when a requested package cannot be found
    let mut builds: BTreeMap<String, SourcePackage> = BTreeMap::new();
    let mut provided_names: HashSet<String> = HashSet::new();
    let mut queue: Vec<(String, bool)> = package_names
        .iter()
        .map(|name| (name.clone(), true))
        .collect();
    while let Some((package_name, requested)) = queue.pop() {
        if context.report_aborted_if_aborted() {
            return;
        }
        if provided_names.contains(&package_name) {
            continue;
        }
        let Some(pkgbuild_path) = locate_pkgbuild(&pkgbuilds_dirs, &package_name) else {
            if requested {
                context.report_error(format!(
                    "unable to find PKGBUILD for package \"{package_name}\""
                ));
                return;
            }
            preparation.warnings.push(format!(
                "unable to find PKGBUILD for dependency \"{package_name}\"; assuming it is provided elsewhere"
            ));
            continue;
        };
        let info = match PkgbuildInfo::from_file(&pkgbuild_path) {
            Ok(info) => info,
            Err(e) => {
                context.report_error(format!(
                    "unable to parse PKGBUILD for package \"{package_name}\": {e}"
                ));
                return;
            }
        };
        provided_names.extend(info.pkgnames.iter().cloned());
        provided_names.extend(info.provides.iter().map(|provide| provide.name.clone()));
        provided_names.insert(info.pkgbase.clone());

        // dependencies no database provides are pulled into the build
        let mut unresolved = Vec::new();
        {
            let config = context.setup.config.read().expect("config lock poisoned");
            let mut edges: Vec<&Dependency> = info.depends.iter().collect();
            edges.extend(info.makedepends.iter());
            edges.extend(info.checkdepends.iter());
            for dependency in edges {
                if provided_names.contains(&dependency.name) {
                    continue;
                }
                let mut provided = false;
                for db_snapshot in &preparation.db_config {
                    if let Some(db) =
                        config.find_database(&db_snapshot.name, &db_snapshot.arch)
                    {
                        if db.provides_dependency(dependency) {
                            provided = true;
                            break;
                        }
                    }
                }
                if !provided {
                    unresolved.push(dependency.name.clone());
                }
            }
        }
        for dependency_name in unresolved {
            queue.push((dependency_name, false));
        }

        let effective_pkgrel = info.pkgrel.clone();
        builds.insert(
            info.pkgbase.clone(),
            SourcePackage {
                info,
                pkgbuild_path,
                effective_pkgrel,
            },
        );
    }

    // bump pkgrel where the destination database already has the version
    if !keep_pkgrel_and_epoch {
        for build in builds.values_mut() {
            let existing = build
                .info
                .pkgnames
                .iter()
                .find_map(|name| existing_versions.get(name));
            match existing {
                Some(existing_version) => {
                    match pkg_vercmp(&build.info.version(), existing_version) {
                        Ordering::Greater => {}
                        _ => {
                            let Some(bumped) = bumped_pkgrel(existing_version) else {
                                context.report_error(format!(
                                    "unable to bump pkgrel of \"{}\": existing version \"{existing_version}\" has no pkgrel",
                                    build.info.pkgbase
                                ));
                                return;
                            };
                            build.effective_pkgrel = bumped;
                        }
                    }
                }
                None if force_bump_pkgrel => {
                    build.effective_pkgrel = bump_pkgrel_string(&build.info.pkgrel);
                }
                None => {}
            }
        }
    }

    // partition into batches by longest-path layering
    let edges = build_edges(&builds);
    if keep_order {
        preparation.manually_ordered = true;
        let mut batches: Vec<Vec<String>> = Vec::new();
        for package_name in &package_names {
            if let Some(build) = builds
                .values()
                .find(|build| build.info.produces(package_name) || &build.info.pkgbase == package_name)
            {
                if !batches
                    .iter()
                    .any(|batch: &Vec<String>| batch.contains(&build.info.pkgbase))
                {
                    batches.push(vec![build.info.pkgbase.clone()]);
                }
            }
        }
        // pulled-in dependencies are built first
        let mut pulled: Vec<String> = builds
            .keys()
            .filter(|pkgbase| !batches.iter().any(|batch| batch.contains(*pkgbase)))
            .cloned()
            .collect();
        pulled.sort();
        for pkgbase in pulled.into_iter().rev() {
            batches.insert(0, vec![pkgbase]);
        }
        preparation.batches = batches;
    } else {
        let (batches, cyclic_leftovers) = layer_batches(&builds, &edges);
        preparation.batches = batches;
        preparation.cyclic_leftovers = cyclic_leftovers;
    }

    // materialize the working directory: per-package src dirs with the
    // (possibly pkgrel-bumped) PKGBUILD plus the plan JSON files
    let working_directory = context.working_directory();
    if let Err(e) = std::fs::create_dir_all(&working_directory) {
        context.report_error(format!(
            "unable to create working directory \"{}\": {e}",
            working_directory.display()
        ));
        return;
    }
    for (pkgbase, build) in &builds {
        let package_dir = working_directory.join(pkgbase);
        let src_dir = package_dir.join("src");
        if clean_src_dir && src_dir.is_dir() {
            if let Err(e) = std::fs::remove_dir_all(&src_dir) {
                context.report_error(format!(
                    "unable to clean source directory \"{}\": {e}",
                    src_dir.display()
                ));
                return;
            }
        }
        if let Err(e) = std::fs::create_dir_all(&src_dir) {
            context.report_error(format!(
                "unable to create source directory \"{}\": {e}",
                src_dir.display()
            ));
            return;
        }
        let content = match std::fs::read_to_string(&build.pkgbuild_path) {
            Ok(content) => content,
            Err(e) => {
                context.report_error(format!(
                    "unable to read PKGBUILD of \"{pkgbase}\": {e}"
                ));
                return;
            }
        };
        let content = if build.effective_pkgrel != build.info.pkgrel {
            rewrite_pkgrel(&content, &build.effective_pkgrel)
        } else {
            content
        };
        if let Err(e) = std::fs::write(src_dir.join("PKGBUILD"), content) {
            context.report_error(format!(
                "unable to write PKGBUILD of \"{pkgbase}\": {e}"
            ));
            return;
        }

        let mut info = build.info.clone();
        info.pkgrel = build.effective_pkgrel.clone();
        preparation.packages.insert(
            pkgbase.clone(),
            PackageBuildData {
                pkgbase: pkgbase.clone(),
                version: info.version(),
                subpackages: info.pkgnames.clone(),
                source_directory: build
                    .pkgbuild_path
                    .parent()
                    .map(|parent| parent.display().to_string())
                    .unwrap_or_default(),
                arch: preferred_arch(&info, &preparation.target_arch),
                dependencies: edges.get(pkgbase).cloned().unwrap_or_default(),
            },
        );
    }

    // initial progress: every package pending
    let mut progress = BuildProgress::default();
    for pkgbase in builds.keys() {
        progress
            .progress_by_package
            .insert(pkgbase.clone(), PackageBuildProgress::default());
    }

    if let Err(e) = write_json(&working_directory.join("build-preparation.json"), &preparation)
        .and_then(|_| write_json(&working_directory.join("build-progress.json"), &progress))
    {
        context.report_error(format!("unable to write build plan: {e}"));
        return;
    }

    context.log_info(format!(
        "Prepared build of {} packages in {} batches",
        preparation.packages.len(),
        preparation.batches.len()
    ));
    context.conclude(
        BuildActionResult::Success,
        BuildActionResultData::BuildPreparation(preparation),
    );
}

/// Search the PKGBUILD of a package: `<dir>/<name>/PKGBUILD` first, then
/// `<dir>/<name>/trunk/PKGBUILD`
fn locate_pkgbuild(directories: &[PathBuf], package_name: &str) -> Option<PathBuf> {
    for directory in directories {
        for candidate in [
            directory.join(package_name).join("PKGBUILD"),
            directory.join(package_name).join("trunk/PKGBUILD"),
        ] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Edges between build-set members: `pkgbase → pkgbase` for every runtime,
/// make and check dependency produced by another member
fn build_edges(builds: &BTreeMap<String, SourcePackage>) -> HashMap<String, Vec<String>> {
    let producer_of: HashMap<&str, &str> = builds
        .values()
        .flat_map(|build| {
            build
                .info
                .pkgnames
                .iter()
                .map(move |name| (name.as_str(), build.info.pkgbase.as_str()))
                .chain(
                    build
                        .info
                        .provides
                        .iter()
                        .map(move |provide| (provide.name.as_str(), build.info.pkgbase.as_str())),
                )
        })
        .collect();

    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for (pkgbase, build) in builds {
        let mut dependencies: Vec<&Dependency> = build.info.depends.iter().collect();
        dependencies.extend(build.info.makedepends.iter());
        dependencies.extend(build.info.checkdepends.iter());
        let entry = edges.entry(pkgbase.clone()).or_default();
        for dependency in dependencies {
            if let Some(&producer) = producer_of.get(dependency.name.as_str()) {
                if producer != pkgbase && !entry.iter().any(|existing| existing == producer) {
                    entry.push(producer.to_string());
                }
            }
        }
    }
    edges
}

/// Longest-path layering: batch 0 has no edges within the set, batch k+1
/// only depends on batches <= k
fn layer_batches(
    builds: &BTreeMap<String, SourcePackage>,
    edges: &HashMap<String, Vec<String>>,
) -> (Vec<Vec<String>>, Vec<String>) {
    let mut levels: HashMap<String, usize> = HashMap::new();

    fn level_of(
        pkgbase: &str,
        edges: &HashMap<String, Vec<String>>,
        levels: &mut HashMap<String, usize>,
        on_stack: &mut HashSet<String>,
    ) -> Option<usize> {
        if let Some(&level) = levels.get(pkgbase) {
            return Some(level);
        }
        if !on_stack.insert(pkgbase.to_string()) {
            return None; // cycle
        }
        let mut level = 0usize;
        if let Some(dependencies) = edges.get(pkgbase) {
            for dependency in dependencies {
                match level_of(dependency, edges, levels, on_stack) {
                    Some(dep_level) => level = level.max(dep_level + 1),
                    None => {
                        on_stack.remove(pkgbase);
                        return None;
                    }
                }
            }
        }
        on_stack.remove(pkgbase);
        levels.insert(pkgbase.to_string(), level);
        Some(level)
    }

    let mut cyclic_leftovers = Vec::new();
    for pkgbase in builds.keys() {
        let mut on_stack = HashSet::new();
        if level_of(pkgbase, edges, &mut levels, &mut on_stack).is_none() {
            cyclic_leftovers.push(pkgbase.clone());
        }
    }

    let batch_count = levels.values().map(|&level| level + 1).max().unwrap_or(0);
    let mut batches = vec![Vec::new(); batch_count];
    for (pkgbase, &level) in &levels {
        batches[level].push(pkgbase.clone());
    }
    for batch in &mut batches {
        batch.sort();
    }
    batches.retain(|batch| !batch.is_empty());
    cyclic_leftovers.sort();
    (batches, cyclic_leftovers)
}

/// pkgrel of `existing_version` plus one
fn bumped_pkgrel(existing_version: &str) -> Option<String> {
    let (_, pkgrel) = existing_version.rsplit_once('-')?;
    Some(bump_pkgrel_string(pkgrel))
}

fn bump_pkgrel_string(pkgrel: &str) -> String {
    match pkgrel.parse::<u64>() {
        Ok(value) => (value + 1).to_string(),
        // sub-releases like "2.1" bump the integer part
        Err(_) => match pkgrel.split_once('.') {
            Some((major, _)) => match major.parse::<u64>() {
                Ok(value) => (value + 1).to_string(),
                Err(_) => "1".to_string(),
            },
            None => "1".to_string(),
        },
    }
}

/// Replace the `pkgrel=` assignment in PKGBUILD content
fn rewrite_pkgrel(content: &str, new_pkgrel: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for line in content.lines() {
        if !replaced && line.trim_start().starts_with("pkgrel=") {
            lines.push(format!("pkgrel={new_pkgrel}"));
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(format!("pkgrel={new_pkgrel}"));
    }
    let mut result = lines.join("\n");
    result.push('\n');
    result
}

/// The architecture the package will be built for
fn preferred_arch(info: &PkgbuildInfo, target_arch: &str) -> String {
    if info.archs.iter().any(|arch| arch == "any") {
        "any".to_string()
    } else {
        target_arch.to_string()
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> crate::error::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)
        .map_err(|e| crate::error::Error::Io(format!("unable to write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_package(pkgbuild: &str) -> SourcePackage {
        let info = PkgbuildInfo::parse(pkgbuild).unwrap();
        let effective_pkgrel = info.pkgrel.clone();
        SourcePackage {
            info,
            pkgbuild_path: PathBuf::new(),
            effective_pkgrel,
        }
    }

    #[test]
    fn test_layering_puts_dependencies_first() {
        let mut builds = BTreeMap::new();
        builds.insert(
            "boost".to_string(),
            source_package(
                "pkgname=boost\npkgver=1.73.0\npkgrel=1\ndepends=('zstd')\nmakedepends=('mingw-w64-gcc')\n",
            ),
        );
        builds.insert(
            "zstd".to_string(),
            source_package("pkgname=zstd\npkgver=1.4.5\npkgrel=1\n"),
        );
        builds.insert(
            "mingw-w64-gcc".to_string(),
            source_package("pkgname=mingw-w64-gcc\npkgver=10.2.0\npkgrel=1\n"),
        );

        let edges = build_edges(&builds);
        let (batches, cyclic) = layer_batches(&builds, &edges);
        assert!(cyclic.is_empty());
        assert_eq!(
            batches,
            vec![
                vec!["mingw-w64-gcc".to_string(), "zstd".to_string()],
                vec!["boost".to_string()],
            ]
        );
    }

    #[test]
    fn test_layering_reports_cycles() {
        let mut builds = BTreeMap::new();
        builds.insert(
            "a".to_string(),
            source_package("pkgname=a\npkgver=1\npkgrel=1\ndepends=('b')\n"),
        );
        builds.insert(
            "b".to_string(),
            source_package("pkgname=b\npkgver=1\npkgrel=1\ndepends=('a')\n"),
        );
        let edges = build_edges(&builds);
        let (batches, cyclic) = layer_batches(&builds, &edges);
        assert!(batches.is_empty());
        assert_eq!(cyclic, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_split_package_edges_use_pkgbase() {
        let mut builds = BTreeMap::new();
        builds.insert(
            "boost".to_string(),
            source_package(
                "pkgbase=boost\npkgname=('boost' 'boost-libs')\npkgver=1.73.0\npkgrel=1\n",
            ),
        );
        builds.insert(
            "source-highlight".to_string(),
            source_package(
                "pkgname=source-highlight\npkgver=3.1.9\npkgrel=1\ndepends=('boost-libs')\n",
            ),
        );
        let edges = build_edges(&builds);
        assert_eq!(edges["source-highlight"], vec!["boost".to_string()]);
    }

    #[test]
    fn test_bump_pkgrel() {
        assert_eq!(bumped_pkgrel("1.73.0-1"), Some("2".to_string()));
        assert_eq!(bumped_pkgrel("1.73.0-10"), Some("11".to_string()));
        assert_eq!(bumped_pkgrel("1.73.0-2.1"), Some("3".to_string()));
        assert_eq!(bumped_pkgrel("nodash"), None);
        assert_eq!(bump_pkgrel_string("4"), "5");
    }

    #[test]
    fn test_rewrite_pkgrel() {
        let content = "pkgname=zstd\npkgver=1.4.5\npkgrel=1\n";
        let rewritten = rewrite_pkgrel(content, "2");
        assert!(rewritten.contains("pkgrel=2\n"));
        assert!(!rewritten.contains("pkgrel=1"));
    }
}
