// src/actions/reload_lib_deps.rs

//! Reload library dependencies by parsing binary packages
//!
//! Collects the relevant packages of the destination databases (plus their
//! database dependency closure), resolves each binary package on disk or
//! downloads it from the first configured mirror, parses the packages on all
//! available cores and merges the recovered library provides/depends back
//! into the in-memory databases and the storage cache.

use crate::actions::context::{
    ConfigAccess, DbRequirement, RequiredDatabases, RequiredParameters,
};
use crate::actions::{
    flags, ActionContext, BuildActionMessages, BuildActionResult, BuildActionResultData,
};
use crate::database::file_mtime;
use crate::download::{cache_packages, PackageCachingEntry};
use crate::packages::binary::ImportLibReferences;
use crate::packages::{pkginfo, walk_through_archive, Package, PackageInfo, PackageOrigin, SourceInfo};
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One package whose binary is to be parsed
#[derive(Debug)]
struct PackageToConsider {
    path: PathBuf,
    url: String,
    last_modified: Option<DateTime<Utc>>,
    /// Seed carrying the identity fields the merge-back checks
    info: Package,
}

/// The packages to consider per database
#[derive(Debug)]
struct DatabaseToConsider {
    name: String,
    arch: String,
    packages: Vec<PackageToConsider>,
}

pub async fn run(context: &ActionContext) {
    let (force, skip_dependencies) = context.snapshot(|action| {
        (
            action.has_flag(flags::RELOAD_LIB_DEPS_FORCE_RELOAD),
            action.has_flag(flags::RELOAD_LIB_DEPS_SKIP_DEPENDENCIES),
        )
    });
    let Some(init_data) = context.init(
        ConfigAccess::ReadConfig,
        RequiredDatabases {
            source: DbRequirement::None,
            destination: DbRequirement::Maybe,
        },
        RequiredParameters::None,
    ) else {
        return;
    };

    let cache_dir = {
        let building = context.setup.building.read().expect("building lock poisoned");
        building.package_cache_dir.clone()
    };

    context.log_info("Finding relevant databases/packages ...");
    let mut messages = BuildActionMessages::default();
    let mut skipping_note = String::new();
    let mut relevant_packages_by_db: Vec<DatabaseToConsider> = Vec::new();
    let mut remaining_packages = 0usize;
    {
        let config = context.setup.config.read().expect("config lock poisoned");

        // relevant databases: either all, or the destination databases plus
        // their database dependency closure
        let mut relevant_dbs: HashSet<usize> = HashSet::new();
        if init_data.destination_db_indices.is_empty() {
            relevant_dbs.extend(0..config.databases.len());
        } else {
            for &db_index in &init_data.destination_db_indices {
                if !relevant_dbs.insert(db_index) || skip_dependencies {
                    continue;
                }
                match config.compute_database_dependency_order(&config.databases[db_index]) {
                    Ok(order) => relevant_dbs.extend(order),
                    Err(error) => messages.errors.push(format!(
                        "{}: unable to consider dependencies: {error}",
                        config.databases[db_index].name
                    )),
                }
            }
        }

        // relevant packages: the dependency closure of the destination dbs
        let mut relevant_packages: HashSet<(usize, String)> = HashSet::new();
        let mut missing_dependencies = crate::packages::DependencySet::new();
        for &db_index in &init_data.destination_db_indices {
            for package in config.databases[db_index].packages.values() {
                config.pull_dependent_packages(
                    package,
                    &relevant_dbs,
                    &mut relevant_packages,
                    &mut missing_dependencies,
                );
            }
        }
        for (dependency_name, details) in missing_dependencies.iter() {
            let mut requiring: Vec<&str> = Vec::new();
            for detail in details {
                requiring.extend(detail.relevant_packages.iter().map(String::as_str));
            }
            messages.warnings.push(format!(
                "dependency {dependency_name} missing, required by {}",
                requiring.join(", ")
            ));
        }

        let mut sorted_dbs: Vec<usize> = relevant_dbs.iter().copied().collect();
        sorted_dbs.sort_unstable();
        for db_index in sorted_dbs {
            let db = &config.databases[db_index];
            let is_destination = init_data.destination_db_indices.is_empty()
                || init_data.destination_db_indices.contains(&db_index);
            let mut to_consider = DatabaseToConsider {
                name: db.name.clone(),
                arch: db.arch.clone(),
                packages: Vec::new(),
            };
            let mut package_names: Vec<&String> = db.packages.keys().collect();
            package_names.sort_unstable();
            for package_name in package_names {
                if context.is_aborted() {
                    context.report_aborted_if_aborted();
                    return;
                }
                let package = &db.packages[package_name];
                let Some(package_info) = &package.package_info else {
                    messages
                        .errors
                        .push(format!("{}/{package_name}: no package info", db.name));
                    continue;
                };
                // packages outside the destination dbs only matter when a
                // destination package depends on them
                if !is_destination
                    && !relevant_packages.contains(&(db_index, package_name.clone()))
                {
                    if !skipping_note.is_empty() {
                        skipping_note.push_str(", ");
                    }
                    skipping_note.push_str(&format!("{}/{package_name}", db.name));
                    continue;
                }

                // find the binary package on disk, falling back to a mirror
                let file_name = &package_info.file_name;
                let arch = &package_info.arch;
                let mut url = String::new();
                let mut path = PathBuf::new();
                if !db.local_pkg_dir.is_empty()
                    && Path::new(&db.local_pkg_dir).join(file_name).is_file()
                {
                    path = Path::new(&db.local_pkg_dir).join(file_name);
                } else if !cache_dir.is_empty()
                    && Path::new(&cache_dir).join(file_name).is_file()
                {
                    path = Path::new(&cache_dir).join(file_name);
                } else if !cache_dir.is_empty()
                    && Path::new(&cache_dir).join(arch).join(file_name).is_file()
                {
                    path = Path::new(&cache_dir).join(arch).join(file_name);
                } else {
                    for package_cache_dir in &config.package_cache_dirs {
                        let candidate = Path::new(package_cache_dir).join(file_name);
                        if candidate.is_file() {
                            path = candidate;
                            break;
                        }
                    }
                }
                if path.as_os_str().is_empty() {
                    if let Some(mirror) = db.mirrors.first() {
                        if let Some(local) = mirror.strip_prefix("file:") {
                            match std::fs::canonicalize(Path::new(local).join(file_name)) {
                                Ok(canonical) => path = canonical,
                                Err(_) => {}
                            }
                        } else {
                            let separator = if mirror.ends_with('/') { "" } else { "/" };
                            url = format!("{mirror}{separator}{file_name}");
                            path = Path::new(&cache_dir).join(file_name);
                        }
                    }
                }
                if path.as_os_str().is_empty() {
                    messages.errors.push(format!(
                        "{}/{package_name}: binary package not found and no mirror configured",
                        db.name
                    ));
                    continue;
                }

                // skip packages already analyzed from contents and unchanged
                let mut last_modified = None;
                if url.is_empty() {
                    last_modified = file_mtime(&path);
                    if !force
                        && package.origin == PackageOrigin::PackageContents
                        && package.timestamp >= last_modified
                    {
                        messages.notes.push(format!(
                            "{}/{package_name}: skipping because package is unchanged on disk",
                            db.name
                        ));
                        continue;
                    }
                }

                let mut seed = Package::new(&package.name, &package.version);
                seed.package_info = Some(PackageInfo {
                    build_date: package_info.build_date,
                    file_name: file_name.clone(),
                    arch: arch.clone(),
                    ..Default::default()
                });
                seed.source_info = Some(SourceInfo::default());
                to_consider.packages.push(PackageToConsider {
                    path,
                    url,
                    last_modified,
                    info: seed,
                });
                remaining_packages += 1;
            }
            if !to_consider.packages.is_empty() {
                relevant_packages_by_db.push(to_consider);
            }
        }
    }

    context.log_sub(format!("Found {remaining_packages}"));
    if !skipping_note.is_empty() {
        skipping_note.push_str(": not required by any destination DB, skipping download");
        messages.notes.push(skipping_note);
    }
    if remaining_packages == 0 {
        conclude(context, messages);
        return;
    }

    // download packages which are only available from a mirror
    let mut caching_entries = Vec::new();
    for (db_slot, db) in relevant_packages_by_db.iter().enumerate() {
        for (pkg_slot, package) in db.packages.iter().enumerate() {
            if !package.url.is_empty() {
                caching_entries.push((
                    (db_slot, pkg_slot),
                    PackageCachingEntry::new(
                        db.name.clone(),
                        package.info.name.clone(),
                        package.url.clone(),
                        package.path.clone(),
                    ),
                ));
            }
        }
    }
    if !caching_entries.is_empty() {
        if context.report_aborted_if_aborted() {
            return;
        }
        context.log_info(format!(
            "Downloading {} binary packages from mirror ...",
            caching_entries.len()
        ));
        let mut entries: Vec<PackageCachingEntry> =
            caching_entries.iter().map(|(_, entry)| entry.clone()).collect();
        cache_packages(&mut entries, &context.abort).await;
        for (((db_slot, pkg_slot), _), entry) in caching_entries.iter().zip(entries.iter()) {
            if let Some(error) = &entry.error {
                messages.errors.push(format!(
                    "{}/{}: {error}",
                    entry.db_name, entry.package_name
                ));
                // keep the parser from reading a missing or truncated file
                relevant_packages_by_db[*db_slot].packages[*pkg_slot].url = format!("failed: {error}");
            } else {
                relevant_packages_by_db[*db_slot].packages[*pkg_slot].url = String::new();
                relevant_packages_by_db[*db_slot].packages[*pkg_slot].last_modified =
                    file_mtime(&relevant_packages_by_db[*db_slot].packages[*pkg_slot].path);
            }
        }
    }

    if context.report_aborted_if_aborted() {
        return;
    }
    context.log_info(format!(
        "Parsing {remaining_packages} binary packages ..."
    ));

    // parse the binaries on all available cores
    let abort = context.abort.clone();
    let parse_input = std::mem::take(&mut relevant_packages_by_db);
    let (parsed, mut parse_messages) = tokio::task::spawn_blocking(move || {
        parse_packages_concurrently(parse_input, abort)
    })
    .await
    .unwrap_or_else(|e| {
        (
            Vec::new(),
            BuildActionMessages {
                errors: vec![format!("parser panicked: {e}")],
                ..Default::default()
            },
        )
    });
    messages.errors.append(&mut parse_messages.errors);
    messages.warnings.append(&mut parse_messages.warnings);
    messages.notes.append(&mut parse_messages.notes);

    if context.report_aborted_if_aborted() {
        return;
    }

    // merge the parsed information back into the current databases
    context.log_info("Adding parsed information to databases ...");
    let mut counter = 0usize;
    let mut persisted: Vec<(String, String, Package)> = Vec::new();
    {
        let mut config = context.setup.config.write().expect("config lock poisoned");
        for relevant_db in &parsed {
            let Some(db_index) = config.database_index(&relevant_db.name, &relevant_db.arch)
            else {
                continue; // the database has been removed meanwhile
            };
            for package in &relevant_db.packages {
                if package.info.origin != PackageOrigin::PackageContents {
                    continue; // could not be parsed
                }
                let db = &mut config.databases[db_index];
                let Some(mut existing) = db.packages.get(&package.info.name).cloned() else {
                    continue; // the package has been removed meanwhile
                };
                db.remove_package_dependencies(&existing);
                if !existing.add_deps_and_provides_from_other_package(&package.info) {
                    // no longer matches what is in the database
                    db.add_package_dependencies(&existing);
                    continue;
                }
                if existing.timestamp < package.last_modified {
                    existing.timestamp = package.last_modified;
                }
                db.add_package_dependencies(&existing);
                db.packages.insert(existing.name.clone(), existing.clone());
                persisted.push((relevant_db.name.clone(), relevant_db.arch.clone(), existing));
                counter += 1;
            }
        }
    }

    // write the merged packages through the storage cache
    if !context.setup.working_directory.as_os_str().is_empty() {
        if let Ok(env) = context.setup.storage() {
            for (db_name, db_arch, package) in persisted {
                let storage = env.database_storage(&format!("{db_name}@{db_arch}"));
                if let Err(e) = context.setup.package_cache.store(&storage, package, false) {
                    messages
                        .warnings
                        .push(format!("unable to persist package: {e}"));
                }
            }
        }
    }

    context.log_info(format!(
        "Added dependency information for {counter} packages"
    ));
    conclude(context, messages);
}

fn conclude(context: &ActionContext, messages: BuildActionMessages) {
    if context.report_aborted_if_aborted() {
        return;
    }
    let result = if messages.errors.is_empty() {
        BuildActionResult::Success
    } else {
        BuildActionResult::Failure
    };
    context.conclude(result, BuildActionResultData::Messages(messages));
}

/// Parse all queued packages using one worker thread per core
fn parse_packages_concurrently(
    mut input: Vec<DatabaseToConsider>,
    abort: crate::actions::AbortHandle,
) -> (Vec<DatabaseToConsider>, BuildActionMessages) {
    // flatten into jobs referencing slots so worker threads can pick the
    // next package under a shared mutex
    let mut jobs: Vec<(usize, usize)> = Vec::new();
    for (db_slot, db) in input.iter().enumerate() {
        for (pkg_slot, package) in db.packages.iter().enumerate() {
            if package.url.is_empty() {
                jobs.push((db_slot, pkg_slot));
            }
        }
    }

    let next_job = Mutex::new(0usize);
    let results: Mutex<Vec<(usize, usize, Package)>> = Mutex::new(Vec::new());
    let messages = Mutex::new(BuildActionMessages::default());
    let input_ref = &input;
    let jobs_ref = &jobs;

    let worker = |_worker_index: usize| {
        loop {
            if abort.is_aborted() {
                return;
            }
            let job_index = {
                let mut next = next_job.lock().expect("job mutex poisoned");
                let index = *next;
                *next += 1;
                index
            };
            let Some(&(db_slot, pkg_slot)) = jobs_ref.get(job_index) else {
                return;
            };
            let to_consider = &input_ref[db_slot].packages[pkg_slot];
            match parse_single_package(to_consider) {
                Ok((package, mut warnings)) => {
                    let mut results = results.lock().expect("result mutex poisoned");
                    results.push((db_slot, pkg_slot, package));
                    drop(results);
                    if !warnings.is_empty() {
                        let mut messages = messages.lock().expect("message mutex poisoned");
                        messages.warnings.append(&mut warnings);
                    }
                }
                Err(error) => {
                    let mut messages = messages.lock().expect("message mutex poisoned");
                    messages.errors.push(format!(
                        "{}/{}: {error}",
                        input_ref[db_slot].name, to_consider.info.name
                    ));
                }
            }
        }
    };

    let worker_count = std::thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(1)
        .max(1);
    std::thread::scope(|scope| {
        for worker_index in 1..worker_count {
            scope.spawn(move || worker(worker_index));
        }
        // the calling thread participates as well
        worker(0);
    });

    let results = results.into_inner().expect("result mutex poisoned");
    for (db_slot, pkg_slot, package) in results {
        input[db_slot].packages[pkg_slot].info = package;
    }
    (input, messages.into_inner().expect("message mutex poisoned"))
}

/// Parse one binary package archive into a fresh package instance
fn parse_single_package(
    to_consider: &PackageToConsider,
) -> crate::error::Result<(Package, Vec<String>)> {
    let package = RefCell::new(to_consider.info.clone());
    let dlls_referenced_by_import_libs = RefCell::new(ImportLibReferences::default());
    walk_through_archive(
        &to_consider.path,
        &Package::is_pkg_info_file_or_binary,
        |directory, file| {
            let mut package = package.borrow_mut();
            if directory.is_empty() && file.name == ".PKGINFO" {
                pkginfo::add_info_from_pkg_info_file(
                    &mut package,
                    &String::from_utf8_lossy(&file.content),
                );
                return;
            }
            package.add_deps_and_provides_from_contained_file(
                directory,
                &file,
                &mut dlls_referenced_by_import_libs.borrow_mut(),
            );
        },
        |directory| {
            if directory.is_empty() {
                return;
            }
            package
                .borrow_mut()
                .add_deps_and_provides_from_contained_directory(directory);
        },
    )?;
    let mut package = package.into_inner();
    let warnings = package.process_dlls_referenced_by_import_libs(
        dlls_referenced_by_import_libs.into_inner().into_keys(),
    );
    package.origin = PackageOrigin::PackageContents;
    Ok((package, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::engine::ActionManager;
    use crate::actions::{BuildAction, BuildActionType};
    use crate::database::Database;
    use crate::packages::archive::write_test_archive;
    use crate::setup::ServiceSetup;
    use std::sync::Arc;

    fn seeded_setup(local_pkg_dir: &Path) -> Arc<ServiceSetup> {
        let pkginfo = b"pkgname = cmake\npkgver = 3.8.2-1\narch = x86_64\ndepend = curl\n";
        write_test_archive(
            &local_pkg_dir.join("cmake-3.8.2-1-x86_64.pkg.tar.gz"),
            &["usr", "usr/bin"],
            &[(".PKGINFO", pkginfo.as_slice()), ("usr/bin/cmake", b"#!")],
        )
        .unwrap();

        let setup = ServiceSetup::default();
        {
            let mut config = setup.config.write().unwrap();
            let mut db = Database::new("bar", "bar.db");
            let mut package =
                Package::from_pkg_file_name("cmake-3.8.2-1-x86_64.pkg.tar.gz").unwrap();
            package.package_info.as_mut().unwrap().arch = "x86_64".to_string();
            db.local_pkg_dir = local_pkg_dir.to_string_lossy().into_owned();
            db.update_package(package);
            config.databases.push(db);
        }
        Arc::new(setup)
    }

    #[tokio::test]
    async fn test_reload_from_local_package_dir() {
        let dir = tempfile::tempdir().unwrap();
        let setup = seeded_setup(dir.path());

        let mut draft = BuildAction::default();
        draft.action_type = BuildActionType::ReloadLibraryDependencies;
        let action = ActionManager::create(&setup, draft);
        let context = ActionContext::new(Arc::clone(&setup), Arc::clone(&action));
        run(&context).await;

        let guard = action.read().unwrap();
        assert_eq!(guard.result, BuildActionResult::Success);
        let BuildActionResultData::Messages(messages) = &guard.result_data else {
            panic!("expected messages, got {:?}", guard.result_data);
        };
        assert_eq!(messages.errors, Vec::<String>::new());

        let config = setup.config.read().unwrap();
        let package = &config.databases[0].packages["cmake"];
        assert_eq!(package.origin, PackageOrigin::PackageContents);
        // contained directories are recorded as provides
        assert!(package.libprovides.contains(&"dir::usr".to_string()));
        assert!(package.libprovides.contains(&"dir::usr/bin".to_string()));
        assert!(package.timestamp.is_some());

        // the library index points back at the package
        let providers = config.find_packages_providing_library("dir::usr", false);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].pkg.name, "cmake");
    }

    #[tokio::test]
    async fn test_unchanged_packages_are_skipped_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let setup = seeded_setup(dir.path());

        for _ in 0..2 {
            let mut draft = BuildAction::default();
            draft.action_type = BuildActionType::ReloadLibraryDependencies;
            let action = ActionManager::create(&setup, draft);
            let context = ActionContext::new(Arc::clone(&setup), Arc::clone(&action));
            run(&context).await;
            assert_eq!(action.read().unwrap().result, BuildActionResult::Success);
        }

        // second run skipped the unchanged package
        let config = setup.config.read().unwrap();
        assert_eq!(
            config.databases[0].packages["cmake"].origin,
            PackageOrigin::PackageContents
        );
    }

    #[tokio::test]
    async fn test_reload_recovers_pe_dependencies_from_import_libs() {
        use goblin::pe::header::COFF_MACHINE_X86;

        // a mingw-style package whose import library references a DLL
        // provided by another package
        let dir = tempfile::tempdir().unwrap();
        let import_lib = crate::packages::binary::test_import_library(
            COFF_MACHINE_X86,
            &["libgcc_s_sjlj-1.dll"],
        );
        let pkginfo = b"pkgname = mingw-w64-harfbuzz\npkgver = 1.4.2-1\narch = any\n";
        write_test_archive(
            &dir.path().join("mingw-w64-harfbuzz-1.4.2-1-any.pkg.tar.gz"),
            &["usr", "usr/i686-w64-mingw32", "usr/i686-w64-mingw32/lib"],
            &[
                (".PKGINFO", pkginfo.as_slice()),
                (
                    "usr/i686-w64-mingw32/lib/libharfbuzz.dll.a",
                    import_lib.as_slice(),
                ),
            ],
        )
        .unwrap();

        let setup = ServiceSetup::default();
        {
            let mut config = setup.config.write().unwrap();
            let mut db = Database::new("foo", "foo.db");
            db.local_pkg_dir = dir.path().to_string_lossy().into_owned();
            db.update_package(
                Package::from_pkg_file_name("mingw-w64-harfbuzz-1.4.2-1-any.pkg.tar.gz").unwrap(),
            );
            config.databases.push(db);
        }
        let setup = Arc::new(setup);

        let mut draft = BuildAction::default();
        draft.action_type = BuildActionType::ReloadLibraryDependencies;
        let action = ActionManager::create(&setup, draft);
        let context = ActionContext::new(Arc::clone(&setup), Arc::clone(&action));
        run(&context).await;

        let guard = action.read().unwrap();
        assert_eq!(
            guard.result,
            BuildActionResult::Success,
            "{:?}",
            guard.result_data
        );

        // the referenced DLL is recorded under its fully-qualified key
        let config = setup.config.read().unwrap();
        let package = &config.databases[0].packages["mingw-w64-harfbuzz"];
        assert!(
            package
                .libdepends
                .contains(&"pe-i386::libgcc_s_sjlj-1.dll".to_string()),
            "libdepends: {:?}",
            package.libdepends
        );

        // the reverse library index resolves the exact key to the package
        let requiring =
            config.find_packages_providing_library("pe-i386::libgcc_s_sjlj-1.dll", true);
        assert_eq!(requiring.len(), 1);
        assert_eq!(requiring[0].pkg.name, "mingw-w64-harfbuzz");
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let setup = ServiceSetup::default();
        {
            let mut config = setup.config.write().unwrap();
            let mut db = Database::new("foo", "foo.db");
            db.update_package(
                Package::from_pkg_file_name("ghost-1-1-x86_64.pkg.tar.zst").unwrap(),
            );
            config.databases.push(db);
        }
        let setup = Arc::new(setup);

        let mut draft = BuildAction::default();
        draft.action_type = BuildActionType::ReloadLibraryDependencies;
        let action = ActionManager::create(&setup, draft);
        let context = ActionContext::new(Arc::clone(&setup), Arc::clone(&action));
        run(&context).await;

        let guard = action.read().unwrap();
        assert_eq!(guard.result, BuildActionResult::Failure);
        let BuildActionResultData::Messages(messages) = &guard.result_data else {
            panic!("expected messages");
        };
        assert_eq!(messages.errors.len(), 1);
        assert!(messages.errors[0].contains("binary package not found"));
    }
}
