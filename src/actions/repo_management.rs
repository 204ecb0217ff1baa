// src/actions/repo_management.rs

//! Repository mutation actions
//!
//! RemovePackages and MovePackages drive `repo-remove`/`repo-add` under the
//! repository directories and reconcile the package files afterwards;
//! CleanRepository archives files no database references anymore;
//! CheckForProblems and CheckForUpdates are read-only diagnostics.

use crate::actions::context::{
    ConfigAccess, DbRequirement, RequiredDatabases, RequiredParameters,
};
use crate::actions::process::BuildProcessSession;
use crate::actions::{
    flags, ActionContext, BuildActionMessages, BuildActionResult, BuildActionResultData,
    BuildActionType, PackageMovementResult, RepositoryProblem,
};
use crate::database::PackageLocation;
use crate::error::Error;
use crate::packages::{DependencySet, Package};
use crate::setup::find_executable;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Everything a movement action needs after validation
struct RepoActionPreparation {
    destination_repo_dir: PathBuf,
    destination_db_file: String,
    source_repo_dir: PathBuf,
    source_db_file: String,
    /// (package name, location, still ok)
    package_locations: Vec<(String, PackageLocation, bool)>,
    repo_add: PathBuf,
    repo_remove: PathBuf,
    working_directory: PathBuf,
    result: PackageMovementResult,
}

fn conclude_with_movement_result(
    context: &ActionContext,
    result: PackageMovementResult,
    outcome: BuildActionResult,
) {
    context.conclude(outcome, BuildActionResultData::Movement(result));
}

/// Validate inputs, locate executables and the specified packages
fn prepare_repo_action(context: &ActionContext, needs_source: bool) -> Option<RepoActionPreparation> {
    let init_data = context.init(
        ConfigAccess::ReadConfig,
        RequiredDatabases {
            source: if needs_source {
                DbRequirement::One
            } else {
                DbRequirement::None
            },
            destination: DbRequirement::One,
        },
        RequiredParameters::Packages,
    )?;

    let (repo_remove_name, repo_add_name) = {
        let building = context.setup.building.read().expect("building lock poisoned");
        (building.tools.repo_remove.clone(), building.tools.repo_add.clone())
    };
    let Some(repo_remove) = find_executable(&repo_remove_name) else {
        context.report_error(format!(
            "Unable to find repo-remove executable \"{repo_remove_name}\" in PATH."
        ));
        return None;
    };
    let repo_add = match find_executable(&repo_add_name) {
        Some(path) => path,
        None if needs_source => {
            context.report_error(format!(
                "Unable to find repo-add executable \"{repo_add_name}\" in PATH."
            ));
            return None;
        }
        None => PathBuf::new(),
    };

    let mut result = PackageMovementResult::default();
    let mut package_locations = Vec::new();
    let (destination_repo_dir, destination_db_file, source_repo_dir, source_db_file);
    {
        let config = context.setup.config.read().expect("config lock poisoned");
        let destination_db = &config.databases[init_data.destination_db_indices[0]];
        destination_repo_dir = PathBuf::from(&destination_db.local_pkg_dir);
        destination_db_file = db_file_name(&destination_db.path);
        let lookup_db = if needs_source {
            let source_db = &config.databases[init_data.source_db_indices[0]];
            source_repo_dir = PathBuf::from(&source_db.local_pkg_dir);
            source_db_file = db_file_name(&source_db.path);
            source_db
        } else {
            source_repo_dir = PathBuf::new();
            source_db_file = String::new();
            destination_db
        };

        let package_names = context.snapshot(|action| action.package_names.clone());
        for package_name in package_names {
            let Some(package) = lookup_db.packages.get(&package_name) else {
                result
                    .failed_packages
                    .push((package_name, "package not listed in database file".to_string()));
                continue;
            };
            let location = lookup_db.locate_package(&package.compute_file_name());
            if let Some(error) = &location.error {
                result.failed_packages.push((
                    package_name,
                    format!("unable to locate package within repo directory: {error}"),
                ));
                continue;
            }
            if !location.exists {
                result.failed_packages.push((
                    package_name,
                    "package not present within repo directory".to_string(),
                ));
                continue;
            }
            package_locations.push((package_name, location, true));
        }
    }

    if package_locations.is_empty() {
        result.error_message = "none of the specified packages could be located".to_string();
        conclude_with_movement_result(context, result, BuildActionResult::Failure);
        return None;
    }

    // default the working directory from the action type and database
    let directory = context.with_action_mut(|action| {
        if action.directory.is_empty() {
            let prefix = if action.action_type == BuildActionType::MovePackages {
                "repo-move"
            } else {
                "repo-remove"
            };
            let stem = destination_db_file
                .strip_suffix(".db.tar.zst")
                .or_else(|| destination_db_file.strip_suffix(".db"))
                .unwrap_or(&destination_db_file);
            action.directory = format!(
                "{prefix}-{}-{stem}",
                Utc::now().format("%Y-%m-%d-%H-%M-%S")
            );
        }
        action.directory.clone()
    });
    let working_directory = {
        let building = context.setup.building.read().expect("building lock poisoned");
        building.build_data_dir().join(directory)
    };
    if let Err(e) = std::fs::create_dir_all(&working_directory) {
        context.log_error(format!("Unable to make working directory: {e}"));
        result.error_message = format!("unable to make working directory: {e}");
        conclude_with_movement_result(context, result, BuildActionResult::Failure);
        return None;
    }

    Some(RepoActionPreparation {
        destination_repo_dir,
        destination_db_file,
        source_repo_dir,
        source_db_file,
        package_locations,
        repo_add,
        repo_remove,
        working_directory,
        result,
    })
}

/// The database file to pass to repo-add/repo-remove (its base name)
fn db_file_name(db_path: &str) -> String {
    Path::new(db_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Remove packages from a repository and archive their files
pub async fn run_remove_packages(context: &ActionContext) {
    let Some(mut prep) = prepare_repo_action(context, false) else {
        return;
    };

    prep.result.processed_packages = prep
        .package_locations
        .iter()
        .map(|(name, _, _)| name.clone())
        .collect();

    context.with_action_mut(|action| action.register_log_file("repo-remove"));
    context.log_info(format!(
        "Invoking repo-remove within \"{}\" for \"{}\", see logfile for details",
        prep.destination_repo_dir.display(),
        prep.destination_db_file
    ));
    let mut args = vec![prep.destination_db_file.clone()];
    args.extend(prep.result.processed_packages.iter().cloned());
    let session = BuildProcessSession::new(
        "repo-remove",
        prep.working_directory.join("repo-remove.log"),
        context.abort.clone(),
    )
    .with_working_dir(&prep.destination_repo_dir);
    let outcome = match session
        .run(&prep.repo_remove.to_string_lossy(), &args, None)
        .await
    {
        Err(Error::Aborted) => {
            context.report_aborted_if_aborted();
            return;
        }
        Err(e) => {
            prep.result.error_message = format!("unable to remove packages: {e}");
            None
        }
        Ok(result) if !result.error.is_empty() => {
            context.log_error(format!("Unable to invoke repo-remove: {}", result.error));
            prep.result.error_message = format!("unable to remove packages: {}", result.error);
            None
        }
        Ok(result) if result.exit_code != Some(0) => {
            let exit_code = result.exit_code.unwrap_or(-1);
            context.log_error(format!(
                "repo-remove invocation exited with non-zero exit code: {exit_code}"
            ));
            prep.result.error_message =
                format!("unable to remove package: repo-remove returned with exit code {exit_code}");
            None
        }
        Ok(result) => Some(result),
    };
    if outcome.is_none() {
        let failed: Vec<String> = std::mem::take(&mut prep.result.processed_packages);
        for package in failed {
            prep.result
                .failed_packages
                .push((package, "repo-remove error".to_string()));
        }
        conclude_with_movement_result(context, prep.result, BuildActionResult::Failure);
        return;
    }

    // move the removed files (and their storage targets) aside
    context.log_info("Moving packages to archive directory");
    for (package_name, location, _) in &prep.package_locations {
        if let Err(e) = archive_file(&location.path_within_repo)
            .and_then(|_| match location.storage_location.as_os_str().is_empty() {
                true => Ok(()),
                false => archive_file(&location.storage_location),
            })
        {
            prep.result
                .processed_packages
                .retain(|name| name != package_name);
            prep.result
                .failed_packages
                .push((package_name.clone(), format!("unable to archive: {e}")));
        }
    }

    if prep.result.failed_packages.is_empty() {
        conclude_with_movement_result(context, prep.result, BuildActionResult::Success);
        return;
    }
    prep.result.error_message = format!(
        "failed to remove {} packages",
        prep.result.failed_packages.len()
    );
    conclude_with_movement_result(context, prep.result, BuildActionResult::Failure);
}

/// Move a file into an `archive/` directory next to it
fn archive_file(path: &Path) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let archive_dir = parent.join("archive");
    std::fs::create_dir_all(&archive_dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
    std::fs::rename(path, archive_dir.join(file_name))
}

/// Move packages from a source repository to a destination repository
pub async fn run_move_packages(context: &ActionContext) {
    let Some(mut prep) = prepare_repo_action(context, true) else {
        return;
    };

    // copy packages (and their storage-location targets) to the destination
    let mut file_names: Vec<String> = Vec::new();
    for (package_name, location, ok) in &mut prep.package_locations {
        let file_name = location
            .path_within_repo
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let copy_result = (|| -> std::result::Result<(), String> {
            if location.storage_location.as_os_str().is_empty() {
                std::fs::copy(
                    &location.path_within_repo,
                    prep.destination_repo_dir.join(&file_name),
                )
                .map_err(|e| e.to_string())?;
                return Ok(());
            }
            let symlink_target = std::fs::read_link(&location.path_within_repo)
                .map_err(|e| e.to_string())?;
            if symlink_target.is_absolute() {
                return Err(format!(
                    "\"{}\" is a symlink with absolute target path (only relative target paths supported)",
                    location.path_within_repo.display()
                ));
            }
            let new_storage_location = prep.destination_repo_dir.join(&symlink_target);
            if let Some(parent) = new_storage_location.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            std::os::unix::fs::symlink(
                &symlink_target,
                prep.destination_repo_dir.join(&file_name),
            )
            .map_err(|e| e.to_string())?;
            std::fs::copy(&location.storage_location, &new_storage_location)
                .map_err(|e| e.to_string())?;
            Ok(())
        })();
        match copy_result {
            Ok(()) => {
                file_names.push(file_name);
                prep.result.processed_packages.push(package_name.clone());
            }
            Err(e) => {
                *ok = false;
                prep.result.failed_packages.push((
                    package_name.clone(),
                    format!("unable to copy to destination repo: {e}"),
                ));
            }
        }
    }

    if file_names.is_empty() {
        prep.result.error_message =
            "none of the specified packages could be copied to the destination repo".to_string();
        conclude_with_movement_result(context, prep.result, BuildActionResult::Failure);
        return;
    }

    context.with_action_mut(|action| {
        action.register_log_file("repo-add");
        action.register_log_file("repo-remove");
    });
    context.log_info(format!(
        "Invoking repo-add within \"{}\" for \"{}\" and repo-remove within \"{}\" for \"{}\", see logfiles for details",
        prep.destination_repo_dir.display(),
        prep.destination_db_file,
        prep.source_repo_dir.display(),
        prep.source_db_file
    ));

    // run repo-add at the destination and repo-remove at the source
    // concurrently; the action concludes once both have been handled
    let mut add_args = vec![prep.destination_db_file.clone()];
    add_args.extend(file_names.iter().cloned());
    let add_session = BuildProcessSession::new(
        "repo-add",
        prep.working_directory.join("repo-add.log"),
        context.abort.clone(),
    )
    .with_working_dir(&prep.destination_repo_dir);

    let mut remove_args = vec![prep.source_db_file.clone()];
    remove_args.extend(prep.result.processed_packages.iter().cloned());
    let remove_session = BuildProcessSession::new(
        "repo-remove",
        prep.working_directory.join("repo-remove.log"),
        context.abort.clone(),
    )
    .with_working_dir(&prep.source_repo_dir);

    let repo_add_program = prep.repo_add.to_string_lossy();
    let repo_remove_program = prep.repo_remove.to_string_lossy();
    let (add_result, remove_result) = tokio::join!(
        add_session.run(&repo_add_program, &add_args, None),
        remove_session.run(&repo_remove_program, &remove_args, None),
    );
    if context.report_aborted_if_aborted() {
        return;
    }

    let mut add_error_message = String::new();
    match add_result {
        Err(e) => add_error_message = format!("unable to add packages: {e}"),
        Ok(result) if !result.error.is_empty() => {
            context.log_error(format!("Unable to invoke repo-add: {}", result.error));
            add_error_message = format!("unable to add packages: {}", result.error);
        }
        Ok(result) if result.exit_code != Some(0) => {
            let exit_code = result.exit_code.unwrap_or(-1);
            context.log_error(format!(
                "repo-add invocation exited with non-zero exit code: {exit_code}"
            ));
            add_error_message =
                format!("unable to add packages: repo-add returned with exit code {exit_code}");
        }
        Ok(_) => {}
    }

    match remove_result {
        Err(e) => {
            prep.result.error_message = format!("unable to remove packages: {e}");
        }
        Ok(result) if !result.error.is_empty() => {
            context.log_error(format!("Unable to invoke repo-remove: {}", result.error));
            prep.result.error_message = format!("unable to remove packages: {}", result.error);
        }
        Ok(result) if result.exit_code != Some(0) => {
            let exit_code = result.exit_code.unwrap_or(-1);
            context.log_error(format!(
                "repo-remove invocation exited with non-zero exit code: {exit_code}"
            ));
            prep.result.error_message = format!(
                "unable to remove package: repo-remove returned with exit code {exit_code}"
            );
        }
        Ok(_) => {
            // delete the copied packages from the source repo; storage
            // locations stay since other databases may still link to them
            for (package_name, location, ok) in &mut prep.package_locations {
                if !*ok {
                    continue;
                }
                if let Err(e) = std::fs::remove_file(&location.path_within_repo) {
                    *ok = false;
                    prep.result
                        .processed_packages
                        .retain(|name| name != package_name);
                    prep.result.failed_packages.push((
                        package_name.clone(),
                        format!("unable to remove from source repo: {e}"),
                    ));
                }
            }
        }
    }

    // consolidate: repo-add/repo-remove errors mean every package failed
    let has_remove_error = !prep.result.error_message.is_empty();
    let has_add_error = !add_error_message.is_empty();
    if !has_add_error && !has_remove_error {
        if prep.result.failed_packages.is_empty() {
            conclude_with_movement_result(context, prep.result, BuildActionResult::Success);
            return;
        }
        prep.result.error_message = format!(
            "failed to move {} packages",
            prep.result.failed_packages.len()
        );
        conclude_with_movement_result(context, prep.result, BuildActionResult::Failure);
        return;
    }

    let failure_reason = if has_add_error && has_remove_error {
        prep.result.error_message =
            format!("{}, {}", prep.result.error_message, add_error_message);
        "repo-add and repo-remove error"
    } else if has_add_error {
        prep.result.error_message = add_error_message;
        "repo-add error"
    } else {
        "repo-remove error"
    };
    let processed: Vec<String> = std::mem::take(&mut prep.result.processed_packages);
    for package in processed {
        prep.result
            .failed_packages
            .push((package, failure_reason.to_string()));
    }
    conclude_with_movement_result(context, prep.result, BuildActionResult::Failure);
}

/// Classification of one repository directory considered by CleanRepository
#[derive(Debug, Default)]
struct RepoDirCleanup {
    /// old package files no database references anymore, with the file names
    /// actually referenced instead
    to_archive: Vec<(PathBuf, String)>,
    /// non-package junk files
    to_delete: Vec<PathBuf>,
    /// whether this is a source directory (not cleaned)
    is_src: bool,
}

/// Archive unreferenced package files and delete junk in the repositories of
/// the destination databases
pub async fn run_clean_repository(context: &ActionContext) {
    let dry_run = context.snapshot(|action| action.has_flag(flags::CLEAN_REPOSITORY_DRY_RUN));
    context.log_info(if dry_run {
        "Preparing cleanup, dry run"
    } else {
        "Preparing cleanup"
    });
    let Some(init_data) = context.init(
        ConfigAccess::ReadConfig,
        RequiredDatabases {
            source: DbRequirement::None,
            destination: DbRequirement::OneOrMore,
        },
        RequiredParameters::MaybePackages,
    ) else {
        return;
    };

    let mut messages = BuildActionMessages::default();
    let mut repo_dirs: BTreeMap<PathBuf, RepoDirCleanup> = BTreeMap::new();
    {
        let config = context.setup.config.read().expect("config lock poisoned");
        for &db_index in &init_data.destination_db_indices {
            let db = &config.databases[db_index];
            if db.local_pkg_dir.is_empty() {
                messages.errors.push(format!(
                    "Unable to clean \"{}\": no local package directory configured",
                    db.name
                ));
                continue;
            }
            let arch_dir = match std::fs::canonicalize(&db.local_pkg_dir) {
                Ok(path) => path,
                Err(e) => {
                    messages.errors.push(format!(
                        "Unable to consider package dir of \"{}\": {e}",
                        db.name
                    ));
                    continue;
                }
            };

            // the arch-specific dir plus the shared "any" and "src" siblings
            let mut directories = vec![(arch_dir.clone(), false)];
            for (sibling, is_src) in [("any", false), ("src", true)] {
                if let Ok(path) = std::fs::canonicalize(arch_dir.join("..").join(sibling)) {
                    directories.push((path, is_src));
                }
            }

            for (directory, is_src) in directories {
                let cleanup = repo_dirs.entry(directory.clone()).or_default();
                cleanup.is_src = is_src;
                if !cleanup.to_archive.is_empty() || !cleanup.to_delete.is_empty() {
                    continue; // already classified for another database
                }
                let entries = match std::fs::read_dir(&directory) {
                    Ok(entries) => entries,
                    Err(e) => {
                        messages.errors.push(format!(
                            "Unable to iterate through repo directory \"{}\": {e}",
                            directory.display()
                        ));
                        continue;
                    }
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    let file_type = match entry.file_type() {
                        Ok(file_type) => file_type,
                        Err(_) => continue,
                    };
                    if file_type.is_dir() {
                        continue;
                    }
                    let file_name = entry.file_name().to_string_lossy().into_owned();

                    // keep database files
                    if file_name.contains(".db") || file_name.contains(".files") {
                        continue;
                    }
                    // non-package junk is deleted
                    if !file_name.contains(".pkg") && !file_name.contains(".src") {
                        cleanup.to_delete.push(path);
                        continue;
                    }
                    let package_name = match Package::file_name_components(&file_name) {
                        Ok((name, _, _)) => name.to_string(),
                        Err(e) => {
                            messages.warnings.push(format!(
                                "Unable to parse package name of \"{file_name}\" ({e}). Not touching it to be safe."
                            ));
                            continue;
                        }
                    };

                    // a file is kept while some destination database still
                    // references its exact name
                    let mut referenced = false;
                    let mut actually_referenced = Vec::new();
                    for &other_index in &init_data.destination_db_indices {
                        let other_db = &config.databases[other_index];
                        let Some(package) = other_db.packages.get(&package_name) else {
                            continue;
                        };
                        match &package.package_info {
                            None => {
                                messages.warnings.push(format!(
                                    "Database entry for package \"{package_name}\" misses the file name. Not touching \"{file_name}\" to be safe."
                                ));
                                referenced = true;
                            }
                            Some(info) if info.file_name.is_empty() => {
                                messages.warnings.push(format!(
                                    "Database entry for package \"{package_name}\" misses the file name. Not touching \"{file_name}\" to be safe."
                                ));
                                referenced = true;
                            }
                            Some(info) if info.file_name == file_name => {
                                referenced = true;
                            }
                            Some(info) => actually_referenced.push(info.file_name.clone()),
                        }
                        if referenced {
                            break;
                        }
                    }
                    if !referenced {
                        cleanup
                            .to_archive
                            .push((path, actually_referenced.join(", ")));
                    }
                }
            }
        }
    }

    if context.report_aborted_if_aborted() {
        return;
    }

    // perform (or, in a dry run, only record) the filesystem operations
    for (directory, cleanup) in &repo_dirs {
        // source directories are skipped: pkgbase and pkgname may differ and
        // produce false positives
        if cleanup.is_src {
            continue;
        }
        let mut processed_items = 0usize;
        for to_delete in &cleanup.to_delete {
            if !dry_run {
                if let Err(e) = std::fs::remove_file(to_delete) {
                    messages.errors.push(format!("Unable to delete: {e}"));
                    continue;
                }
            }
            processed_items += 1;
            messages
                .notes
                .push(format!("Deleted {}", to_delete.display()));
        }
        for (to_archive, referenced) in &cleanup.to_archive {
            if !dry_run {
                if let Err(e) = archive_file(to_archive) {
                    messages.errors.push(format!("Unable to archive: {e}"));
                    continue;
                }
            }
            processed_items += 1;
            messages.notes.push(format!(
                "Archived {} (current version: {})",
                to_archive.display(),
                if referenced.is_empty() {
                    "removed"
                } else {
                    referenced
                }
            ));
        }
        context.log_info(format!(
            "Archived/deleted {processed_items} files in \"{}\"",
            directory.display()
        ));
    }

    let result = if messages.errors.is_empty() {
        BuildActionResult::Success
    } else {
        BuildActionResult::Failure
    };
    context.conclude(result, BuildActionResultData::Messages(messages));
}

/// Report missing files, incomplete metadata and unresolved dependencies of
/// the destination databases
pub async fn run_check_for_problems(context: &ActionContext) {
    let Some(init_data) = context.init(
        ConfigAccess::ReadConfig,
        RequiredDatabases {
            source: DbRequirement::None,
            destination: DbRequirement::OneOrMore,
        },
        RequiredParameters::None,
    ) else {
        return;
    };

    let mut result: BTreeMap<String, Vec<RepositoryProblem>> = BTreeMap::new();
    {
        let config = context.setup.config.read().expect("config lock poisoned");
        for &db_index in &init_data.destination_db_indices {
            let db = &config.databases[db_index];
            let problems = result.entry(db.name.clone()).or_default();

            if db.path.is_empty() || !Path::new(&db.path).is_file() {
                problems.push(RepositoryProblem {
                    desc: format!("db file \"{}\" is not a regular file", db.path),
                    ..Default::default()
                });
            }
            let files_path = if db.files_path.is_empty() {
                db.files_path_from_regular_path()
            } else {
                db.files_path.clone()
            };
            if files_path.is_empty() || !Path::new(&files_path).is_file() {
                problems.push(RepositoryProblem {
                    desc: format!("files db file \"{files_path}\" is not a regular file"),
                    ..Default::default()
                });
            }
            if !db.local_pkg_dir.is_empty() {
                if !Path::new(&db.local_pkg_dir).is_dir() {
                    problems.push(RepositoryProblem {
                        desc: format!(
                            "configured local package directory \"{}\" is not a directory",
                            db.local_pkg_dir
                        ),
                        ..Default::default()
                    });
                }
                for (package_name, package) in &db.packages {
                    let Some(info) = &package.package_info else {
                        problems.push(RepositoryProblem {
                            desc: "no package info present".to_string(),
                            pkg: package_name.clone(),
                            ..Default::default()
                        });
                        continue;
                    };
                    if !db.locate_package(&info.file_name).exists {
                        problems.push(RepositoryProblem {
                            desc: format!("binary package \"{}\" not present", info.file_name),
                            pkg: package_name.clone(),
                            ..Default::default()
                        });
                    }
                }
            }

            for (package_name, unresolved) in
                db.detect_unresolved_packages(&config, &[], &DependencySet::new())
            {
                problems.push(RepositoryProblem {
                    desc: "unresolved dependencies".to_string(),
                    pkg: package_name,
                    unresolved: Some(unresolved),
                });
            }
        }
    }

    context.conclude(
        BuildActionResult::Success,
        BuildActionResultData::RepositoryProblems(result),
    );
}

/// Classify the packages of the source databases against the destination
pub async fn run_check_for_updates(context: &ActionContext) {
    let Some(init_data) = context.init(
        ConfigAccess::ReadConfig,
        RequiredDatabases {
            source: DbRequirement::OneOrMore,
            destination: DbRequirement::One,
        },
        RequiredParameters::None,
    ) else {
        return;
    };

    let updates = {
        let config = context.setup.config.read().expect("config lock poisoned");
        let destination = &config.databases[init_data.destination_db_indices[0]];
        let sources: Vec<&crate::database::Database> = init_data
            .source_db_indices
            .iter()
            .map(|&index| &config.databases[index])
            .collect();
        destination.check_for_updates(&sources)
    };
    context.conclude(
        BuildActionResult::Success,
        BuildActionResultData::UpdateList(updates),
    );
}
