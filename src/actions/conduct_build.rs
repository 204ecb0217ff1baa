// src/actions/conduct_build.rs

//! Serialized execution of a prepared build plan
//!
//! Works through the batches of `build-preparation.json`: per package it
//! downloads the sources via makepkg, optionally refreshes checksums, builds
//! in the chroot via makechrootpkg, verifies the expected artifacts and adds
//! them to the destination repository via repo-add. Progress is persisted to
//! `build-progress.json` after every package so an interrupted build resumes
//! where it stopped. With auto-staging, packages that would break reverse
//! dependencies land in the staging repository instead and the affected
//! packages are reported as the rebuild list.

use crate::actions::context::{ConfigAccess, RequiredDatabases, RequiredParameters};
use crate::actions::process::{BufferSearch, BuildProcessSession};
use crate::actions::{
    flags, settings, ActionContext, BuildActionResult, BuildActionResultData, BuildPreparation,
    BuildProgress, PackageBuildData, PackageRebuildInfo, RebuildList,
};
use crate::database::Config;
use crate::error::Error;
use crate::packages::{walk_through_archive, Package};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Settings of one ConductBuild run after merging action settings with the
/// global building configuration
struct BuildSettings {
    chroot_dir: String,
    chroot_user: String,
    makepkg: String,
    makechrootpkg: String,
    updpkgsums: String,
    repo_add: String,
    build_as_far_as_possible: bool,
    save_chroot_of_failures: bool,
    update_checksums: bool,
    auto_staging: bool,
}

pub async fn run(context: &ActionContext) {
    if context
        .init(
            ConfigAccess::ReadConfig,
            RequiredDatabases::default(),
            RequiredParameters::MaybePackages,
        )
        .is_none()
    {
        return;
    }

    let working_directory = context.working_directory();
    let preparation: BuildPreparation = match read_json(&working_directory.join("build-preparation.json")) {
        Ok(preparation) => preparation,
        Err(e) => {
            context.report_error(format!("Unable to restore build-preparation.json: {e}"));
            return;
        }
    };
    // missing progress simply means nothing has been built yet
    let mut progress: BuildProgress =
        read_json(&working_directory.join("build-progress.json")).unwrap_or_default();
    for pkgbase in preparation.packages.keys() {
        progress
            .progress_by_package
            .entry(pkgbase.clone())
            .or_default();
    }

    let build_settings = {
        let building = context.setup.building.read().expect("building lock poisoned");
        let setting = |key: &str, fallback: &str| {
            context
                .snapshot(|action| action.setting(key).map(str::to_string))
                .unwrap_or_else(|| fallback.to_string())
        };
        BuildSettings {
            chroot_dir: setting(settings::CHROOT_DIR, &building.chroot_dir),
            chroot_user: setting(settings::CHROOT_USER, &building.chroot_user),
            makepkg: building.tools.makepkg.clone(),
            makechrootpkg: building.tools.makechrootpkg.clone(),
            updpkgsums: building.tools.updpkgsums.clone(),
            repo_add: building.tools.repo_add.clone(),
            build_as_far_as_possible: context
                .snapshot(|action| action.has_flag(flags::CONDUCT_BUILD_AS_FAR_AS_POSSIBLE)),
            save_chroot_of_failures: context
                .snapshot(|action| action.has_flag(flags::CONDUCT_SAVE_CHROOT_OF_FAILURES)),
            update_checksums: context
                .snapshot(|action| action.has_flag(flags::CONDUCT_UPDATE_CHECKSUMS)),
            auto_staging: context
                .snapshot(|action| action.has_flag(flags::CONDUCT_AUTO_STAGING)),
        }
    };
    if build_settings.chroot_dir.is_empty() {
        context.report_error("The chroot directory is not configured.");
        return;
    }

    // with auto-staging the staging database must be configured
    if build_settings.auto_staging {
        let config = context.setup.config.read().expect("config lock poisoned");
        if config
            .find_database(&preparation.staging_db, &preparation.target_arch)
            .is_none()
        {
            drop(config);
            context.report_error(format!(
                "Auto-staging is enabled but the staging database \"{}@{}\" specified in build-preparation.json can not be found.",
                preparation.staging_db, preparation.target_arch
            ));
            return;
        }
    }

    // the destination repository is taken from the first db-config entry
    let Some(target_snapshot) = preparation.db_config.first() else {
        context.report_error("build-preparation.json contains no database configuration");
        return;
    };
    let destination_repo_dir = PathBuf::from(&target_snapshot.local_pkg_dir);
    if !destination_repo_dir.is_dir() {
        context.report_error(format!(
            "Destination repository \"{}\" does not exist.",
            destination_repo_dir.display()
        ));
        return;
    }
    let staging_repo_dir = preparation
        .staging_db_config
        .first()
        .map(|snapshot| PathBuf::from(&snapshot.local_pkg_dir));

    let progress_path = working_directory.join("build-progress.json");
    let mut failed_packages: Vec<String> = Vec::new();
    'batches: for batch in &preparation.batches {
        for pkgbase in batch {
            if context.report_aborted_if_aborted() {
                // keep partial progress on disk for the next run
                let _ = write_json(&progress_path, &progress);
                return;
            }
            let Some(build_data) = preparation.packages.get(pkgbase) else {
                continue;
            };
            {
                let entry = progress
                    .progress_by_package
                    .get(pkgbase)
                    .expect("progress entry inserted above");
                // resume: skip packages already finished in a previous run
                if entry.finished.is_some() {
                    if !entry.error.is_empty() {
                        failed_packages.push(pkgbase.clone());
                    }
                    continue;
                }
            }

            // skip packages whose dependencies already failed
            let failed_dependency = build_data
                .dependencies
                .iter()
                .find(|dependency| failed_packages.contains(*dependency));
            if let Some(failed_dependency) = failed_dependency {
                let entry = progress.progress_by_package.get_mut(pkgbase).expect("entry");
                entry.error = format!("not built because dependency \"{failed_dependency}\" failed");
                entry.finished = Some(Utc::now());
                failed_packages.push(pkgbase.clone());
                let _ = write_json(&progress_path, &progress);
                continue;
            }

            context.log_info(format!("Building {pkgbase} ({})", build_data.version));
            let outcome = build_package(
                context,
                &working_directory,
                &preparation,
                build_data,
                &build_settings,
                &destination_repo_dir,
                staging_repo_dir.as_deref(),
                &mut progress,
            )
            .await;
            match outcome {
                Ok(()) => {}
                Err(Error::Aborted) => {
                    let _ = write_json(&progress_path, &progress);
                    context.report_aborted_if_aborted();
                    return;
                }
                Err(e) => {
                    let entry = progress.progress_by_package.get_mut(pkgbase).expect("entry");
                    if entry.error.is_empty() {
                        entry.error = e.to_string();
                    }
                    entry.finished = Some(Utc::now());
                    failed_packages.push(pkgbase.clone());
                    context.log_error(format!("Failed to build {pkgbase}: {}", entry.error));
                }
            }
            if let Err(e) = write_json(&progress_path, &progress) {
                context.report_error(format!("unable to persist build progress: {e}"));
                return;
            }
        }

        if !failed_packages.is_empty() && !build_settings.build_as_far_as_possible {
            break 'batches;
        }
    }

    if failed_packages.is_empty() {
        context.conclude(
            BuildActionResult::Success,
            BuildActionResultData::BuildProgress(progress),
        );
    } else {
        failed_packages.sort();
        failed_packages.dedup();
        context.conclude(
            BuildActionResult::Failure,
            BuildActionResultData::Error(format!(
                "failed to build packages: {}",
                failed_packages.join(", ")
            )),
        );
    }
}

/// Drive the tool chain for a single package
#[allow(clippy::too_many_arguments)]
async fn build_package(
    context: &ActionContext,
    working_directory: &Path,
    preparation: &BuildPreparation,
    build_data: &PackageBuildData,
    build_settings: &BuildSettings,
    destination_repo_dir: &Path,
    staging_repo_dir: Option<&Path>,
    progress: &mut BuildProgress,
) -> crate::error::Result<()> {
    let pkgbase = &build_data.pkgbase;
    let src_dir = working_directory.join(pkgbase).join("src");
    let pkg_dir = working_directory.join(pkgbase).join("pkg");
    std::fs::create_dir_all(&pkg_dir)
        .map_err(|e| Error::Io(format!("unable to create package directory: {e}")))?;

    // the chroot working copy is arch-specific; "any" packages build in the
    // target architecture's chroot
    let chroot_arch = if build_data.arch == "any" {
        preparation.target_arch.as_str()
    } else {
        build_data.arch.as_str()
    };
    let chroot_root = Path::new(&build_settings.chroot_dir)
        .join(format!("arch-{chroot_arch}"))
        .join("root");
    if !chroot_root.is_dir() {
        progress
            .progress_by_package
            .get_mut(pkgbase)
            .expect("progress entry")
            .error = format!(
            "Chroot directory \"{}\" is no directory.",
            chroot_root.display()
        );
        return Err(Error::External("chroot missing".to_string()));
    }

    // 1. download/extract sources (watching for a dynamic pkgver update)
    let updated_version: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let search_sink = Arc::clone(&updated_version);
    let mut search = BufferSearch::new(
        "Updated version: ",
        "\u{1b}\n",
        "Starting build",
        move |version| {
            *search_sink.lock().expect("version mutex poisoned") = version;
        },
    );
    let download_session = BuildProcessSession::new(
        "makepkg",
        pkg_dir.join("download.log"),
        context.abort.clone(),
    )
    .with_working_dir(&src_dir);
    context.with_action_mut(|action| action.register_log_file("makepkg"));
    let download_args: Vec<String> = ["-f", "--nodeps", "--nobuild", "--source"]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    let result = download_session
        .run(&build_settings.makepkg, &download_args, Some(&mut search))
        .await?;
    if !result.succeeded() {
        return Err(Error::External(format!(
            "makepkg source download failed: {}",
            describe_failure(&result.error, result.exit_code)
        )));
    }
    {
        let updated_version = updated_version.lock().expect("version mutex poisoned");
        if !updated_version.is_empty() {
            progress
                .progress_by_package
                .get_mut(pkgbase)
                .expect("progress entry")
                .updated_version = updated_version.clone();
        }
    }

    // 2. refresh checksums when requested
    if build_settings.update_checksums {
        let session = BuildProcessSession::new(
            "updpkgsums",
            pkg_dir.join("updpkgsums.log"),
            context.abort.clone(),
        )
        .with_working_dir(&src_dir);
        let result = session.run(&build_settings.updpkgsums, &[], None).await?;
        if !result.succeeded() {
            return Err(Error::External(format!(
                "updpkgsums failed: {}",
                describe_failure(&result.error, result.exit_code)
            )));
        }
    }

    // 3. build within the chroot
    let build_session = BuildProcessSession::new(
        "makechrootpkg",
        pkg_dir.join("build.log"),
        context.abort.clone(),
    )
    .with_working_dir(&src_dir);
    let build_args: Vec<String> = vec![
        "-c".to_string(),
        "-u".to_string(),
        "-C".to_string(),
        "-r".to_string(),
        format!("{}/arch-{chroot_arch}", build_settings.chroot_dir),
        "-l".to_string(),
        build_settings.chroot_user.clone(),
        "--".to_string(),
    ];
    let result = build_session
        .run(&build_settings.makechrootpkg, &build_args, None)
        .await?;
    if !result.succeeded() {
        save_failed_chroot(context, build_settings, chroot_arch);
        return Err(Error::External(format!(
            "makechrootpkg failed: {}",
            describe_failure(&result.error, result.exit_code)
        )));
    }

    // 4. verify that the expected artifacts exist
    let source_tarball = format!("{pkgbase}-{}.src.tar.gz", build_data.version);
    let mut expected_binaries = Vec::new();
    for subpackage in &build_data.subpackages {
        expected_binaries.push(format!(
            "{subpackage}-{}-{}.pkg.tar.zst",
            build_data.version, build_data.arch
        ));
    }
    let mut missing = Vec::new();
    for artifact in std::iter::once(&source_tarball).chain(expected_binaries.iter()) {
        if !pkg_dir.join(artifact).is_file() {
            missing.push(artifact.clone());
        }
    }
    if !missing.is_empty() {
        save_failed_chroot(context, build_settings, chroot_arch);
        return Err(Error::External(format!(
            "not all expected packages exist after the build: missing {}",
            missing.join(", ")
        )));
    }

    // 5. auto-staging: packages replacing a library at a different version
    // break their reverse dependencies and go to the staging repository
    let mut use_staging = false;
    if build_settings.auto_staging {
        let mut new_libprovides = BTreeSet::new();
        for binary in &expected_binaries {
            new_libprovides.extend(parse_artifact_libprovides(&pkg_dir.join(binary))?);
        }
        let rebuild_list = {
            let config = context.setup.config.read().expect("config lock poisoned");
            compute_rebuild_list(
                &config,
                &build_data.subpackages,
                &new_libprovides,
                &preparation.target_db,
            )
        };
        if !rebuild_list.is_empty() {
            context.log_info(format!(
                "Adding {pkgbase} to staging repository; {} database(s) are affected",
                rebuild_list.len()
            ));
            merge_rebuild_list(&mut progress.rebuild_list, rebuild_list);
            use_staging = true;
        }
    }
    let (repo_dir, db_name) = if use_staging {
        let Some(staging_repo_dir) = staging_repo_dir else {
            return Err(Error::External(
                "staging required but no staging repository configured".to_string(),
            ));
        };
        (staging_repo_dir, preparation.staging_db.as_str())
    } else {
        (destination_repo_dir, preparation.target_db.as_str())
    };

    // 6. copy artifacts into the repository and run repo-add
    let src_repo_dir = repo_dir
        .parent()
        .map(|parent| parent.join("src"))
        .unwrap_or_else(|| repo_dir.join("src"));
    std::fs::create_dir_all(&src_repo_dir)
        .map_err(|e| Error::Io(format!("unable to create source repo directory: {e}")))?;
    std::fs::copy(pkg_dir.join(&source_tarball), src_repo_dir.join(&source_tarball))
        .map_err(|e| Error::Io(format!("unable to copy source package: {e}")))?;
    for binary in &expected_binaries {
        std::fs::copy(pkg_dir.join(binary), repo_dir.join(binary))
            .map_err(|e| Error::Io(format!("unable to copy binary package: {e}")))?;
    }

    let repo_add_session = BuildProcessSession::new(
        "repo-add",
        pkg_dir.join("repo-add.log"),
        context.abort.clone(),
    )
    .with_working_dir(repo_dir);
    context.with_action_mut(|action| action.register_log_file("repo-add"));
    let mut repo_add_args = vec![format!("{db_name}.db.tar.zst")];
    repo_add_args.extend(expected_binaries.iter().cloned());
    let result = repo_add_session
        .run(&build_settings.repo_add, &repo_add_args, None)
        .await?;
    if !result.succeeded() {
        return Err(Error::External(format!(
            "repo-add failed: {}",
            describe_failure(&result.error, result.exit_code)
        )));
    }

    let entry = progress
        .progress_by_package
        .get_mut(pkgbase)
        .expect("progress entry");
    entry.added_to_repo = true;
    entry.finished = Some(Utc::now());
    context.log_info(format!("Successfully built {pkgbase}"));
    Ok(())
}

fn describe_failure(error: &str, exit_code: Option<i32>) -> String {
    if !error.is_empty() {
        return error.to_string();
    }
    format!("exit code {}", exit_code.unwrap_or(-1))
}

/// Preserve the chroot working copy of a failed build for investigation
fn save_failed_chroot(context: &ActionContext, build_settings: &BuildSettings, chroot_arch: &str) {
    if !build_settings.save_chroot_of_failures {
        return;
    }
    let working_copy = Path::new(&build_settings.chroot_dir)
        .join(format!("arch-{chroot_arch}"))
        .join(&build_settings.chroot_user);
    if !working_copy.is_dir() {
        return;
    }
    let preserved = working_copy.with_file_name(format!(
        "{}.failed.{}",
        build_settings.chroot_user,
        Utc::now().format("%Y%m%dT%H%M%S")
    ));
    match std::fs::rename(&working_copy, &preserved) {
        Ok(()) => context.log_info(format!(
            "Saved chroot working copy at \"{}\"",
            preserved.display()
        )),
        Err(e) => context.log_error(format!("Unable to save chroot working copy: {e}")),
    }
}

/// Library provides contained in a freshly built binary package
fn parse_artifact_libprovides(path: &Path) -> crate::error::Result<BTreeSet<String>> {
    let mut package = Package::default();
    let mut dlls = crate::packages::binary::ImportLibReferences::default();
    let package_cell = std::cell::RefCell::new(&mut package);
    let dlls_cell = std::cell::RefCell::new(&mut dlls);
    walk_through_archive(
        path,
        &Package::is_pkg_info_file_or_binary,
        |directory, file| {
            if directory.is_empty() && file.name == ".PKGINFO" {
                return;
            }
            package_cell.borrow_mut().add_deps_and_provides_from_contained_file(
                directory,
                &file,
                &mut dlls_cell.borrow_mut(),
            );
        },
        |_directory| {},
    )?;
    Ok(package.libprovides.into_iter().collect())
}

/// Packages in the configuration that depend on a library the newly built
/// packages replace at a different version
///
/// Returns `db → package → affected libprovides`; an empty result means the
/// build can go to the regular repository.
pub fn compute_rebuild_list(
    config: &Config,
    built_package_names: &[String],
    new_libprovides: &BTreeSet<String>,
    target_db: &str,
) -> RebuildList {
    // libraries the previous versions of the built packages provided
    let mut replaced_libraries: BTreeSet<String> = BTreeSet::new();
    for db in &config.databases {
        for built_name in built_package_names {
            let Some(existing) = db.packages.get(built_name) else {
                continue;
            };
            for old_library in &existing.libprovides {
                if new_libprovides.contains(old_library) {
                    continue; // still provided, nothing breaks
                }
                // only consider the library replaced when the new packages
                // ship another version of the same soname stem
                let stem = soname_stem(old_library);
                if new_libprovides
                    .iter()
                    .any(|new_library| soname_stem(new_library) == stem)
                {
                    replaced_libraries.insert(old_library.clone());
                }
            }
        }
    }
    if replaced_libraries.is_empty() {
        return RebuildList::new();
    }

    let mut rebuild_list = RebuildList::new();
    for db in &config.databases {
        for package in db.packages.values() {
            // the built packages themselves need no rebuild
            if built_package_names.contains(&package.name) && db.name == target_db {
                continue;
            }
            let affected: Vec<String> = package
                .libdepends
                .iter()
                .filter(|library| replaced_libraries.contains(*library))
                .cloned()
                .collect();
            if !affected.is_empty() {
                rebuild_list
                    .entry(db.name.clone())
                    .or_default()
                    .insert(package.name.clone(), PackageRebuildInfo {
                        libprovides: affected,
                    });
            }
        }
    }
    rebuild_list
}

/// `elf-x86_64::libboost_regex.so.1.72.0` → `elf-x86_64::libboost_regex.so`
fn soname_stem(library: &str) -> &str {
    match library.find(".so") {
        Some(position) => &library[..position + 3],
        None => library,
    }
}

fn merge_rebuild_list(target: &mut RebuildList, addition: RebuildList) {
    for (db_name, packages) in addition {
        let entry = target.entry(db_name).or_default();
        for (package_name, info) in packages {
            entry.entry(package_name).or_insert(info);
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> crate::error::Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Io(format!("\"{}\" does not exist or is unreadable: {e}", path.display()))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Parse(format!("unable to parse {}: {e}", path.display())))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> crate::error::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Io(format!("unable to serialize {}: {e}", path.display())))?;
    std::fs::write(path, json)
        .map_err(|e| Error::Io(format!("unable to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn test_soname_stem() {
        assert_eq!(
            soname_stem("elf-x86_64::libboost_regex.so.1.72.0"),
            "elf-x86_64::libboost_regex.so"
        );
        assert_eq!(
            soname_stem("elf-x86_64::libstdc++.so.6"),
            "elf-x86_64::libstdc++.so"
        );
        assert_eq!(soname_stem("pe-i386::libfoo.dll"), "pe-i386::libfoo.dll");
    }

    #[test]
    fn test_rebuild_list_detects_replaced_soname_version() {
        let mut config = Config::default();
        let mut boost_db = Database::new("boost", "boost.db");
        let mut boost_libs = Package::new("boost-libs", "1.72.0-1");
        boost_libs.libprovides = vec!["elf-x86_64::libboost_regex.so.1.72.0".to_string()];
        boost_libs.libdepends = vec!["elf-x86_64::libstdc++.so.6".to_string()];
        boost_db.update_package(boost_libs);
        config.databases.push(boost_db);

        let mut misc_db = Database::new("misc", "misc.db");
        let mut source_highlight = Package::new("source-highlight", "3.1.9-1");
        source_highlight.libprovides = vec!["elf-x86_64::libsource-highlight.so.4".to_string()];
        source_highlight.libdepends = vec![
            "elf-x86_64::libboost_regex.so.1.72.0".to_string(),
            "elf-x86_64::libsource-highlight.so.4".to_string(),
            "elf-x86_64::libstdc++.so.6".to_string(),
        ];
        misc_db.update_package(source_highlight);
        config.databases.push(misc_db);

        // the new boost provides the 1.73 soname instead of 1.72
        let new_libprovides: BTreeSet<String> =
            ["elf-x86_64::libboost_regex.so.1.73.0".to_string()]
                .into_iter()
                .collect();
        let rebuild_list = compute_rebuild_list(
            &config,
            &["boost".to_string(), "boost-libs".to_string()],
            &new_libprovides,
            "boost",
        );

        assert_eq!(rebuild_list.len(), 1);
        let misc = rebuild_list.get("misc").expect("misc db affected");
        let info = misc.get("source-highlight").expect("source-highlight affected");
        assert_eq!(
            info.libprovides,
            vec!["elf-x86_64::libboost_regex.so.1.72.0".to_string()]
        );
    }

    #[test]
    fn test_rebuild_list_empty_when_sonames_unchanged() {
        let mut config = Config::default();
        let mut boost_db = Database::new("boost", "boost.db");
        let mut boost_libs = Package::new("boost-libs", "1.73.0-1");
        boost_libs.libprovides = vec!["elf-x86_64::libboost_regex.so.1.73.0".to_string()];
        boost_db.update_package(boost_libs);
        config.databases.push(boost_db);

        let new_libprovides: BTreeSet<String> =
            ["elf-x86_64::libboost_regex.so.1.73.0".to_string()]
                .into_iter()
                .collect();
        let rebuild_list = compute_rebuild_list(
            &config,
            &["boost-libs".to_string()],
            &new_libprovides,
            "boost",
        );
        assert!(rebuild_list.is_empty());
    }

    #[test]
    fn test_read_json_missing_file_mentions_absence() {
        let error = read_json::<BuildPreparation>(Path::new("/nonexistent/build-preparation.json"))
            .unwrap_err();
        assert!(error.to_string().contains("does not exist"));
    }
}
