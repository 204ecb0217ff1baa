// src/actions/meta.rs

//! Declarative description of the available build-action types
//!
//! The table drives input validation, the web forms and the CLI: for every
//! action type it lists the applicable flags and settings together with the
//! parameter names used on the wire.

use crate::actions::{flags, settings, BuildActionType};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildActionFlagMetaInfo {
    pub id: u64,
    pub name: &'static str,
    pub desc: &'static str,
    pub param: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildActionSettingMetaInfo {
    pub name: &'static str,
    pub desc: &'static str,
    pub param: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildActionTypeMetaInfo {
    pub id: BuildActionType,
    pub category: &'static str,
    pub name: &'static str,
    /// Type slug used on the wire, e.g. "prepare-build"
    #[serde(rename = "type")]
    pub type_slug: &'static str,
    pub flags: Vec<BuildActionFlagMetaInfo>,
    pub settings: Vec<BuildActionSettingMetaInfo>,
    pub directory: bool,
    pub source_db: bool,
    pub destination_db: bool,
    pub package_names: bool,
}

impl BuildActionTypeMetaInfo {
    pub fn is_valid(&self) -> bool {
        self.id != BuildActionType::Invalid
    }
}

/// Lookup table over all build-action types
#[derive(Debug)]
pub struct BuildActionMetaInfo {
    pub types: Vec<BuildActionTypeMetaInfo>,
    by_name: HashMap<&'static str, usize>,
}

impl Default for BuildActionMetaInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildActionMetaInfo {
    pub fn new() -> Self {
        let types = vec![
            BuildActionTypeMetaInfo {
                id: BuildActionType::Invalid,
                name: "Invalid",
                ..Default::default()
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::RemovePackages,
                category: "Repo management",
                name: "Remove packages",
                type_slug: "remove-packages",
                flags: vec![],
                settings: vec![],
                directory: true,
                source_db: false,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::MovePackages,
                category: "Repo management",
                name: "Move packages",
                type_slug: "move-packages",
                flags: vec![],
                settings: vec![],
                directory: true,
                source_db: true,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::CheckForUpdates,
                category: "Repo management",
                name: "Check for updates",
                type_slug: "check-updates",
                flags: vec![],
                settings: vec![],
                directory: false,
                source_db: true,
                destination_db: true,
                package_names: false,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::ReloadLibraryDependencies,
                category: "Refresh data",
                name: "Reload library dependencies",
                type_slug: "reload-library-dependencies",
                flags: vec![
                    BuildActionFlagMetaInfo {
                        id: flags::RELOAD_LIB_DEPS_FORCE_RELOAD,
                        name: "Force reload",
                        desc: "Reload packages even though they have not changed on disk since the last reload",
                        param: "force-reload",
                    },
                    BuildActionFlagMetaInfo {
                        id: flags::RELOAD_LIB_DEPS_SKIP_DEPENDENCIES,
                        name: "Skip dependencies",
                        desc: "Do not take dependencies of the specified destination databases into account",
                        param: "skip-dependencies",
                    },
                ],
                settings: vec![],
                directory: false,
                source_db: false,
                destination_db: true,
                package_names: false,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::PrepareBuild,
                category: "Building",
                name: "Prepare build",
                type_slug: "prepare-build",
                flags: vec![
                    BuildActionFlagMetaInfo {
                        id: flags::PREPARE_BUILD_FORCE_BUMP_PKGREL,
                        name: "Force-bump pkgrel",
                        desc: "Bump the pkgrel even if there is no existing version",
                        param: "force-bump-pkgrel",
                    },
                    BuildActionFlagMetaInfo {
                        id: flags::PREPARE_BUILD_CLEAN_SRC_DIR,
                        name: "Clean source directory",
                        desc: "Removes existing \"src\" sub-directories for the specified packages; use to update previously built packages",
                        param: "clean-src-dir",
                    },
                    BuildActionFlagMetaInfo {
                        id: flags::PREPARE_BUILD_KEEP_ORDER,
                        name: "Keep dependency order",
                        desc: "Build packages in the specified order",
                        param: "keep-order",
                    },
                    BuildActionFlagMetaInfo {
                        id: flags::PREPARE_BUILD_KEEP_PKGREL_AND_EPOCH,
                        name: "Keep pkgrel/epoch",
                        desc: "Never bumps pkgrel and epoch",
                        param: "keep-pkgrel-and-epoch",
                    },
                ],
                settings: vec![BuildActionSettingMetaInfo {
                    name: "PKGBUILDs directory",
                    desc: "A colon separated list of PKGBUILD directories to consider before the standard directories",
                    param: settings::PKGBUILDS_DIRS,
                }],
                directory: true,
                source_db: true,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::ConductBuild,
                category: "Building",
                name: "Conduct build",
                type_slug: "conduct-build",
                flags: vec![
                    BuildActionFlagMetaInfo {
                        id: flags::CONDUCT_BUILD_AS_FAR_AS_POSSIBLE,
                        name: "Build as far as possible",
                        desc: "Continue with further batches even when packages of the previous batch failed",
                        param: "build-as-far-as-possible",
                    },
                    BuildActionFlagMetaInfo {
                        id: flags::CONDUCT_SAVE_CHROOT_OF_FAILURES,
                        name: "Save chroot of failures",
                        desc: "Renames the chroot working copy when a package failed to build so it can be investigated",
                        param: "save-chroot-of-failures",
                    },
                    BuildActionFlagMetaInfo {
                        id: flags::CONDUCT_UPDATE_CHECKSUMS,
                        name: "Update checksums",
                        desc: "Updates the checksums of the PKGBUILDs instead of using them for validation",
                        param: "update-checksums",
                    },
                    BuildActionFlagMetaInfo {
                        id: flags::CONDUCT_AUTO_STAGING,
                        name: "Auto-staging",
                        desc: "Adds breaking packages only to the destination DB's staging repository and emits a rebuild list",
                        param: "auto-staging",
                    },
                ],
                settings: vec![
                    BuildActionSettingMetaInfo {
                        name: "Chroot directory",
                        desc: "The chroot directory to use (instead of the globally configured one)",
                        param: settings::CHROOT_DIR,
                    },
                    BuildActionSettingMetaInfo {
                        name: "Chroot default user",
                        desc: "The default chroot user to use (instead of the globally configured one)",
                        param: settings::CHROOT_USER,
                    },
                    BuildActionSettingMetaInfo {
                        name: "CCache directory",
                        desc: "The ccache directory to use (instead of the globally configured one)",
                        param: settings::CCACHE_DIR,
                    },
                    BuildActionSettingMetaInfo {
                        name: "Package cache directory",
                        desc: "The package cache directory to use (instead of the globally configured one)",
                        param: settings::PKG_CACHE_DIR,
                    },
                    BuildActionSettingMetaInfo {
                        name: "Test files directory",
                        desc: "The test files directory to use (instead of the globally configured one)",
                        param: settings::TEST_FILES_DIR,
                    },
                ],
                directory: true,
                source_db: false,
                destination_db: false,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::CheckForProblems,
                category: "Repo management",
                name: "Check for problems",
                type_slug: "check-for-problems",
                flags: vec![],
                settings: vec![],
                directory: true,
                source_db: false,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::CleanRepository,
                category: "Repo management",
                name: "Clean repository",
                type_slug: "clean-repository",
                flags: vec![BuildActionFlagMetaInfo {
                    id: flags::CLEAN_REPOSITORY_DRY_RUN,
                    name: "Dry run",
                    desc: "Only record what would be done",
                    param: "dry-run",
                }],
                settings: vec![],
                directory: true,
                source_db: false,
                destination_db: true,
                package_names: true,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::DummyBuildAction,
                category: "Misc",
                name: "Dummy action for debugging",
                type_slug: "dummy",
                flags: vec![],
                settings: vec![],
                directory: true,
                source_db: false,
                destination_db: false,
                package_names: false,
            },
            BuildActionTypeMetaInfo {
                id: BuildActionType::CustomCommand,
                category: "Misc",
                name: "Execute custom Bash command",
                type_slug: "custom-command",
                flags: vec![],
                settings: vec![BuildActionSettingMetaInfo {
                    name: "Command",
                    desc: "The command to execute via Bash",
                    param: settings::COMMAND,
                }],
                directory: true,
                source_db: false,
                destination_db: false,
                package_names: false,
            },
        ];

        let by_name = types
            .iter()
            .enumerate()
            .filter(|(_, info)| info.is_valid())
            .map(|(index, info)| (info.type_slug, index))
            .collect();

        Self { types, by_name }
    }

    /// Info for a type slug; the `Invalid` sentinel for unknown slugs
    pub fn type_info_for_name(&self, slug: &str) -> &BuildActionTypeMetaInfo {
        match self.by_name.get(slug) {
            Some(&index) => &self.types[index],
            None => self.type_info_for_id(BuildActionType::Invalid),
        }
    }

    /// Info for a type id; the `Invalid` sentinel when the id is not listed
    pub fn type_info_for_id(&self, id: BuildActionType) -> &BuildActionTypeMetaInfo {
        self.types
            .iter()
            .find(|info| info.id == id)
            .unwrap_or(&self.types[0])
    }

    /// Translate flag parameter names into the flag bits of the given type
    pub fn flags_from_params(&self, id: BuildActionType, params: &[String]) -> u64 {
        let info = self.type_info_for_id(id);
        let mut result = 0;
        for param in params {
            if let Some(flag) = info.flags.iter().find(|flag| flag.param == param) {
                result |= flag.id;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_id() {
        let meta = BuildActionMetaInfo::new();
        let info = meta.type_info_for_name("prepare-build");
        assert_eq!(info.id, BuildActionType::PrepareBuild);
        assert!(info.is_valid());
        assert_eq!(info.settings[0].param, "pkgbuilds-dir");

        let info = meta.type_info_for_id(BuildActionType::CleanRepository);
        assert_eq!(info.type_slug, "clean-repository");
        assert_eq!(info.flags[0].param, "dry-run");
    }

    #[test]
    fn test_unknown_slug_yields_invalid_sentinel() {
        let meta = BuildActionMetaInfo::new();
        let info = meta.type_info_for_name("explode-repo");
        assert!(!info.is_valid());
        assert_eq!(info.id, BuildActionType::Invalid);
    }

    #[test]
    fn test_flags_from_params() {
        let meta = BuildActionMetaInfo::new();
        let bits = meta.flags_from_params(
            BuildActionType::ConductBuild,
            &["auto-staging".to_string(), "update-checksums".to_string()],
        );
        assert_eq!(
            bits,
            flags::CONDUCT_AUTO_STAGING | flags::CONDUCT_UPDATE_CHECKSUMS
        );
        assert_eq!(
            meta.flags_from_params(BuildActionType::ConductBuild, &["bogus".to_string()]),
            0
        );
    }

    #[test]
    fn test_every_listed_type_has_unique_slug() {
        let meta = BuildActionMetaInfo::new();
        let mut slugs: Vec<&str> = meta
            .types
            .iter()
            .filter(|info| info.is_valid())
            .map(|info| info.type_slug)
            .collect();
        let total = slugs.len();
        slugs.sort();
        slugs.dedup();
        assert_eq!(slugs.len(), total);
    }
}
