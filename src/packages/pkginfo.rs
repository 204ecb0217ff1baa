// src/packages/pkginfo.rs

//! .PKGINFO parsing
//!
//! The `.PKGINFO` file at the root of a binary package is a flat list of
//! `key = value` lines. Repeated keys append to the corresponding sequence
//! field; unknown keys are ignored.

use crate::packages::{Dependency, InstallInfo, Package, PackageInfo, SourceInfo};
use chrono::{DateTime, Utc};

/// Merge the content of a `.PKGINFO` file into `package`
pub fn add_info_from_pkg_info_file(package: &mut Package, content: &str) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "pkgname" => package.name = value.to_string(),
            "pkgver" => package.version = value.to_string(),
            "pkgdesc" => package.description = value.to_string(),
            "url" => package.upstream_url = value.to_string(),
            "license" => package.licenses.push(value.to_string()),
            "group" => package.groups.push(value.to_string()),
            "depend" => package.dependencies.push(Dependency::parse(value)),
            "optdepend" => package.optional_dependencies.push(Dependency::parse(value)),
            "provides" => package.provides.push(Dependency::parse(value)),
            "replaces" => package.replaces.push(Dependency::parse(value)),
            "conflict" => package.conflicts.push(Dependency::parse(value)),
            "arch" => package_info(package).arch = value.to_string(),
            "builddate" => {
                package_info(package).build_date = value
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
            }
            "packager" => package_info(package).packager = value.to_string(),
            "size" => {
                let install_info = package.install_info.get_or_insert_with(InstallInfo::default);
                install_info.installed_size = value.parse().unwrap_or(0);
            }
            "makedepend" => source_info(package)
                .make_dependencies
                .push(Dependency::parse(value)),
            "checkdepend" => source_info(package)
                .check_dependencies
                .push(Dependency::parse(value)),
            _ => {}
        }
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
    use crate::packages::DependencyMode;

    const SAMPLE: &str = r#"
# Generated by makepkg
pkgname = cmake
pkgver = 3.8.2-1
pkgdesc = A cross-platform open-source make system
url = https://www.cmake.org/
builddate = 1497296234
packager = Felix
size = 21345678
arch = x86_64
license = custom
depend = curl
depend = libarchive
depend = shared-mime-info
optdepend = qt5-base: cmake-gui
makedepend = ninja
checkdepend = python
unknown-key = should be ignored
"#;

    #[test]
    fn test_basic_fields() {
        let mut package = Package::default();
        add_info_from_pkg_info_file(&mut package, SAMPLE);

        assert_eq!(package.name, "cmake");
        assert_eq!(package.version, "3.8.2-1");
        assert_eq!(package.upstream_url, "https://www.cmake.org/");
        assert_eq!(package.licenses, vec!["custom"]);
        let info = package.package_info.unwrap();
        assert_eq!(info.arch, "x86_64");
        assert_eq!(info.packager, "Felix");
        assert!(info.build_date.is_some());
        assert_eq!(package.install_info.unwrap().installed_size, 21345678);
    }

    #[test]
    fn test_repeated_keys_append() {
        let mut package = Package::default();
        add_info_from_pkg_info_file(&mut package, SAMPLE);
        assert_eq!(package.dependencies.len(), 3);
        assert_eq!(package.dependencies[0].name, "curl");
        assert_eq!(package.optional_dependencies.len(), 1);
        assert_eq!(package.optional_dependencies[0].name, "qt5-base");
        let source_info = package.source_info.unwrap();
        assert_eq!(source_info.make_dependencies.len(), 1);
        assert_eq!(source_info.check_dependencies.len(), 1);
    }

    #[test]
    fn test_versioned_dependency() {
        let mut package = Package::default();
        add_info_from_pkg_info_file(&mut package, "depend = glibc>=2.34\n");
        assert_eq!(package.dependencies[0].name, "glibc");
        assert_eq!(package.dependencies[0].mode, DependencyMode::GreaterEqual);
        assert_eq!(package.dependencies[0].version.as_deref(), Some("2.34"));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let mut package = Package::default();
        add_info_from_pkg_info_file(&mut package, "bogus = 1\nweird line without equals\n");
        assert_eq!(package, Package::default());
    }
}
