// src/packages/mod.rs

//! Package data model
//!
//! A [`Package`] aggregates everything the service knows about one package:
//! metadata from the binary package file name, from the repository database
//! entry and from the package contents (library provides/depends recovered
//! from contained ELF/PE binaries). The [`origin`](PackageOrigin) field tracks
//! which of those sources contributed data last.

pub mod archive;
pub mod binary;
pub mod depset;
pub mod pkgbuild;
pub mod pkginfo;

pub use archive::{walk_through_archive, ArchiveFile};
pub use depset::{DependencyDetail, DependencySet};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison mode of a dependency's version constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DependencyMode {
    #[default]
    Any,
    Equal,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
}

impl DependencyMode {
    fn as_str(self) -> &'static str {
        match self {
            DependencyMode::Any => "",
            DependencyMode::Equal => "=",
            DependencyMode::GreaterEqual => ">=",
            DependencyMode::LessEqual => "<=",
            DependencyMode::Greater => ">",
            DependencyMode::Less => "<",
        }
    }
}

/// A dependency on (or provision of) a package name, optionally constrained
/// to a version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: Option<String>,
    pub mode: DependencyMode,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            mode: DependencyMode::Any,
        }
    }

    /// Parse a dependency denotation like "glibc>=2.34", "zstd" or "foo=1-2"
    pub fn parse(denotation: &str) -> Self {
        let denotation = denotation.trim();
        // Optional dependencies carry a ": description" suffix
        let denotation = match denotation.split_once(": ") {
            Some((dep, _desc)) => dep,
            None => denotation,
        };
        for (op, mode) in [
            (">=", DependencyMode::GreaterEqual),
            ("<=", DependencyMode::LessEqual),
            (">", DependencyMode::Greater),
            ("<", DependencyMode::Less),
            ("=", DependencyMode::Equal),
        ] {
            if let Some(pos) = denotation.find(op) {
                return Self {
                    name: denotation[..pos].trim().to_string(),
                    version: Some(denotation[pos + op.len()..].trim().to_string()),
                    mode,
                };
            }
        }
        Self::new(denotation)
    }

    /// Whether a provider with the given version satisfies this dependency
    ///
    /// A provider with unknown version only satisfies unconstrained
    /// dependencies.
    pub fn matches_provider(&self, provider_version: Option<&str>) -> bool {
        let Some(required) = self.version.as_deref() else {
            return true;
        };
        if self.mode == DependencyMode::Any {
            return true;
        }
        let Some(provided) = provider_version else {
            return false;
        };
        let ord = crate::version::pkg_vercmp(provided, required);
        match self.mode {
            DependencyMode::Any => true,
            DependencyMode::Equal => ord == std::cmp::Ordering::Equal,
            DependencyMode::GreaterEqual => ord != std::cmp::Ordering::Less,
            DependencyMode::LessEqual => ord != std::cmp::Ordering::Greater,
            DependencyMode::Greater => ord == std::cmp::Ordering::Greater,
            DependencyMode::Less => ord == std::cmp::Ordering::Less,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}{}{}", self.name, self.mode.as_str(), version),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Which source contributed the package's data last
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum PackageOrigin {
    #[default]
    Unknown,
    /// Only the file name has been parsed
    PackageFileName,
    /// The entry of a repository database file has been parsed
    DatabaseFileList,
    /// The binary package itself has been analyzed, including contained
    /// ELF/PE files
    PackageContents,
}

/// Metadata of the binary package file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PackageInfo {
    pub arch: String,
    pub build_date: Option<DateTime<Utc>>,
    pub file_name: String,
    pub size: u64,
    pub packager: String,
}

/// Metadata of the source package
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    pub archs: Vec<String>,
    pub make_dependencies: Vec<Dependency>,
    pub check_dependencies: Vec<Dependency>,
}

/// Metadata only known for installed packages
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstallInfo {
    pub installed_size: u64,
}

/// A binary package and everything known about it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub description: String,
    pub upstream_url: String,
    pub licenses: Vec<String>,
    pub groups: Vec<String>,
    pub dependencies: Vec<Dependency>,
    pub optional_dependencies: Vec<Dependency>,
    pub provides: Vec<Dependency>,
    pub replaces: Vec<Dependency>,
    pub conflicts: Vec<Dependency>,
    /// Libraries contained in the package, e.g. `elf-x86_64::libfoo.so.1`
    pub libprovides: Vec<String>,
    /// Libraries needed by binaries in the package
    pub libdepends: Vec<String>,
    pub package_info: Option<PackageInfo>,
    pub source_info: Option<SourceInfo>,
    pub install_info: Option<InstallInfo>,
    pub origin: PackageOrigin,
    /// Modification time of the binary package that contributed data last
    pub timestamp: Option<DateTime<Utc>>,
}

impl Package {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Split a package file name into (name, version, arch)
    ///
    /// The version component includes the pkgrel, e.g.
    /// "cmake-3.8.2-1-x86_64.pkg.tar.xz" → ("cmake", "3.8.2-1", "x86_64").
    pub fn file_name_components(file_name: &str) -> Result<(&str, String, &str)> {
        let stem_end = file_name
            .find(".pkg")
            .ok_or_else(|| Error::MalformedName(file_name.to_string()))?;
        let stem = &file_name[..stem_end];

        // the three trailing hyphen-separated tokens are pkgver, pkgrel, arch
        let mut parts = stem.rsplitn(4, '-');
        let arch = parts.next().filter(|s| !s.is_empty());
        let pkgrel = parts.next().filter(|s| !s.is_empty());
        let pkgver = parts.next().filter(|s| !s.is_empty());
        let name = parts.next().filter(|s| !s.is_empty());
        match (name, pkgver, pkgrel, arch) {
            (Some(name), Some(pkgver), Some(pkgrel), Some(arch)) => {
                Ok((name, format!("{pkgver}-{pkgrel}"), arch))
            }
            _ => Err(Error::MalformedName(file_name.to_string())),
        }
    }

    /// Create a package from its binary file name alone
    pub fn from_pkg_file_name(file_name: &str) -> Result<Self> {
        let (name, version, arch) = Self::file_name_components(file_name)?;
        let mut package = Package::new(name, version);
        package.package_info = Some(PackageInfo {
            arch: arch.to_string(),
            file_name: file_name.to_string(),
            ..Default::default()
        });
        package.origin = PackageOrigin::PackageFileName;
        Ok(package)
    }

    /// The binary file name for this package
    ///
    /// Uses the recorded file name when present, otherwise derives the
    /// conventional `<name>-<version>-<arch>.pkg.tar.zst`.
    pub fn compute_file_name(&self) -> String {
        if let Some(info) = &self.package_info {
            if !info.file_name.is_empty() {
                return info.file_name.clone();
            }
            return format!("{}-{}-{}.pkg.tar.zst", self.name, self.version, info.arch);
        }
        format!("{}-{}-any.pkg.tar.zst", self.name, self.version)
    }

    /// Whether this package satisfies the given dependency, either through
    /// its own name/version or one of its `provides` entries
    pub fn provides_dependency(&self, dep: &Dependency) -> bool {
        if self.name == dep.name && dep.matches_provider(Some(&self.version)) {
            return true;
        }
        self.provides.iter().any(|provide| {
            provide.name == dep.name && dep.matches_provider(provide.version.as_deref())
        })
    }

    /// Copy contents-derived fields from another instance of the same package
    ///
    /// Applied iff `name`, `version` and the package-info build date all
    /// match; returns whether the merge took place.
    pub fn add_deps_and_provides_from_other_package(&mut self, other: &Package) -> bool {
        if self.name != other.name || self.version != other.version {
            return false;
        }
        let own_build_date = self.package_info.as_ref().and_then(|info| info.build_date);
        let other_build_date = other.package_info.as_ref().and_then(|info| info.build_date);
        if own_build_date != other_build_date {
            return false;
        }
        if other.origin != PackageOrigin::PackageContents {
            return false;
        }
        self.libprovides = other.libprovides.clone();
        self.libdepends = other.libdepends.clone();
        if let Some(source_info) = &other.source_info {
            let own = self.source_info.get_or_insert_with(Default::default);
            if own.make_dependencies.is_empty() {
                own.make_dependencies = source_info.make_dependencies.clone();
            }
            if own.check_dependencies.is_empty() {
                own.check_dependencies = source_info.check_dependencies.clone();
            }
        }
        self.origin = PackageOrigin::PackageContents;
        true
    }

    /// Archive-walk filter accepting `.PKGINFO` and anything that could be a
    /// binary; the well-known metadata side files are skipped.
    pub fn is_pkg_info_file_or_binary(directory: &str, file_name: &str) -> bool {
        if directory.is_empty() {
            return file_name == ".PKGINFO"
                || !matches!(file_name, ".MTREE" | ".BUILDINFO" | ".INSTALL" | ".CHANGELOG");
        }
        true
    }

    /// Record library provides/depends from a file contained in the package
    ///
    /// ELF binaries contribute their SONAME and NEEDED entries, PE binaries
    /// their export/import DLL names. Import libraries (`.dll.a`) are
    /// collected into `dlls_referenced_by_import_libs` for a second pass
    /// which keys them `pe-<cpu>::<dll>` like the PE binaries themselves.
    pub fn add_deps_and_provides_from_contained_file(
        &mut self,
        directory: &str,
        file: &ArchiveFile,
        dlls_referenced_by_import_libs: &mut binary::ImportLibReferences,
    ) {
        binary::add_library_info(self, directory, file, dlls_referenced_by_import_libs);
    }

    /// Record a `dir::<path>` provide for a contained directory
    pub fn add_deps_and_provides_from_contained_directory(&mut self, directory_path: &str) {
        let provide = format!("dir::{directory_path}");
        if !self.libprovides.contains(&provide) {
            self.libprovides.push(provide);
        }
    }

    /// Reconcile DLLs referenced by `.dll.a` import libraries with the
    /// package's own provides; unprovided DLLs become library dependencies.
    ///
    /// `dlls` carries the fully-qualified `pe-<cpu>::<dll>` keys produced by
    /// [`binary::ImportLibReferences::into_keys`]. Comparison is
    /// case-insensitive; a provide differing only in case is reported as an
    /// ambiguity warning but still counts as provided.
    pub fn process_dlls_referenced_by_import_libs(
        &mut self,
        dlls: std::collections::BTreeSet<String>,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        for dll in dlls {
            if self.libprovides.iter().any(|provide| provide == &dll) {
                continue;
            }
            if let Some(close_match) = self
                .libprovides
                .iter()
                .find(|provide| provide.eq_ignore_ascii_case(&dll))
            {
                warnings.push(format!(
                    "{}: import library references \"{}\" but the package provides \"{}\" (case mismatch)",
                    self.name, dll, close_match
                ));
                continue;
            }
            if !self.libdepends.contains(&dll) {
                self.libdepends.push(dll);
            }
        }
        self.libprovides.sort();
        self.libprovides.dedup();
        self.libdepends.sort();
        self.libdepends.dedup();
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_parsing() {
        let dep = Dependency::parse("glibc>=2.34");
        assert_eq!(dep.name, "glibc");
        assert_eq!(dep.version.as_deref(), Some("2.34"));
        assert_eq!(dep.mode, DependencyMode::GreaterEqual);

        let dep = Dependency::parse("zlib");
        assert_eq!(dep.name, "zlib");
        assert_eq!(dep.version, None);
        assert_eq!(dep.mode, DependencyMode::Any);

        let dep = Dependency::parse("python: for scripts");
        assert_eq!(dep.name, "python");
    }

    #[test]
    fn test_dependency_display() {
        assert_eq!("glibc>=2.34", Dependency::parse("glibc>=2.34").to_string());
        assert_eq!("zlib", Dependency::parse("zlib").to_string());
        assert_eq!("foo=1.0-1", Dependency::parse("foo=1.0-1").to_string());
    }

    #[test]
    fn test_dependency_matching() {
        let dep = Dependency::parse("boost>=1.73");
        assert!(dep.matches_provider(Some("1.73.0-1")));
        assert!(!dep.matches_provider(Some("1.72.0-1")));
        assert!(!dep.matches_provider(None));
        assert!(Dependency::parse("boost").matches_provider(None));
    }

    #[test]
    fn test_file_name_components() {
        let (name, version, arch) =
            Package::file_name_components("cmake-3.8.2-1-x86_64.pkg.tar.xz").unwrap();
        assert_eq!(name, "cmake");
        assert_eq!(version, "3.8.2-1");
        assert_eq!(arch, "x86_64");

        let (name, version, arch) =
            Package::file_name_components("mingw-w64-harfbuzz-1.4.2-1-any.pkg.tar.xz").unwrap();
        assert_eq!(name, "mingw-w64-harfbuzz");
        assert_eq!(version, "1.4.2-1");
        assert_eq!(arch, "any");

        let (_, version, _) =
            Package::file_name_components("zlib-1:1.2.11-4-x86_64.pkg.tar.xz").unwrap();
        assert_eq!(version, "1:1.2.11-4");

        assert!(matches!(
            Package::file_name_components("junk.pkg.tar.zst"),
            Err(Error::MalformedName(_))
        ));
        assert!(Package::file_name_components("no-pkg-suffix").is_err());
    }

    #[test]
    fn test_file_name_round_trip() {
        let package = Package::from_pkg_file_name("boost-1.73.0-1-x86_64.pkg.tar.zst").unwrap();
        assert_eq!(package.name, "boost");
        assert_eq!(package.version, "1.73.0-1");
        assert_eq!(package.origin, PackageOrigin::PackageFileName);
        let file_name = package.compute_file_name();
        let reparsed = Package::from_pkg_file_name(&file_name).unwrap();
        assert_eq!(package, reparsed);
    }

    #[test]
    fn test_merge_requires_matching_identity() {
        let mut old = Package::new("boost", "1.73.0-1");
        old.package_info = Some(PackageInfo::default());
        let mut parsed = Package::new("boost", "1.73.0-1");
        parsed.package_info = Some(PackageInfo::default());
        parsed.libprovides = vec!["elf-x86_64::libboost_regex.so.1.73.0".to_string()];
        parsed.origin = PackageOrigin::PackageContents;

        assert!(old.add_deps_and_provides_from_other_package(&parsed));
        assert_eq!(old.libprovides, parsed.libprovides);
        assert_eq!(old.origin, PackageOrigin::PackageContents);

        let mut other_version = Package::new("boost", "1.74.0-1");
        other_version.origin = PackageOrigin::PackageContents;
        assert!(!old.add_deps_and_provides_from_other_package(&other_version));
    }

    #[test]
    fn test_import_lib_reconciliation() {
        use goblin::pe::header::COFF_MACHINE_X86;

        // the package provides its own DLL (as the PE branch records it) and
        // ships an import library referencing that DLL plus a foreign one
        let mut package = Package::new("mingw-w64-harfbuzz", "1.4.2-1");
        package.libprovides = vec!["pe-i386::libharfbuzz-0.dll".to_string()];
        let import_lib = ArchiveFile {
            name: "libharfbuzz.dll.a".to_string(),
            content: binary::test_import_library(
                COFF_MACHINE_X86,
                &["libharfbuzz-0.dll", "libgcc_s_sjlj-1.dll"],
            ),
        };
        let mut referenced = binary::ImportLibReferences::default();
        package.add_deps_and_provides_from_contained_file(
            "usr/i686-w64-mingw32/lib",
            &import_lib,
            &mut referenced,
        );

        let warnings = package.process_dlls_referenced_by_import_libs(referenced.into_keys());
        assert!(warnings.is_empty());
        // the own DLL is provided, only the foreign one becomes a dependency
        assert_eq!(package.libdepends, vec!["pe-i386::libgcc_s_sjlj-1.dll"]);
    }

    #[test]
    fn test_import_lib_case_mismatch_warns() {
        let mut package = Package::new("mingw-w64-foo", "1-1");
        package.libprovides = vec!["pe-i386::LibFoo.dll".to_string()];
        let mut referenced = std::collections::BTreeSet::new();
        referenced.insert("pe-i386::libfoo.dll".to_string());

        let warnings = package.process_dlls_referenced_by_import_libs(referenced);
        assert_eq!(warnings.len(), 1);
        assert!(package.libdepends.is_empty());
    }
}
