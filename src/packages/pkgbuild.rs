// src/packages/pkgbuild.rs

//! PKGBUILD metadata extraction
//!
//! PKGBUILDs are Bash scripts; only the declarative variables needed for
//! build planning are extracted (no shell evaluation). Split packages
//! (`pkgname=(...)`) are supported; the `pkgbase` names the build as a whole.

use crate::packages::Dependency;
use regex::Regex;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PkgbuildError {
    #[error("Missing required variable: {0}")]
    MissingVariable(String),

    #[error("Unable to read {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Variables extracted from a PKGBUILD
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PkgbuildInfo {
    /// The build's base name (equals the sole pkgname for non-split packages)
    pub pkgbase: String,
    /// Output package names; more than one for split packages
    pub pkgnames: Vec<String>,
    pub pkgver: String,
    pub pkgrel: String,
    pub epoch: Option<String>,
    pub archs: Vec<String>,
    pub depends: Vec<Dependency>,
    pub makedepends: Vec<Dependency>,
    pub checkdepends: Vec<Dependency>,
    pub provides: Vec<Dependency>,
}

impl PkgbuildInfo {
    /// Read and parse the PKGBUILD at `path`
    pub fn from_file(path: &Path) -> Result<Self, PkgbuildError> {
        let content = std::fs::read_to_string(path).map_err(|e| PkgbuildError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse PKGBUILD content
    pub fn parse(content: &str) -> Result<Self, PkgbuildError> {
        let pkgnames = match extract_array(content, "pkgname") {
            Some(names) if !names.is_empty() => names,
            _ => vec![extract_scalar(content, "pkgname")
                .ok_or_else(|| PkgbuildError::MissingVariable("pkgname".to_string()))?],
        };
        let pkgbase = extract_scalar(content, "pkgbase").unwrap_or_else(|| pkgnames[0].clone());
        let pkgver = extract_scalar(content, "pkgver")
            .ok_or_else(|| PkgbuildError::MissingVariable("pkgver".to_string()))?;
        let pkgrel = extract_scalar(content, "pkgrel").unwrap_or_else(|| "1".to_string());
        let epoch = extract_scalar(content, "epoch").filter(|value| !value.is_empty());

        let as_deps = |name: &str| -> Vec<Dependency> {
            extract_array(content, name)
                .unwrap_or_default()
                .iter()
                .map(|entry| Dependency::parse(entry))
                .collect()
        };

        Ok(Self {
            pkgbase,
            pkgnames,
            pkgver,
            pkgrel,
            epoch,
            archs: extract_array(content, "arch").unwrap_or_default(),
            depends: as_deps("depends"),
            makedepends: as_deps("makedepends"),
            checkdepends: as_deps("checkdepends"),
            provides: as_deps("provides"),
        })
    }

    /// The full version in `[epoch:]pkgver-pkgrel` form
    pub fn version(&self) -> String {
        match &self.epoch {
            Some(epoch) => format!("{epoch}:{}-{}", self.pkgver, self.pkgrel),
            None => format!("{}-{}", self.pkgver, self.pkgrel),
        }
    }

    /// Whether any output package of this build has the given name
    pub fn produces(&self, package_name: &str) -> bool {
        self.pkgnames.iter().any(|name| name == package_name)
    }
}

/// Extract a scalar variable assignment like `pkgver=8.5` or `url="..."`
fn extract_scalar(content: &str, name: &str) -> Option<String> {
    let pattern = Regex::new(&format!(r#"(?m)^\s*{name}=([^\(\n][^\n]*)$"#)).ok()?;
    let captures = pattern.captures(content)?;
    Some(strip_quotes(captures.get(1)?.as_str().trim()).to_string())
}

/// Extract an array assignment like `depends=('ncurses' 'zlib')`
///
/// Arrays may span multiple lines; entries are whitespace separated and may
/// be single- or double-quoted.
fn extract_array(content: &str, name: &str) -> Option<Vec<String>> {
    let pattern = Regex::new(&format!(r"(?ms)^\s*{name}=\((.*?)\)")).ok()?;
    let captures = pattern.captures(content)?;
    let body = captures.get(1)?.as_str();
    Some(
        body.split_whitespace()
            .map(|item| strip_quotes(item).to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    )
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches(|c| c == '\'' || c == '"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::DependencyMode;

    const BOOST: &str = r#"
pkgbase=boost
pkgname=('boost' 'boost-libs')
pkgver=1.73.0
pkgrel=1
arch=('x86_64')
url='https://www.boost.org/'
license=('custom')
depends=('zstd' 'bzip2' 'zlib')
makedepends=('icu' 'python' 'python2' 'mingw-w64-gcc')
checkdepends=('python-numpy')

build() {
    ./b2 stage
}
"#;

    #[test]
    fn test_split_package() {
        let info = PkgbuildInfo::parse(BOOST).unwrap();
        assert_eq!(info.pkgbase, "boost");
        assert_eq!(info.pkgnames, vec!["boost", "boost-libs"]);
        assert_eq!(info.pkgver, "1.73.0");
        assert_eq!(info.pkgrel, "1");
        assert_eq!(info.version(), "1.73.0-1");
        assert_eq!(info.archs, vec!["x86_64"]);
        assert_eq!(info.depends.len(), 3);
        assert_eq!(info.makedepends.len(), 4);
        assert!(info.produces("boost-libs"));
        assert!(!info.produces("boost-docs"));
    }

    #[test]
    fn test_plain_package() {
        let content = "pkgname=zstd\npkgver=1.4.5\npkgrel=1\narch=('x86_64')\n";
        let info = PkgbuildInfo::parse(content).unwrap();
        assert_eq!(info.pkgbase, "zstd");
        assert_eq!(info.pkgnames, vec!["zstd"]);
        assert_eq!(info.version(), "1.4.5-1");
    }

    #[test]
    fn test_epoch_and_versioned_depends() {
        let content = "pkgname=zlib\npkgver=1.2.11\npkgrel=4\nepoch=1\ndepends=('glibc>=2.34')\n";
        let info = PkgbuildInfo::parse(content).unwrap();
        assert_eq!(info.version(), "1:1.2.11-4");
        assert_eq!(info.depends[0].mode, DependencyMode::GreaterEqual);
    }

    #[test]
    fn test_missing_pkgver_fails() {
        assert!(matches!(
            PkgbuildInfo::parse("pkgname=broken\n"),
            Err(PkgbuildError::MissingVariable(_))
        ));
    }

    #[test]
    fn test_multiline_array() {
        let content = "pkgname=multi\npkgver=1\ndepends=('a'\n    'b'\n    'c')\n";
        let info = PkgbuildInfo::parse(content).unwrap();
        assert_eq!(info.depends.len(), 3);
    }
}
