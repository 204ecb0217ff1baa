// src/packages/depset.rs

//! Many-to-many index from dependency name to providing/requiring packages

use crate::packages::{Dependency, DependencyMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One version constraint of a dependency name together with the packages it
/// is relevant for
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyDetail {
    pub version: Option<String>,
    pub mode: DependencyMode,
    pub relevant_packages: Vec<String>,
}

/// Index mapping a dependency name to the ordered sequence of version
/// constraints under which packages provide or require it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencySet {
    entries: HashMap<String, Vec<DependencyDetail>>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `package` under the dependency's (name, constraint) pair.
    ///
    /// Insertion is idempotent: an existing detail with the same constraint
    /// is reused and the package is only listed once.
    pub fn add(&mut self, dependency: &Dependency, package: &str) {
        let details = self.entries.entry(dependency.name.clone()).or_default();
        let detail = match details
            .iter_mut()
            .find(|detail| detail.version == dependency.version && detail.mode == dependency.mode)
        {
            Some(existing) => existing,
            None => {
                details.push(DependencyDetail {
                    version: dependency.version.clone(),
                    mode: dependency.mode,
                    relevant_packages: Vec::new(),
                });
                details.last_mut().expect("detail just pushed")
            }
        };
        if !detail.relevant_packages.iter().any(|name| name == package) {
            detail.relevant_packages.push(package.to_string());
        }
    }

    /// Remove all projections of `package` under the dependency name
    pub fn remove(&mut self, name: &str, package: &str) {
        let Some(details) = self.entries.get_mut(name) else {
            return;
        };
        for detail in details.iter_mut() {
            detail.relevant_packages.retain(|entry| entry != package);
        }
        details.retain(|detail| !detail.relevant_packages.is_empty());
        if details.is_empty() {
            self.entries.remove(name);
        }
    }

    /// All packages registered under `name`, across all constraints
    pub fn packages_for(&self, name: &str) -> Vec<&str> {
        let mut packages = Vec::new();
        if let Some(details) = self.entries.get(name) {
            for detail in details {
                for package in &detail.relevant_packages {
                    if !packages.contains(&package.as_str()) {
                        packages.push(package.as_str());
                    }
                }
            }
        }
        packages
    }

    /// Packages whose registered constraint satisfies `dependency`
    ///
    /// Used on a provides index: a registered provide (version, mode) is
    /// interpreted as the provided version and matched against the requested
    /// constraint.
    pub fn matching_packages(&self, dependency: &Dependency) -> Vec<&str> {
        let mut packages = Vec::new();
        if let Some(details) = self.entries.get(&dependency.name) {
            for detail in details {
                if !dependency.matches_provider(detail.version.as_deref()) {
                    continue;
                }
                for package in &detail.relevant_packages {
                    if !packages.contains(&package.as_str()) {
                        packages.push(package.as_str());
                    }
                }
            }
        }
        packages
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<DependencyDetail>)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut set = DependencySet::new();
        let dep = Dependency::parse("libfoo=1.0");
        set.add(&dep, "foo");
        set.add(&dep, "foo");
        set.add(&dep, "foo-git");

        assert_eq!(set.len(), 1);
        assert_eq!(set.packages_for("libfoo"), vec!["foo", "foo-git"]);
    }

    #[test]
    fn test_separate_constraints_are_kept() {
        let mut set = DependencySet::new();
        set.add(&Dependency::parse("libfoo=1.0"), "foo");
        set.add(&Dependency::parse("libfoo=2.0"), "foo2");

        assert_eq!(set.packages_for("libfoo"), vec!["foo", "foo2"]);
        let matching = set.matching_packages(&Dependency::parse("libfoo>=2.0"));
        assert_eq!(matching, vec!["foo2"]);
    }

    #[test]
    fn test_remove_is_per_package() {
        let mut set = DependencySet::new();
        set.add(&Dependency::parse("libfoo"), "foo");
        set.add(&Dependency::parse("libfoo"), "bar");
        set.remove("libfoo", "foo");
        assert_eq!(set.packages_for("libfoo"), vec!["bar"]);
        set.remove("libfoo", "bar");
        assert!(set.is_empty());
    }
}
