// src/version/mod.rs

//! Version handling and comparison for pacman-style package versions
//!
//! Versions follow the `[epoch:]pkgver[-pkgrel]` format and are compared with
//! the same segment-wise algorithm pacman's `vercmp` uses: runs of digits
//! compare numerically, runs of letters compare lexically, and a numeric
//! segment is always considered newer than an alphabetic one.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// A parsed package version with epoch, pkgver and pkgrel components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PkgVersion {
    pub epoch: u64,
    pub version: String,
    pub release: Option<String>,
}

impl PkgVersion {
    /// Parse a version string
    ///
    /// Format: [epoch:]pkgver[-pkgrel]
    /// Examples:
    /// - "1.2.3" → epoch=0, version="1.2.3", release=None
    /// - "2:1.2.3" → epoch=2, version="1.2.3", release=None
    /// - "1.2.3-4" → epoch=0, version="1.2.3", release=Some("4")
    pub fn parse(s: &str) -> Result<Self> {
        let (epoch_str, rest) = match s.find(':') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => ("0", s),
        };

        let epoch = if epoch_str.is_empty() {
            0
        } else {
            epoch_str
                .parse::<u64>()
                .map_err(|e| Error::Parse(format!("Invalid epoch in version '{s}': {e}")))?
        };

        // The pkgrel is the part after the *last* dash so versions like
        // "2.7.18-2" and "1.0-rc1-1" both split correctly.
        let (version, release) = match rest.rfind('-') {
            Some(pos) => (rest[..pos].to_string(), Some(rest[pos + 1..].to_string())),
            None => (rest.to_string(), None),
        };

        if version.is_empty() {
            return Err(Error::Parse(format!("Empty version component in '{s}'")));
        }

        Ok(Self {
            epoch,
            version,
            release,
        })
    }

    /// Compare two versions using pacman semantics
    pub fn compare(&self, other: &PkgVersion) -> Ordering {
        match self.epoch.cmp(&other.epoch) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match segment_compare(&self.version, &other.version) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // A missing pkgrel matches any pkgrel (e.g. dependency constraints
        // like ">=1.2" against "1.2-3").
        match (&self.release, &other.release) {
            (Some(a), Some(b)) => segment_compare(a, b),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for PkgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.version)?;
        if let Some(ref release) = self.release {
            write!(f, "-{release}")?;
        }
        Ok(())
    }
}

impl Ord for PkgVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for PkgVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two full version strings ("[epoch:]pkgver[-pkgrel]")
///
/// Unparsable versions fall back to plain string comparison so a single bad
/// version in a repository cannot make comparisons panic.
pub fn pkg_vercmp(a: &str, b: &str) -> Ordering {
    match (PkgVersion::parse(a), PkgVersion::parse(b)) {
        (Ok(va), Ok(vb)) => va.compare(&vb),
        _ => a.cmp(b),
    }
}

/// Segment-wise comparison of a version component (pkgver or pkgrel)
fn segment_compare(a: &str, b: &str) -> Ordering {
    let one = a.as_bytes();
    let two = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < one.len() || j < two.len() {
        // skip separators
        while i < one.len() && !one[i].is_ascii_alphanumeric() {
            i += 1;
        }
        while j < two.len() && !two[j].is_ascii_alphanumeric() {
            j += 1;
        }
        match (i < one.len(), j < two.len()) {
            (false, false) => return Ordering::Equal,
            // The string that still has an alphabetic segment left is older
            // ("1.0rc1" < "1.0"); a remaining numeric segment is newer.
            (false, true) => {
                return if two[j].is_ascii_alphabetic() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (true, false) => {
                return if one[i].is_ascii_alphabetic() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (true, true) => {}
        }

        let one_is_digit = one[i].is_ascii_digit();
        let two_is_digit = two[j].is_ascii_digit();

        let seg_one = take_segment(one, &mut i, one_is_digit);
        let seg_two = take_segment(two, &mut j, two_is_digit);

        if one_is_digit != two_is_digit {
            // numeric segments always win over alphabetic ones
            return if one_is_digit {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if one_is_digit {
            compare_digits(seg_one, seg_two)
        } else {
            seg_one.cmp(seg_two)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

fn take_segment<'a>(s: &'a [u8], pos: &mut usize, digits: bool) -> &'a [u8] {
    let start = *pos;
    while *pos < s.len() && s[*pos].is_ascii_alphanumeric() && s[*pos].is_ascii_digit() == digits {
        *pos += 1;
    }
    &s[start..*pos]
}

fn compare_digits(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.cmp(b),
        ord => ord,
    }
}

fn strip_leading_zeros(s: &[u8]) -> &[u8] {
    let mut start = 0;
    while start + 1 < s.len() && s[start] == b'0' {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn newer(a: &str, b: &str) {
        assert_eq!(
            Ordering::Greater,
            pkg_vercmp(a, b),
            "{a} should be newer than {b}"
        );
        assert_eq!(
            Ordering::Less,
            pkg_vercmp(b, a),
            "{b} should be older than {a}"
        );
    }

    #[test]
    fn test_parse() {
        let v = PkgVersion::parse("2:1.4.2-1").unwrap();
        assert_eq!(v.epoch, 2);
        assert_eq!(v.version, "1.4.2");
        assert_eq!(v.release.as_deref(), Some("1"));

        let v = PkgVersion::parse("1.73.0").unwrap();
        assert_eq!(v.epoch, 0);
        assert_eq!(v.release, None);

        assert!(PkgVersion::parse("x:1.0").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["1.2.3", "2:1.2.3", "1.2.3-4", "1:2.3.4-5"] {
            assert_eq!(s, PkgVersion::parse(s).unwrap().to_string());
        }
    }

    #[test]
    fn test_numeric_comparison() {
        newer("1.73.0-1", "1.72.0-1");
        newer("1.10", "1.9");
        newer("1.0-2", "1.0-1");
        assert_eq!(Ordering::Equal, pkg_vercmp("1.0", "1.0"));
        assert_eq!(Ordering::Equal, pkg_vercmp("1.0-1", "1.0"));
    }

    #[test]
    fn test_epoch_dominates() {
        newer("1:0.9", "2.0");
        newer("2:1.0", "1:9.9");
    }

    #[test]
    fn test_alpha_segments() {
        newer("1.0", "1.0rc1");
        newer("1.0rc2", "1.0rc1");
        newer("1.0.1", "1.0a");
        newer("1.0b", "1.0a");
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(Ordering::Equal, pkg_vercmp("1.01", "1.1"));
        newer("1.010", "1.9");
    }
}
