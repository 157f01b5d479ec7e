//! Package version handling
//!
//! Package versions are usually semver, but packages loaded from a git
//! checkout may carry a commit SHA instead.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A parsed package version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackageVersion {
    /// Semantic version (e.g., "1.2.3")
    Semver(Version),
    /// Opaque revision, such as a git commit SHA
    Revision(String),
}

impl PackageVersion {
    /// Parse a version string, stripping a leading 'v' if present.
    ///
    /// Anything that isn't valid semver is kept as an opaque revision.
    pub fn parse(version_str: &str) -> Self {
        let trimmed = version_str.trim();
        let candidate = trimmed.strip_prefix('v').unwrap_or(trimmed);
        match Version::parse(candidate) {
            Ok(version) => PackageVersion::Semver(version),
            Err(_) => PackageVersion::Revision(trimmed.to_string()),
        }
    }

    /// Parse a version string that must be semver
    pub fn parse_semver(version_str: &str) -> Result<Self, semver::Error> {
        let candidate = version_str.trim().strip_prefix('v').unwrap_or(version_str.trim());
        Ok(PackageVersion::Semver(Version::parse(candidate)?))
    }

    pub fn is_semver(&self) -> bool {
        matches!(self, PackageVersion::Semver(_))
    }

    /// Next patch version. Revisions are returned unchanged.
    pub fn bump_patch(&self) -> Self {
        match self {
            PackageVersion::Semver(v) => {
                PackageVersion::Semver(Version::new(v.major, v.minor, v.patch + 1))
            }
            PackageVersion::Revision(_) => self.clone(),
        }
    }
}

impl Default for PackageVersion {
    fn default() -> Self {
        PackageVersion::Semver(Version::new(0, 0, 0))
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageVersion::Semver(v) => write!(f, "{}", v),
            PackageVersion::Revision(r) => write!(f, "{}", r),
        }
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    // Semver sorts after revisions; revisions compare lexically.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PackageVersion::Semver(a), PackageVersion::Semver(b)) => a.cmp(b),
            (PackageVersion::Revision(a), PackageVersion::Revision(b)) => a.cmp(b),
            (PackageVersion::Semver(_), PackageVersion::Revision(_)) => Ordering::Greater,
            (PackageVersion::Revision(_), PackageVersion::Semver(_)) => Ordering::Less,
        }
    }
}
