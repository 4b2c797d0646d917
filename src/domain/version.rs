//! Release versions.
//!
//! A patch release only ever bumps `patch`; `major.minor` identifies the
//! release line (and therefore the release branch) being patched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `major.minor.patch` release version, ordered field by field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReleaseVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

/// Errors parsing a version string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("Invalid version '{input}': {reason}")]
    Invalid { input: String, reason: String },

    #[error("Version '{0}' carries pre-release or build metadata; patch releases must be plain X.Y.Z")]
    NotPlain(String),
}

impl ReleaseVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The next patch release on the same line
    pub fn next_patch(&self) -> Self {
        Self::new(self.major, self.minor, self.patch + 1)
    }

    /// The previous patch release on the same line, if any
    pub fn previous_patch(&self) -> Option<Self> {
        self.patch
            .checked_sub(1)
            .map(|patch| Self::new(self.major, self.minor, patch))
    }

    /// Release line key ("X.Y")
    pub fn line(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// Whether both versions belong to the same `major.minor` line
    pub fn same_line(&self, other: &Self) -> bool {
        self.major == other.major && self.minor == other.minor
    }

    /// Git tag name for this version ("vX.Y.Z")
    pub fn tag_name(&self) -> String {
        format!("v{}", self)
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ReleaseVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let parsed = semver::Version::parse(raw).map_err(|e| VersionParseError::Invalid {
            input: s.to_string(),
            reason: e.to_string(),
        })?;

        if !parsed.pre.is_empty() || !parsed.build.is_empty() {
            return Err(VersionParseError::NotPlain(s.to_string()));
        }

        Ok(Self::new(parsed.major, parsed.minor, parsed.patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_and_without_prefix() {
        assert_eq!("0.19.3".parse::<ReleaseVersion>().unwrap(), ReleaseVersion::new(0, 19, 3));
        assert_eq!("v1.2.10".parse::<ReleaseVersion>().unwrap(), ReleaseVersion::new(1, 2, 10));
    }

    #[test]
    fn test_parse_rejects_prerelease() {
        let err = "1.2.3-rc.1".parse::<ReleaseVersion>().unwrap_err();
        assert!(matches!(err, VersionParseError::NotPlain(_)));
        assert!("1.2".parse::<ReleaseVersion>().is_err());
    }

    #[test]
    fn test_ordering_is_total() {
        let a = ReleaseVersion::new(0, 19, 9);
        let b = ReleaseVersion::new(0, 19, 10);
        let c = ReleaseVersion::new(0, 20, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_tag_and_line() {
        let v = ReleaseVersion::new(0, 19, 4);
        assert_eq!(v.tag_name(), "v0.19.4");
        assert_eq!(v.line(), "0.19");
        assert_eq!(v.previous_patch(), Some(ReleaseVersion::new(0, 19, 3)));
        assert_eq!(ReleaseVersion::new(1, 0, 0).previous_patch(), None);
    }
}
