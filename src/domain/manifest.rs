//! The release manifest aggregate.
//!
//! Built during the preparation phase, frozen once tagging begins.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::change::ChangeRecord;
use super::version::ReleaseVersion;

/// Attempted mutation of a frozen manifest
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Release manifest for {version} is frozen; tagging has begun")]
pub struct ManifestFrozen {
    pub version: ReleaseVersion,
}

/// Everything that describes one release attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    /// Version being released
    pub version: ReleaseVersion,

    /// Last release on the same line (the changelog baseline)
    pub previous_version: ReleaseVersion,

    /// Branch tracking the release line ("release-0.19")
    pub release_branch: String,

    /// Commits requested for cherry-picking, in application order
    #[serde(default)]
    pub cherry_picks: Vec<String>,

    /// Collected changes, in cherry-pick order
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,

    pub release_date: NaiveDate,

    /// Human-authored release description, supplied externally
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    frozen: bool,
}

impl ReleaseManifest {
    pub fn new(
        version: ReleaseVersion,
        previous_version: ReleaseVersion,
        release_branch: impl Into<String>,
        release_date: NaiveDate,
    ) -> Self {
        Self {
            version,
            previous_version,
            release_branch: release_branch.into(),
            cherry_picks: Vec::new(),
            changes: Vec::new(),
            release_date,
            description: None,
            frozen: false,
        }
    }

    pub fn with_cherry_picks(mut self, commits: Vec<String>) -> Self {
        self.cherry_picks = commits;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Branch the release is prepared on before it is pushed
    pub fn prepare_branch(&self) -> String {
        format!("prepare-{}", self.version.tag_name())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freeze the manifest; idempotent
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Replace the collected changes
    pub fn set_changes(&mut self, changes: Vec<ChangeRecord>) -> Result<(), ManifestFrozen> {
        self.ensure_mutable()?;
        self.changes = changes;
        Ok(())
    }

    pub fn set_description(&mut self, description: Option<String>) -> Result<(), ManifestFrozen> {
        self.ensure_mutable()?;
        self.description = description;
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), ManifestFrozen> {
        if self.frozen {
            return Err(ManifestFrozen {
                version: self.version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn manifest() -> ReleaseManifest {
        ReleaseManifest::new(
            ReleaseVersion::new(0, 19, 4),
            ReleaseVersion::new(0, 19, 3),
            "release-0.19",
            NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        )
    }

    #[test]
    fn test_frozen_manifest_rejects_mutation() {
        let mut m = manifest();
        let change = ChangeRecord::new("abc", "fix: thing (#1)", "dev", Utc::now());
        assert!(m.set_changes(vec![change.clone()]).is_ok());

        m.freeze();
        let err = m.set_changes(vec![]).unwrap_err();
        assert_eq!(err.version, ReleaseVersion::new(0, 19, 4));
        assert!(m.set_description(Some("late".to_string())).is_err());
        assert_eq!(m.changes, vec![change]);
    }

    #[test]
    fn test_prepare_branch_name() {
        assert_eq!(manifest().prepare_branch(), "prepare-v0.19.4");
    }

    #[test]
    fn test_frozen_flag_survives_serialization() {
        let mut m = manifest();
        m.freeze();
        let json = serde_json::to_string(&m).unwrap();
        let parsed: ReleaseManifest = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_frozen());
    }
}
