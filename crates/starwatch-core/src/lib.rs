//! Core domain model for the starwatch trending pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "starwatch-core";

/// Owner/name pair parsed from a `"owner/name"` repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    /// Splits a full repository name on the first `/`.
    ///
    /// Returns `None` when the separator is missing or either segment is
    /// empty; callers treat that as a malformed identifier and skip the
    /// lookup entirely.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// One row of the upstream ranking handoff: a repository and its star-gain
/// count over the trailing window.
///
/// Positions in the ranked sequence are the join key for enrichment results;
/// duplicate identifiers are kept and enriched independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedRepo {
    pub repo_name: String,
    pub star_count: u64,
}

/// Repository metadata as returned by the metadata service.
///
/// Both fields are fetched together and fail together; an attempted lookup
/// that failed (or was never issued) is represented by [`RepoMetadata::absent`].
/// Either field may still individually be null when the upstream service
/// omits it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMetadata {
    pub created_at: Option<String>,
    pub stargazer_count: Option<u64>,
}

impl RepoMetadata {
    /// The absent sentinel: lookup failed or was not attempted.
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn is_absent(&self) -> bool {
        self.created_at.is_none() && self.stargazer_count.is_none()
    }
}

/// A ranked repository carrying its enrichment fields.
///
/// Created from a [`RankedRepo`] with every enrichment field unset; the
/// metadata pass fills `created_at`/`current_star_count` jointly and the
/// summary pass fills `ai_summary` independently. Each pass produces a new
/// collection rather than mutating its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRepo {
    pub repo_name: String,
    pub star_count: u64,
    pub created_at: Option<String>,
    pub current_star_count: Option<u64>,
    pub ai_summary: Option<String>,
}

impl EnrichedRepo {
    pub fn from_ranked(ranked: RankedRepo) -> Self {
        Self {
            repo_name: ranked.repo_name,
            star_count: ranked.star_count,
            created_at: None,
            current_star_count: None,
            ai_summary: None,
        }
    }

    pub fn with_metadata(mut self, metadata: RepoMetadata) -> Self {
        self.created_at = metadata.created_at;
        self.current_star_count = metadata.stargazer_count;
        self
    }

    /// True when the jointly-fetched metadata pair is present.
    pub fn has_metadata(&self) -> bool {
        self.created_at.is_some() && self.current_star_count.is_some()
    }
}

/// Normalized output record; the column set and nullability are fixed for
/// downstream compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub repo_name: String,
    pub star_count: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub current_star_count: Option<u64>,
    pub ai_summary: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_splits_on_first_separator() {
        let id = RepoId::parse("rust-lang/rust").unwrap();
        assert_eq!(id.owner, "rust-lang");
        assert_eq!(id.name, "rust");

        let nested = RepoId::parse("owner/name/with/slashes").unwrap();
        assert_eq!(nested.owner, "owner");
        assert_eq!(nested.name, "name/with/slashes");
    }

    #[test]
    fn repo_id_rejects_malformed_identifiers() {
        assert!(RepoId::parse("no-slash-name").is_none());
        assert!(RepoId::parse("/leading").is_none());
        assert!(RepoId::parse("trailing/").is_none());
        assert!(RepoId::parse("").is_none());
    }

    #[test]
    fn repo_id_display_round_trips() {
        let id = RepoId::parse("a/b").unwrap();
        assert_eq!(id.to_string(), "a/b");
    }

    #[test]
    fn absent_metadata_is_jointly_absent() {
        let metadata = RepoMetadata::absent();
        assert!(metadata.is_absent());

        let enriched = EnrichedRepo::from_ranked(RankedRepo {
            repo_name: "a/b".into(),
            star_count: 50,
        })
        .with_metadata(metadata);
        assert!(!enriched.has_metadata());
        assert!(enriched.created_at.is_none());
        assert!(enriched.current_star_count.is_none());
    }

    #[test]
    fn metadata_pair_fills_jointly() {
        let enriched = EnrichedRepo::from_ranked(RankedRepo {
            repo_name: "a/b".into(),
            star_count: 50,
        })
        .with_metadata(RepoMetadata {
            created_at: Some("2020-01-01T00:00:00Z".into()),
            stargazer_count: Some(500),
        });
        assert!(enriched.has_metadata());
        assert!(enriched.ai_summary.is_none());
    }

    #[test]
    fn ranked_repo_deserializes_from_warehouse_handoff() {
        let ranked: RankedRepo =
            serde_json::from_str(r#"{"repo_name": "a/b", "star_count": 42}"#).unwrap();
        assert_eq!(ranked.repo_name, "a/b");
        assert_eq!(ranked.star_count, 42);
    }
}
