//! Relational scene plans
//!
//! A plan describes the bipartite graph G(s) = (A, R, E): assets, relation
//! nodes drawn from a closed vocabulary, and edges from each relation to the
//! assets it governs. The plan stays model-authored text; this module only
//! cleans it and answers vocabulary queries about it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static REASONING_TRACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>\s*").expect("static pattern compiles"));

/// Remove delimited reasoning segments from a model reply
#[must_use]
pub fn strip_reasoning(raw: &str) -> String {
    REASONING_TRACE.replace_all(raw, "").trim().to_string()
}

/// Relation vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    /// Closeness of two objects
    Proximity,
    /// One object oriented at another
    Direction,
    /// Objects share an axis
    Alignment,
    /// Mirrored placement
    Symmetry,
    /// Partial covering, creating depth
    Overlap,
    /// Objects run parallel
    Parallelism,
    /// Objects meet at right angles
    Perpendicularity,
    /// Ordered by size or volume
    Hierarchy,
    /// Arranged around a point
    Rotation,
    /// Repeating pattern
    Repetition,
    /// Size adjusted for depth or focus
    Scaling,
}

impl RelationType {
    /// Every relation type, in vocabulary order
    pub const ALL: [RelationType; 11] = [
        RelationType::Proximity,
        RelationType::Direction,
        RelationType::Alignment,
        RelationType::Symmetry,
        RelationType::Overlap,
        RelationType::Parallelism,
        RelationType::Perpendicularity,
        RelationType::Hierarchy,
        RelationType::Rotation,
        RelationType::Repetition,
        RelationType::Scaling,
    ];

    /// Lowercase name as it appears in prompts
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RelationType::Proximity => "proximity",
            RelationType::Direction => "direction",
            RelationType::Alignment => "alignment",
            RelationType::Symmetry => "symmetry",
            RelationType::Overlap => "overlap",
            RelationType::Parallelism => "parallelism",
            RelationType::Perpendicularity => "perpendicularity",
            RelationType::Hierarchy => "hierarchy",
            RelationType::Rotation => "rotation",
            RelationType::Repetition => "repetition",
            RelationType::Scaling => "scaling",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Plan text produced by the planner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenePlan(String);

impl ScenePlan {
    /// Wrap already cleaned plan text
    #[inline]
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Build from a raw model reply, dropping reasoning segments
    #[must_use]
    pub fn from_reply(raw: &str) -> Self {
        Self(strip_reasoning(raw))
    }

    #[inline]
    #[must_use]
    pub fn text(&self) -> &str {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn into_text(self) -> String {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Relation types named anywhere in the plan
    #[must_use]
    pub fn relations(&self) -> Vec<RelationType> {
        let lower = self.0.to_lowercase();
        RelationType::ALL
            .into_iter()
            .filter(|r| lower.contains(r.name()))
            .collect()
    }

    /// Whether the plan mentions an asset (case-insensitive)
    #[must_use]
    pub fn mentions(&self, asset: &str) -> bool {
        self.0.to_lowercase().contains(&asset.to_lowercase())
    }
}
