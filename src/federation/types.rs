// SPDX-License-Identifier: Apache-2.0

//! Types for the multi-source fan-out engine.

use serde::{Deserialize, Serialize};

use crate::engine::types::QueryResult;

/// Default name of the synthetic source-identity column.
pub const DEFAULT_SOURCE_COLUMN: &str = "SOURCE_NAME";

/// Declared length of the source-identity column.
pub const SOURCE_COLUMN_LENGTH: u32 = 255;

/// One physical source registered under a logical model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceBinding {
    /// Logical model the binding belongs to
    pub model: String,
    /// Position within the model, stable for one planning episode
    pub ordinal: usize,
    /// Opaque source id; doubles as the pseudo-column literal
    pub source_id: String,
}

impl SourceBinding {
    /// The literal the pseudo-column resolves to for this binding.
    pub fn literal(&self) -> &str {
        &self.source_id
    }
}

/// What a single command does, as far as the merge stage is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Query,
    Insert,
    Update,
    Delete,
    Procedure,
}

impl CommandKind {
    /// Update-class commands report affected-row counts instead of rows
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// What to do when one instance fails while its siblings succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel outstanding instances and propagate the first error
    #[default]
    FailFast,
    /// Merge the successful instances and report failures as warnings
    ContinueOnError,
}

/// Text comparison rule used by the post-merge sort and dedup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collation {
    #[default]
    Binary,
    CaseInsensitive,
}

/// Result metadata for one fan-out instance.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFetchResult {
    /// Source id of the binding
    pub source_id: String,
    /// Number of rows fetched
    pub row_count: u64,
    /// Sum of affected-row counts reported by the source
    pub update_count: u64,
    /// Fetch duration in milliseconds
    pub fetch_time_ms: f64,
    /// How many times the source asked to be retried
    pub retries: u32,
    /// Error message if the instance failed under `ContinueOnError`
    pub error: Option<String>,
}

/// Extended response with per-source metadata.
#[derive(Debug, Clone, Serialize)]
pub struct FederationMetadata {
    /// Per-instance fetch results, in binding order
    pub source_results: Vec<SourceFetchResult>,
    /// Post-merge processing time in milliseconds
    pub merge_time_ms: f64,
    /// Total pipeline time in milliseconds
    pub total_time_ms: f64,
    /// Warnings (e.g., failed instances under `ContinueOnError`)
    pub warnings: Vec<String>,
}

impl FederationMetadata {
    pub fn empty() -> Self {
        Self {
            source_results: Vec::new(),
            merge_time_ms: 0.0,
            total_time_ms: 0.0,
            warnings: Vec::new(),
        }
    }
}

/// A merged result plus the metadata describing how it was produced.
#[derive(Debug, Clone, Serialize)]
pub struct FederatedResult {
    pub result: QueryResult,
    pub metadata: FederationMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_policy_deserializes_snake_case() {
        let policy: FailurePolicy = serde_json::from_str("\"continue_on_error\"").unwrap();
        assert_eq!(policy, FailurePolicy::ContinueOnError);
    }

    #[test]
    fn update_class_commands() {
        assert!(CommandKind::Insert.is_update());
        assert!(CommandKind::Delete.is_update());
        assert!(!CommandKind::Query.is_update());
        assert!(!CommandKind::Procedure.is_update());
    }
}
