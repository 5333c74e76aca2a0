//! Metadata and time filtering for search candidates.

use chrono::{DateTime, Utc};

use crate::types::{Metadata, Node};

/// A candidate filter applied before distance refinement.
///
/// All conditions are conjunctive: every metadata entry must be present and
/// equal on the node, and the node's timestamp must fall inside the
/// (inclusive) time bounds. An empty filter matches every node.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Expected metadata entries. Scalar values compare by equality; array
    /// values compare element-wise.
    pub metadata: Option<Metadata>,
    /// Earliest admissible timestamp, inclusive.
    pub ts_from: Option<DateTime<Utc>>,
    /// Latest admissible timestamp, inclusive.
    pub ts_to: Option<DateTime<Utc>>,
}

impl SearchFilter {
    /// An empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a metadata entry to equal `value`.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    /// Require the node's timestamp to be at or after `ts`.
    pub fn since(mut self, ts: DateTime<Utc>) -> Self {
        self.ts_from = Some(ts);
        self
    }

    /// Require the node's timestamp to be at or before `ts`.
    pub fn until(mut self, ts: DateTime<Utc>) -> Self {
        self.ts_to = Some(ts);
        self
    }

    /// Whether this filter has no conditions.
    pub fn is_empty(&self) -> bool {
        self.metadata.as_ref().is_none_or(|m| m.is_empty())
            && self.ts_from.is_none()
            && self.ts_to.is_none()
    }

    /// Whether `node` satisfies every condition.
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(expected) = &self.metadata {
            match &node.metadata {
                Some(meta) => {
                    for (key, value) in expected {
                        if meta.get(key) != Some(value) {
                            return false;
                        }
                    }
                }
                None if !expected.is_empty() => return false,
                None => {}
            }
        }

        if let Some(from) = self.ts_from {
            if node.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.ts_to {
            if node.timestamp > to {
                return false;
            }
        }

        true
    }
}
