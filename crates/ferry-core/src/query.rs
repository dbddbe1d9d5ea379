//! Broadcast query predicates and replica result merging.
//!
//! A broadcast query is fanned out to every replica of the document index.
//! Replication means the same logical document may be indexed on several
//! replicas, so the per-replica result sets must be merged and de-duplicated
//! by self-link before use. The merged result is a set, not a sequence.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::TaskStage;
use crate::error::FerryError;

/// One field-equality term. `path` is dot-separated into the document body
/// (e.g. `task_state.stage`); a clause against an array field matches when
/// any element equals the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldClause {
    pub path: String,
    pub value: String,
}

/// A query predicate evaluated locally by every replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Document kind filter (always present).
    pub kind: String,

    /// Terms that must all match.
    #[serde(default)]
    pub field_clauses: Vec<FieldClause>,

    /// Terms that must not match.
    #[serde(default)]
    pub exclude_clauses: Vec<FieldClause>,

    /// Return document bodies inline, not just links.
    #[serde(default)]
    pub expand_content: bool,
}

impl QuerySpec {
    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            field_clauses: Vec::new(),
            exclude_clauses: Vec::new(),
            expand_content: false,
        }
    }

    pub fn with_field(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.field_clauses.push(FieldClause {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn without_field(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.exclude_clauses.push(FieldClause {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn expand(mut self) -> Self {
        self.expand_content = true;
        self
    }

    /// Evaluate this predicate against one document.
    pub fn matches(&self, kind: &str, body: &Value) -> bool {
        if kind != self.kind {
            return false;
        }
        if !self.field_clauses.iter().all(|c| clause_matches(c, body)) {
            return false;
        }
        !self.exclude_clauses.iter().any(|c| clause_matches(c, body))
    }
}

fn clause_matches(clause: &FieldClause, body: &Value) -> bool {
    let Some(found) = lookup_path(body, &clause.path) else {
        return false;
    };
    match found {
        Value::Array(items) => items.iter().any(|item| value_equals(item, &clause.value)),
        other => value_equals(other, &clause.value),
    }
}

fn value_equals(value: &Value, term: &str) -> bool {
    match value {
        Value::String(s) => s == term,
        Value::Number(n) => n.to_string() == term,
        Value::Bool(b) => b.to_string() == term,
        _ => false,
    }
}

fn lookup_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// One matching document as reported by a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub self_link: String,

    /// Present when the query requested expanded content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl QueryResult {
    pub fn link_only(self_link: impl Into<String>) -> Self {
        Self {
            self_link: self_link.into(),
            body: None,
        }
    }

    pub fn expanded(self_link: impl Into<String>, body: Value) -> Self {
        Self {
            self_link: self_link.into(),
            body: Some(body),
        }
    }
}

/// Merge per-replica result sets into one logical set.
///
/// De-duplication is by self-link; the merge is idempotent and independent of
/// replica order. When one replica reports a bare link and another the
/// expanded body, the expanded entry wins.
pub fn merge_replica_results(replicas: Vec<Vec<QueryResult>>) -> Vec<QueryResult> {
    let mut merged: BTreeMap<String, QueryResult> = BTreeMap::new();
    for replica in replicas {
        for result in replica {
            match merged.get_mut(&result.self_link) {
                Some(existing) => {
                    if existing.body.is_none() && result.body.is_some() {
                        existing.body = result.body;
                    }
                }
                None => {
                    merged.insert(result.self_link.clone(), result);
                }
            }
        }
    }
    merged.into_values().collect()
}

/// Read `task_state.stage` out of a raw document body.
pub fn extract_task_stage(body: &Value) -> Result<TaskStage, FerryError> {
    let stage = body
        .pointer("/task_state/stage")
        .ok_or_else(|| FerryError::Validation("document has no task_state.stage".to_string()))?;
    serde_json::from_value(stage.clone())
        .map_err(|e| FerryError::Validation(format!("unparseable task stage: {e}")))
}

/// Is the document's task still running (CREATED or STARTED)?
pub fn is_task_running(body: &Value) -> bool {
    matches!(
        extract_task_stage(body),
        Ok(TaskStage::Created | TaskStage::Started)
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(stage: &str) -> Value {
        json!({"task_state": {"stage": stage}, "usage_tags": ["CLOUD", "MGMT"]})
    }

    #[test]
    fn kind_and_field_clauses_filter() {
        let query = QuerySpec::for_kind("ferry/host").with_field("task_state.stage", "STARTED");
        assert!(query.matches("ferry/host", &doc("STARTED")));
        assert!(!query.matches("ferry/host", &doc("FINISHED")));
        assert!(!query.matches("ferry/deployment", &doc("STARTED")));
    }

    #[test]
    fn exclude_clauses_reject_matches() {
        let query = QuerySpec::for_kind("ferry/host")
            .without_field("task_state.stage", "CANCELLED")
            .without_field("task_state.stage", "FAILED");
        assert!(query.matches("ferry/host", &doc("STARTED")));
        assert!(!query.matches("ferry/host", &doc("CANCELLED")));
        assert!(!query.matches("ferry/host", &doc("FAILED")));
    }

    #[test]
    fn array_fields_match_on_any_element() {
        let query = QuerySpec::for_kind("ferry/host").with_field("usage_tags", "CLOUD");
        assert!(query.matches("ferry/host", &doc("STARTED")));

        let query = QuerySpec::for_kind("ferry/host").with_field("usage_tags", "EDGE");
        assert!(!query.matches("ferry/host", &doc("STARTED")));
    }

    #[test]
    fn missing_path_never_matches() {
        let query = QuerySpec::for_kind("ferry/host").with_field("no.such.path", "X");
        assert!(!query.matches("ferry/host", &doc("STARTED")));
    }

    #[test]
    fn merge_deduplicates_by_self_link() {
        let a = QueryResult::link_only("/tasks/a");
        let b = QueryResult::link_only("/tasks/b");

        let merged = merge_replica_results(vec![
            vec![a.clone(), b.clone()],
            vec![b.clone(), a.clone()],
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_is_order_independent_and_idempotent() {
        let a = QueryResult::expanded("/tasks/a", json!({"n": 1}));
        let b = QueryResult::expanded("/tasks/b", json!({"n": 2}));

        let left = merge_replica_results(vec![vec![a.clone(), b.clone()], vec![b.clone()]]);
        let right = merge_replica_results(vec![vec![b.clone()], vec![a.clone(), b.clone()]]);
        assert_eq!(left, right);

        let again = merge_replica_results(vec![left.clone()]);
        assert_eq!(again, left);
    }

    #[test]
    fn merge_prefers_expanded_bodies() {
        let bare = QueryResult::link_only("/tasks/a");
        let full = QueryResult::expanded("/tasks/a", json!({"n": 1}));

        let merged = merge_replica_results(vec![vec![bare], vec![full.clone()]]);
        assert_eq!(merged, vec![full]);
    }

    #[test]
    fn running_predicate_reads_stage() {
        assert!(is_task_running(&doc("CREATED")));
        assert!(is_task_running(&doc("STARTED")));
        assert!(!is_task_running(&doc("FINISHED")));
        assert!(!is_task_running(&json!({"unrelated": true})));
    }
}
