//! Group record decoding
//!
//! A group is one hash record: the reserved `count` and `type` fields plus
//! one field per confirmed task.

use serde::Serialize;
use std::collections::HashMap;

/// Field holding the expected result count
pub const FIELD_COUNT: &str = "count";

/// Field holding the group type tag
pub const FIELD_TYPE: &str = "type";

/// Returns true if `name` is one of the reserved group fields
pub fn is_reserved(name: &str) -> bool {
    name == FIELD_COUNT || name == FIELD_TYPE
}

/// One confirmed task of a completed group, as handed to handlers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub group_id: String,
    pub group_type: String,
    pub task_id: String,
    pub result: String,
}

/// A group whose confirmed results reached the expected count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedGroup {
    pub group_id: String,
    pub group_type: String,
    pub expected: u64,
    /// Ordered by task id
    pub results: Vec<TaskResult>,
}

/// What the watcher should do with a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupState {
    /// The key vanished (expired or reaped) between listing and reading
    Missing,
    /// Still waiting for results
    Pending { confirmed: usize, expected: u64 },
    /// Ready to dispatch
    Complete(CompletedGroup),
    /// Reserved fields missing or unparsable; reap without dispatch
    Corrupt { reason: String },
}

/// Classify the raw fields of a group record
pub fn decode(group_id: &str, mut fields: HashMap<String, String>) -> GroupState {
    if fields.is_empty() {
        return GroupState::Missing;
    }

    let group_type = match fields.remove(FIELD_TYPE) {
        Some(t) if !t.is_empty() => t,
        Some(_) => return corrupt("empty type"),
        None => return corrupt("missing type"),
    };

    let expected = match fields.remove(FIELD_COUNT) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(0) => return corrupt("count is zero"),
            Ok(n) => n,
            Err(_) => return corrupt(&format!("unparsable count {:?}", raw)),
        },
        None => return corrupt("missing count"),
    };

    let confirmed = fields.len();
    if (confirmed as u64) < expected {
        return GroupState::Pending {
            confirmed,
            expected,
        };
    }

    let mut results: Vec<TaskResult> = fields
        .into_iter()
        .map(|(task_id, result)| TaskResult {
            group_id: group_id.to_string(),
            group_type: group_type.clone(),
            task_id,
            result,
        })
        .collect();
    results.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    GroupState::Complete(CompletedGroup {
        group_id: group_id.to_string(),
        group_type,
        expected,
        results,
    })
}

fn corrupt(reason: &str) -> GroupState {
    GroupState::Corrupt {
        reason: reason.to_string(),
    }
}
