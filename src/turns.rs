//! Turn lifecycle projection
//!
//! A pure projection of turn lifecycle notifications into a
//! repoId → turnId → status mapping. Turn ids are extracted with an ordered
//! rule list so new payload shapes are additive; unresolvable notifications
//! are ignored. Writes are last-write-wins and entries are never evicted.

use crate::session::rpc::coerce_id_string;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Notification opening a turn
pub const METHOD_TURN_STARTED: &str = "turn/started";

/// Notification closing a turn, possibly with an interrupted status
pub const METHOD_TURN_COMPLETED: &str = "turn/completed";

/// Notification closing a turn with a failure
pub const METHOD_TURN_FAILED: &str = "turn/failed";

/// Request that interrupts a running turn
pub const METHOD_TURN_INTERRUPT: &str = "turn/interrupt";

/// True for methods that close a turn and should trigger a list refresh
pub fn is_terminal_turn_method(method: &str) -> bool {
    matches!(method, METHOD_TURN_COMPLETED | METHOD_TURN_FAILED)
}

/// Status of one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl TurnStatus {
    /// True once the turn can no longer change on its own
    pub fn is_terminal(self) -> bool {
        !matches!(self, TurnStatus::Running)
    }
}

fn turn_object_id(params: &Value) -> Option<&Value> {
    params.get("turn")?.get("id")
}

fn top_level_turn_id(params: &Value) -> Option<&Value> {
    params.get("turnId")
}

fn turn_object_turn_id(params: &Value) -> Option<&Value> {
    params.get("turn")?.get("turnId")
}

/// Ordered turn-id extraction rules; first match wins
const TURN_ID_RULES: [fn(&Value) -> Option<&Value>; 3] =
    [turn_object_id, top_level_turn_id, turn_object_turn_id];

/// Extract a turn id from a notification's params, if any rule resolves
pub fn extract_turn_id(params: &Value) -> Option<String> {
    TURN_ID_RULES
        .iter()
        .find_map(|rule| rule(params))
        .and_then(coerce_id_string)
}

fn completed_status(params: &Value) -> TurnStatus {
    let reported = params
        .get("status")
        .or_else(|| params.get("turn").and_then(|turn| turn.get("status")))
        .and_then(Value::as_str);
    if reported == Some("interrupted") {
        TurnStatus::Interrupted
    } else {
        TurnStatus::Completed
    }
}

/// Projection of turn lifecycle notifications
pub struct TurnStateStore {
    turns: RwLock<HashMap<String, HashMap<String, TurnStatus>>>,
}

impl TurnStateStore {
    pub fn new() -> Self {
        Self {
            turns: RwLock::new(HashMap::new()),
        }
    }

    /// Apply one notification frame. Non-turn methods and notifications with
    /// no resolvable turn id are ignored.
    pub async fn apply(&self, repo_id: &str, notification: &Value) {
        let method = match notification.get("method").and_then(Value::as_str) {
            Some(method) => method,
            None => return,
        };
        let params = notification.get("params").unwrap_or(&Value::Null);

        let status = match method {
            METHOD_TURN_STARTED => TurnStatus::Running,
            METHOD_TURN_COMPLETED => completed_status(params),
            METHOD_TURN_FAILED => TurnStatus::Failed,
            _ => return,
        };

        let turn_id = match extract_turn_id(params) {
            Some(id) => id,
            None => {
                tracing::debug!(repo_id, method, "Turn notification without a resolvable id");
                return;
            }
        };

        self.turns
            .write()
            .await
            .entry(repo_id.to_string())
            .or_default()
            .insert(turn_id, status);
    }

    /// Current status of a turn, or `None` if never observed
    pub async fn get(&self, repo_id: &str, turn_id: &str) -> Option<TurnStatus> {
        self.turns
            .read()
            .await
            .get(repo_id)
            .and_then(|turns| turns.get(turn_id))
            .copied()
    }
}

impl Default for TurnStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn started(turn_id: &str) -> Value {
        json!({"method": METHOD_TURN_STARTED, "params": {"turnId": turn_id}})
    }

    #[tokio::test]
    async fn test_absent_before_any_notification() {
        let store = TurnStateStore::new();
        assert_eq!(store.get("r1", "t1").await, None);
    }

    #[tokio::test]
    async fn test_started_records_running() {
        let store = TurnStateStore::new();
        store.apply("r1", &started("t1")).await;
        assert_eq!(store.get("r1", "t1").await, Some(TurnStatus::Running));
    }

    #[tokio::test]
    async fn test_completed_records_completed() {
        let store = TurnStateStore::new();
        store.apply("r1", &started("t1")).await;
        store
            .apply(
                "r1",
                &json!({"method": METHOD_TURN_COMPLETED, "params": {"turnId": "t1"}}),
            )
            .await;
        assert_eq!(store.get("r1", "t1").await, Some(TurnStatus::Completed));
    }

    #[tokio::test]
    async fn test_completed_with_interrupted_status() {
        let store = TurnStateStore::new();
        store
            .apply(
                "r1",
                &json!({
                    "method": METHOD_TURN_COMPLETED,
                    "params": {"turnId": "t1", "status": "interrupted"}
                }),
            )
            .await;
        assert_eq!(store.get("r1", "t1").await, Some(TurnStatus::Interrupted));
    }

    #[tokio::test]
    async fn test_nested_interrupted_status() {
        let store = TurnStateStore::new();
        store
            .apply(
                "r1",
                &json!({
                    "method": METHOD_TURN_COMPLETED,
                    "params": {"turn": {"id": "t1", "status": "interrupted"}}
                }),
            )
            .await;
        assert_eq!(store.get("r1", "t1").await, Some(TurnStatus::Interrupted));
    }

    #[tokio::test]
    async fn test_failed_records_failed() {
        let store = TurnStateStore::new();
        store
            .apply(
                "r1",
                &json!({"method": METHOD_TURN_FAILED, "params": {"turnId": "t1"}}),
            )
            .await;
        assert_eq!(store.get("r1", "t1").await, Some(TurnStatus::Failed));
    }

    #[tokio::test]
    async fn test_extraction_rule_order() {
        // the nested turn object's id wins over a top-level turnId
        let params = json!({"turn": {"id": "nested"}, "turnId": "top"});
        assert_eq!(extract_turn_id(&params), Some("nested".to_string()));

        let params = json!({"turnId": "top", "turn": {"turnId": "nested"}});
        assert_eq!(extract_turn_id(&params), Some("top".to_string()));

        let params = json!({"turn": {"turnId": "only"}});
        assert_eq!(extract_turn_id(&params), Some("only".to_string()));
    }

    #[tokio::test]
    async fn test_numeric_turn_id_coerced() {
        let store = TurnStateStore::new();
        store
            .apply(
                "r1",
                &json!({"method": METHOD_TURN_STARTED, "params": {"turnId": 17}}),
            )
            .await;
        assert_eq!(store.get("r1", "17").await, Some(TurnStatus::Running));
    }

    #[tokio::test]
    async fn test_unresolvable_id_ignored() {
        let store = TurnStateStore::new();
        store
            .apply("r1", &json!({"method": METHOD_TURN_STARTED, "params": {}}))
            .await;
        store
            .apply("r1", &json!({"method": METHOD_TURN_STARTED}))
            .await;
        assert_eq!(store.get("r1", "t1").await, None);
    }

    #[tokio::test]
    async fn test_non_turn_methods_ignored() {
        let store = TurnStateStore::new();
        store
            .apply(
                "r1",
                &json!({"method": "thread/updated", "params": {"turnId": "t1"}}),
            )
            .await;
        assert_eq!(store.get("r1", "t1").await, None);
    }

    #[tokio::test]
    async fn test_last_write_wins_after_terminal() {
        let store = TurnStateStore::new();
        store
            .apply(
                "r1",
                &json!({"method": METHOD_TURN_COMPLETED, "params": {"turnId": "t1"}}),
            )
            .await;
        store.apply("r1", &started("t1")).await;
        assert_eq!(store.get("r1", "t1").await, Some(TurnStatus::Running));
    }

    #[tokio::test]
    async fn test_repos_are_independent() {
        let store = TurnStateStore::new();
        store.apply("r1", &started("t1")).await;
        assert_eq!(store.get("r2", "t1").await, None);
    }

    #[test]
    fn test_terminal_turn_methods() {
        assert!(is_terminal_turn_method(METHOD_TURN_COMPLETED));
        assert!(is_terminal_turn_method(METHOD_TURN_FAILED));
        assert!(!is_terminal_turn_method(METHOD_TURN_STARTED));
        assert!(!is_terminal_turn_method("thread/updated"));
    }
}
