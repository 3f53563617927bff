//! Thread list refresh
//!
//! Debounces turn-completion bursts into a single `thread/list` pull per
//! repository, normalizes the heterogeneous entries the agent returns, and
//! broadcasts the full list (never a diff) to the gateway.

use crate::gateway::{Gateway, ServerMessage};
use crate::session::rpc::coerce_id_string;
use crate::session::SessionManager;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Request pulling the thread list from the agent
pub const METHOD_THREAD_LIST: &str = "thread/list";

/// Response fields the list may live under, probed in order
const LIST_FIELDS: [&str; 3] = ["threads", "items", "data"];

/// Epoch numbers at or above this are milliseconds, below are seconds
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// One normalized thread entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Supplies per-thread last-message timestamps from outside the protocol
#[async_trait]
pub trait LastMessageSource: Send + Sync {
    async fn last_message_at(&self, repo_id: &str, thread_id: &str) -> Option<DateTime<Utc>>;
}

/// Parse a timestamp that may be an ISO-8601 string or an epoch number in
/// seconds or milliseconds, disambiguated by magnitude.
pub fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let epoch = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if epoch.abs() >= EPOCH_MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            }
        }
        _ => None,
    }
}

/// Normalize one raw entry; `None` when no id resolves
pub fn normalize_entry(entry: &Value) -> Option<ThreadSummary> {
    let thread_id = entry
        .get("id")
        .or_else(|| entry.get("threadId"))
        .and_then(coerce_id_string)?;

    Some(ThreadSummary {
        thread_id,
        cwd: entry.get("cwd").and_then(Value::as_str).map(str::to_string),
        preview: entry
            .get("preview")
            .and_then(Value::as_str)
            .map(str::to_string),
        created_at: parse_timestamp(entry.get("createdAt")),
        updated_at: parse_timestamp(entry.get("updatedAt")),
        last_message_at: parse_timestamp(entry.get("lastMessageAt")),
    })
}

/// Pull the raw entry list out of a `thread/list` result
pub fn extract_thread_list(result: &Value) -> Option<&Vec<Value>> {
    if let Some(list) = result.as_array() {
        return Some(list);
    }
    LIST_FIELDS
        .iter()
        .find_map(|field| result.get(field).and_then(Value::as_array))
}

/// Normalize a `thread/list` result, dropping entries without an id
pub fn normalize_thread_list(result: &Value) -> Vec<ThreadSummary> {
    extract_thread_list(result)
        .map(|list| list.iter().filter_map(normalize_entry).collect())
        .unwrap_or_default()
}

/// Debounced thread-list refresh per repository
pub struct ThreadListRefresher {
    manager: Arc<SessionManager>,
    gateway: Arc<Gateway>,
    last_message: Option<Arc<dyn LastMessageSource>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ThreadListRefresher {
    pub fn new(
        manager: Arc<SessionManager>,
        gateway: Arc<Gateway>,
        last_message: Option<Arc<dyn LastMessageSource>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            gateway,
            last_message,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Arm a refresh timer unless one is already pending for this repo; a
    /// burst of calls within the window collapses into a single refresh.
    pub async fn schedule(self: &Arc<Self>, repo_id: &str, delay: Duration) {
        let mut timers = self.timers.lock().await;
        if let Some(handle) = timers.get(repo_id) {
            if !handle.is_finished() {
                return;
            }
        }

        let refresher = Arc::clone(self);
        let repo = repo_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            refresher.timers.lock().await.remove(&repo);
            refresher.refresh(&repo).await;
        });
        timers.insert(repo_id.to_string(), handle);
    }

    /// Pull, normalize, and broadcast the thread list for a repo.
    ///
    /// Exits silently when the repo has no connected session; a failed pull
    /// logs and leaves the previously broadcast state standing.
    pub async fn refresh(&self, repo_id: &str) {
        let Some(session) = self.manager.connected_session(repo_id).await else {
            return;
        };

        let result = match session.request(METHOD_THREAD_LIST, None).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(repo_id, "Thread list refresh failed: {}", e);
                return;
            }
        };

        let mut threads = normalize_thread_list(&result);
        if let Some(source) = &self.last_message {
            for thread in &mut threads {
                if let Some(at) = source.last_message_at(repo_id, &thread.thread_id).await {
                    thread.last_message_at = Some(at);
                }
            }
        }

        tracing::debug!(repo_id, count = threads.len(), "Broadcasting thread list");
        self.gateway
            .broadcast_to_repo(
                repo_id,
                &ServerMessage::ThreadListUpdated {
                    repo_id: repo_id.to_string(),
                    threads,
                },
            )
            .await;
    }

    /// Cancel every pending timer, for shutdown
    pub async fn clear(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, SessionConfig};
    use crate::registry::RepoRegistry;
    use crate::session::ProcessSessionFactory;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    // ---- normalization ----

    #[test]
    fn test_normalize_numeric_id_and_epoch_seconds() {
        let entry = json!({"id": 12, "updatedAt": 1_700_000_000});
        let summary = normalize_entry(&entry).unwrap();
        assert_eq!(summary.thread_id, "12");
        assert_eq!(
            summary.updated_at,
            Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
        );
        assert!(summary.created_at.is_none());
    }

    #[test]
    fn test_normalize_thread_id_and_epoch_millis() {
        let entry = json!({"threadId": "thr_2", "createdAt": 1_700_000_000_000i64});
        let summary = normalize_entry(&entry).unwrap();
        assert_eq!(summary.thread_id, "thr_2");
        assert_eq!(
            summary.created_at,
            Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap())
        );
    }

    #[test]
    fn test_normalize_iso_timestamp() {
        let entry = json!({"id": "t1", "updatedAt": "2023-11-14T22:13:20Z"});
        let summary = normalize_entry(&entry).unwrap();
        assert_eq!(
            summary.updated_at,
            Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
        );
    }

    #[test]
    fn test_normalize_drops_entry_without_id() {
        assert!(normalize_entry(&json!({"preview": "orphan"})).is_none());
    }

    #[test]
    fn test_normalize_unparseable_timestamp_is_none() {
        let entry = json!({"id": "t1", "updatedAt": "yesterday"});
        let summary = normalize_entry(&entry).unwrap();
        assert!(summary.updated_at.is_none());
    }

    #[test]
    fn test_extract_list_field_fallbacks() {
        let threads = json!([{"id": "a"}]);
        assert!(extract_thread_list(&threads).is_some());
        assert!(extract_thread_list(&json!({"threads": [{"id": "a"}]})).is_some());
        assert!(extract_thread_list(&json!({"items": [{"id": "a"}]})).is_some());
        assert!(extract_thread_list(&json!({"data": [{"id": "a"}]})).is_some());
        assert!(extract_thread_list(&json!({"other": []})).is_none());
    }

    #[test]
    fn test_normalize_thread_list_filters_and_keeps_order() {
        let result = json!({"threads": [
            {"id": 1},
            {"nope": true},
            {"threadId": "z"},
        ]});
        let list = normalize_thread_list(&result);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].thread_id, "1");
        assert_eq!(list[1].thread_id, "z");
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let summary = ThreadSummary {
            thread_id: "t1".to_string(),
            cwd: None,
            preview: None,
            created_at: None,
            updated_at: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            last_message_at: None,
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["threadId"], "t1");
        assert!(value.get("cwd").is_none());
        assert!(value["updatedAt"].as_str().unwrap().starts_with("2023-11-14T22:13:20"));
    }

    // ---- refresher ----

    const LISTING_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *thread/list*) printf '{"id":%s,"result":{"threads":[{"id":12,"updatedAt":1700000000},{"threadId":"thr_2","createdAt":1700000000000},{"preview":"orphan"}]}}\n' "$id" ;;
    *) printf '{"id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;

    struct Fixture {
        _dir: TempDir,
        manager: Arc<SessionManager>,
        gateway: Arc<Gateway>,
        repo_id: String,
    }

    fn make_fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry =
            Arc::new(RepoRegistry::open(dir.path().join("repos.json")).unwrap());
        let entry = registry.add(dir.path().to_path_buf(), None).unwrap();

        let factory = Arc::new(ProcessSessionFactory {
            agent: AgentConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), LISTING_AGENT.to_string()],
            },
            session: SessionConfig {
                request_timeout_secs: 2,
                connect_timeout_secs: 5,
                stop_grace_ms: 200,
                refresh_debounce_ms: 50,
            },
        });
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(Arc::clone(&registry), factory, events_tx));
        let gateway = Arc::new(Gateway::new(registry, Arc::clone(&manager)));

        Fixture {
            _dir: dir,
            manager,
            gateway,
            repo_id: entry.id,
        }
    }

    async fn subscribe(fixture: &Fixture) -> mpsc::UnboundedReceiver<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = fixture.gateway.register_connection(tx).await;
        fixture
            .gateway
            .handle_message(
                &conn,
                &format!(r#"{{"type":"subscribe","repoId":"{}"}}"#, fixture.repo_id),
            )
            .await;
        // drain the ack
        let ack = rx.recv().await.unwrap();
        assert!(ack.contains("subscribe_ack"));
        rx
    }

    #[tokio::test]
    async fn test_refresh_broadcasts_normalized_list() {
        let fixture = make_fixture();
        let mut rx = subscribe(&fixture).await;

        fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        let refresher = ThreadListRefresher::new(
            Arc::clone(&fixture.manager),
            Arc::clone(&fixture.gateway),
            None,
        );
        refresher.refresh(&fixture.repo_id).await;

        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "thread_list_updated");
        assert_eq!(value["repoId"], fixture.repo_id);
        let threads = value["threads"].as_array().unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0]["threadId"], "12");
        assert_eq!(threads[1]["threadId"], "thr_2");

        fixture.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_refresh_without_session_is_silent() {
        let fixture = make_fixture();
        let mut rx = subscribe(&fixture).await;

        let refresher = ThreadListRefresher::new(
            Arc::clone(&fixture.manager),
            Arc::clone(&fixture.gateway),
            None,
        );
        refresher.refresh(&fixture.repo_id).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_schedule_coalesces_bursts() {
        let fixture = make_fixture();
        let mut rx = subscribe(&fixture).await;

        fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        let refresher = ThreadListRefresher::new(
            Arc::clone(&fixture.manager),
            Arc::clone(&fixture.gateway),
            None,
        );

        refresher
            .schedule(&fixture.repo_id, Duration::from_millis(50))
            .await;
        refresher
            .schedule(&fixture.repo_id, Duration::from_millis(50))
            .await;

        // exactly one refresh fires for the burst
        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains("thread_list_updated"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        fixture.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_schedule_rearms_after_firing() {
        let fixture = make_fixture();
        let mut rx = subscribe(&fixture).await;

        fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        let refresher = ThreadListRefresher::new(
            Arc::clone(&fixture.manager),
            Arc::clone(&fixture.gateway),
            None,
        );

        for _ in 0..2 {
            refresher
                .schedule(&fixture.repo_id, Duration::from_millis(20))
                .await;
            let frame = timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(frame.contains("thread_list_updated"));
        }

        fixture.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_last_message_augmentation() {
        struct FixedSource;

        #[async_trait]
        impl LastMessageSource for FixedSource {
            async fn last_message_at(
                &self,
                _repo_id: &str,
                thread_id: &str,
            ) -> Option<DateTime<Utc>> {
                (thread_id == "12").then(|| Utc.timestamp_opt(1_700_000_100, 0).unwrap())
            }
        }

        let fixture = make_fixture();
        let mut rx = subscribe(&fixture).await;

        fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        let refresher = ThreadListRefresher::new(
            Arc::clone(&fixture.manager),
            Arc::clone(&fixture.gateway),
            Some(Arc::new(FixedSource)),
        );
        refresher.refresh(&fixture.repo_id).await;

        let frame = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        let threads = value["threads"].as_array().unwrap();
        assert!(threads[0]["lastMessageAt"].is_string());
        assert!(threads[1].get("lastMessageAt").is_none());

        fixture.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_clear_cancels_pending_timers() {
        let fixture = make_fixture();
        let mut rx = subscribe(&fixture).await;

        fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        let refresher = ThreadListRefresher::new(
            Arc::clone(&fixture.manager),
            Arc::clone(&fixture.gateway),
            None,
        );

        refresher
            .schedule(&fixture.repo_id, Duration::from_millis(100))
            .await;
        refresher.clear().await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());

        fixture.manager.stop_all().await;
    }
}
