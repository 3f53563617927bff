//! Session manager
//!
//! The single point of truth for "is there a usable session" per repository.
//! Owns the repoId → Session map, arbitrates concurrent start/stop, and
//! multiplexes per-session events into repo-tagged manager events.

use crate::config::{AgentConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::registry::{RepoEntry, RepoRegistry};
use crate::session::events::{ManagerEvent, SessionEvent, SessionStatus};
use crate::session::session::Session;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Constructs sessions; injectable so tests can substitute fake agents
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        repo: &RepoEntry,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Session>;
}

/// Default factory: spawns the configured agent command
pub struct ProcessSessionFactory {
    pub agent: AgentConfig,
    pub session: SessionConfig,
}

impl SessionFactory for ProcessSessionFactory {
    fn create(
        &self,
        repo: &RepoEntry,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Session> {
        Session::new(repo, self.agent.clone(), self.session.clone(), events)
    }
}

enum StartAction {
    /// An existing start is in flight; await its outcome
    Await(Arc<Session>),
    /// A stale session must be stopped before a fresh start
    Replace(Arc<Session>),
    /// This caller owns the freshly registered session's start
    Start(Arc<Session>),
}

/// Manages one session per registered repository
pub struct SessionManager {
    registry: Arc<RepoRegistry>,
    factory: Arc<dyn SessionFactory>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<RepoRegistry>,
        factory: Arc<dyn SessionFactory>,
        events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        Self {
            registry,
            factory,
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Return the connected session for a repo, starting one if needed.
    ///
    /// Concurrent callers for the same cold repo race on the map entry, not
    /// on the spawn: the first registers a session and claims its start
    /// before the map lock drops, so the second awaits that session's
    /// connection outcome instead of spawning a duplicate subprocess.
    pub async fn get_or_start(&self, repo_id: &str) -> Result<Arc<Session>> {
        let repo = self
            .registry
            .get(repo_id)
            .ok_or_else(|| Error::UnknownRepo(repo_id.to_string()))?;

        loop {
            let action = {
                let mut sessions = self.sessions.lock().await;
                match sessions.get(repo_id) {
                    Some(session) if session.status() == SessionStatus::Connected => {
                        return Ok(Arc::clone(session));
                    }
                    Some(session) if session.status() == SessionStatus::Starting => {
                        StartAction::Await(Arc::clone(session))
                    }
                    Some(session) => {
                        let stale = Arc::clone(session);
                        sessions.remove(repo_id);
                        StartAction::Replace(stale)
                    }
                    None => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let session = self.factory.create(&repo, tx);
                        // a fresh session is stopped, so this always claims
                        session.claim_start();
                        self.forward_events(repo_id.to_string(), rx);
                        sessions.insert(repo_id.to_string(), Arc::clone(&session));
                        StartAction::Start(session)
                    }
                }
            };

            match action {
                StartAction::Await(session) => {
                    session.wait_for_connected().await?;
                    return Ok(session);
                }
                StartAction::Replace(stale) => {
                    tracing::info!(repo_id, "Discarding stale session before fresh start");
                    if let Err(e) = stale.stop().await {
                        tracing::warn!(repo_id, "Failed to stop stale session: {}", e);
                    }
                }
                StartAction::Start(session) => {
                    return match session.run_start().await {
                        Ok(()) => Ok(session),
                        Err(e) => {
                            tracing::error!(repo_id, "Session failed to start: {}", e);
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// The session for a repo, if one is registered (any status)
    pub async fn get_session(&self, repo_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(repo_id).cloned()
    }

    /// The session for a repo, only if it is connected
    pub async fn connected_session(&self, repo_id: &str) -> Option<Arc<Session>> {
        let session = self.get_session(repo_id).await?;
        (session.status() == SessionStatus::Connected).then_some(session)
    }

    /// Current status for a repo; `stopped` when no session is registered
    pub async fn get_status(&self, repo_id: &str) -> SessionStatus {
        match self.get_session(repo_id).await {
            Some(session) => session.status(),
            None => SessionStatus::Stopped,
        }
    }

    /// Stop and remove a repo's session.
    ///
    /// A `stopped` status event is emitted even if no session existed, so
    /// subscribers always learn the repo is down.
    pub async fn stop(&self, repo_id: &str) -> Result<()> {
        if self.registry.get(repo_id).is_none() {
            return Err(Error::UnknownRepo(repo_id.to_string()));
        }

        let session = self.sessions.lock().await.remove(repo_id);
        if let Some(session) = session {
            session.stop().await?;
        }
        let _ = self.events.send(ManagerEvent::SessionStatus {
            repo_id: repo_id.to_string(),
            status: SessionStatus::Stopped,
        });
        Ok(())
    }

    /// Drain every session, sequentially, for shutdown
    pub async fn stop_all(&self) {
        let drained: Vec<(String, Arc<Session>)> =
            self.sessions.lock().await.drain().collect();
        for (repo_id, session) in drained {
            if let Err(e) = session.stop().await {
                tracing::warn!(repo_id = %repo_id, "Failed to stop session: {}", e);
            }
        }
    }

    /// Forward a response answering an agent-originated request.
    ///
    /// A warning no-op when the repo has no session; the agent that asked is
    /// gone, so there is nothing useful to do with the answer.
    pub async fn send_response(&self, repo_id: &str, message: Value) -> Result<()> {
        let session = self.sessions.lock().await.get(repo_id).cloned();
        match session {
            Some(session) => session.send_response(message).await,
            None => {
                tracing::warn!(repo_id, "Dropping app-server response for repo with no session");
                Ok(())
            }
        }
    }

    /// Re-emit one session's events tagged with its repo id
    fn forward_events(&self, repo_id: String, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let tagged = match event {
                    SessionEvent::Status(status) => ManagerEvent::SessionStatus {
                        repo_id: repo_id.clone(),
                        status,
                    },
                    SessionEvent::Notification(message) => ManagerEvent::SessionNotification {
                        repo_id: repo_id.clone(),
                        message,
                    },
                    SessionEvent::Request(message) => ManagerEvent::SessionRequest {
                        repo_id: repo_id.clone(),
                        message,
                    },
                };
                if events.send(tagged).is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::{timeout, Duration};

    const SCRIPTED_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *emit*) printf '{"id":%s,"result":{}}\n' "$id"
            printf '{"method":"turn/completed","params":{"turnId":"t9"}}\n' ;;
    *) printf '{"id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;

    struct Fixture {
        dir: TempDir,
        registry: Arc<RepoRegistry>,
        manager: SessionManager,
        events: mpsc::UnboundedReceiver<ManagerEvent>,
        repo_id: String,
    }

    fn test_session_config() -> SessionConfig {
        SessionConfig {
            request_timeout_secs: 2,
            connect_timeout_secs: 5,
            stop_grace_ms: 200,
            refresh_debounce_ms: 50,
        }
    }

    fn make_fixture(script: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry =
            Arc::new(RepoRegistry::open(dir.path().join("repos.json")).unwrap());
        let entry = registry.add(dir.path().to_path_buf(), None).unwrap();

        let factory = Arc::new(ProcessSessionFactory {
            agent: AgentConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
            session: test_session_config(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(Arc::clone(&registry), factory, tx);
        Fixture {
            dir,
            registry,
            manager,
            events: rx,
            repo_id: entry.id,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> ManagerEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for manager event")
            .expect("manager event channel closed")
    }

    #[tokio::test]
    async fn test_get_or_start_unknown_repo() {
        let fixture = make_fixture(SCRIPTED_AGENT);
        let err = fixture.manager.get_or_start("nope").await.unwrap_err();
        assert!(matches!(err, Error::UnknownRepo(_)));
        assert!(fixture.manager.get_session("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_get_or_start_connects_and_reuses() {
        let fixture = make_fixture(SCRIPTED_AGENT);

        let first = fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        assert_eq!(first.status(), SessionStatus::Connected);

        let second = fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        fixture.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_cold_start_spawns_once() {
        let fixture = make_fixture(SCRIPTED_AGENT);

        // every spawn appends a line to the marker file
        let marker = fixture.dir.path().join("spawns");
        let script = format!(
            "echo spawned >> {}\n{}",
            marker.display(),
            SCRIPTED_AGENT
        );
        let factory = Arc::new(ProcessSessionFactory {
            agent: AgentConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script],
            },
            session: test_session_config(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&fixture.registry),
            factory,
            tx,
        ));

        let (a, b) = tokio::join!(
            manager.get_or_start(&fixture.repo_id),
            manager.get_or_start(&fixture.repo_id),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.status(), SessionStatus::Connected);

        let spawns = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(spawns.lines().count(), 1);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stale_session_replaced_on_next_start() {
        let fixture = make_fixture(SCRIPTED_AGENT);

        let first = fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        first.stop().await.unwrap();
        assert_eq!(first.status(), SessionStatus::Stopped);

        // retry on demand: a fresh session replaces the stale one
        let second = fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), SessionStatus::Connected);

        fixture.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_unknown_repo_fails() {
        let fixture = make_fixture(SCRIPTED_AGENT);
        let err = fixture.manager.stop("nope").await.unwrap_err();
        assert!(matches!(err, Error::UnknownRepo(_)));
    }

    #[tokio::test]
    async fn test_stop_without_session_emits_stopped() {
        let mut fixture = make_fixture(SCRIPTED_AGENT);

        fixture.manager.stop(&fixture.repo_id).await.unwrap();

        match next_event(&mut fixture.events).await {
            ManagerEvent::SessionStatus { repo_id, status } => {
                assert_eq!(repo_id, fixture.repo_id);
                assert_eq!(status, SessionStatus::Stopped);
            }
            other => panic!("expected status event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_removes_session() {
        let fixture = make_fixture(SCRIPTED_AGENT);

        fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        fixture.manager.stop(&fixture.repo_id).await.unwrap();

        assert!(fixture.manager.get_session(&fixture.repo_id).await.is_none());
        assert_eq!(
            fixture.manager.get_status(&fixture.repo_id).await,
            SessionStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_send_response_without_session_is_noop() {
        let fixture = make_fixture(SCRIPTED_AGENT);
        fixture
            .manager
            .send_response(&fixture.repo_id, serde_json::json!({"id": 1, "result": {}}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_events_are_repo_tagged() {
        let mut fixture = make_fixture(SCRIPTED_AGENT);

        let session = fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        session.request("emit", None).await.unwrap();

        // starting, connected, then the notification the fake agent emitted
        loop {
            match next_event(&mut fixture.events).await {
                ManagerEvent::SessionNotification { repo_id, message } => {
                    assert_eq!(repo_id, fixture.repo_id);
                    assert_eq!(message["method"], "turn/completed");
                    break;
                }
                ManagerEvent::SessionStatus { repo_id, .. } => {
                    assert_eq!(repo_id, fixture.repo_id);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        fixture.manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_connected_session_filter() {
        let fixture = make_fixture(SCRIPTED_AGENT);

        assert!(fixture
            .manager
            .connected_session(&fixture.repo_id)
            .await
            .is_none());

        let session = fixture.manager.get_or_start(&fixture.repo_id).await.unwrap();
        assert!(fixture
            .manager
            .connected_session(&fixture.repo_id)
            .await
            .is_some());

        session.stop().await.unwrap();
        assert!(fixture
            .manager
            .connected_session(&fixture.repo_id)
            .await
            .is_none());
    }
}
