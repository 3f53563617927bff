//! Bidirectional subscription index
//!
//! Maps repoId → connections and connection → repoIds, so fan-out is one
//! lookup and a disconnect clears a connection's interests in O(size).

use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};

/// Opaque id of one WebSocket connection
pub type ConnId = String;

#[derive(Default)]
struct Index {
    /// Outbound sender per connection (serialized JSON frames)
    senders: HashMap<ConnId, mpsc::UnboundedSender<String>>,
    by_repo: HashMap<String, HashSet<ConnId>>,
    by_conn: HashMap<ConnId, HashSet<String>>,
}

/// Connection registry with repo-keyed fan-out
pub struct SubscriptionIndex {
    index: RwLock<Index>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
        }
    }

    /// Register a connection and return its id
    pub async fn register(&self, sender: mpsc::UnboundedSender<String>) -> ConnId {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let mut index = self.index.write().await;
        index.senders.insert(conn_id.clone(), sender);
        index.by_conn.insert(conn_id.clone(), HashSet::new());
        conn_id
    }

    /// Drop a connection, clearing every interest set it belonged to
    pub async fn unregister(&self, conn_id: &str) {
        let mut index = self.index.write().await;
        index.senders.remove(conn_id);
        if let Some(repos) = index.by_conn.remove(conn_id) {
            for repo_id in repos {
                if let Some(conns) = index.by_repo.get_mut(&repo_id) {
                    conns.remove(conn_id);
                    if conns.is_empty() {
                        index.by_repo.remove(&repo_id);
                    }
                }
            }
        }
    }

    /// Record interest in a repo, in both index directions
    pub async fn subscribe(&self, conn_id: &str, repo_id: &str) {
        let mut index = self.index.write().await;
        if let Some(repos) = index.by_conn.get_mut(conn_id) {
            repos.insert(repo_id.to_string());
        } else {
            // connection already gone; nothing to record
            return;
        }
        index
            .by_repo
            .entry(repo_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
    }

    /// Drop interest in a repo, in both index directions
    pub async fn unsubscribe(&self, conn_id: &str, repo_id: &str) {
        let mut index = self.index.write().await;
        if let Some(repos) = index.by_conn.get_mut(conn_id) {
            repos.remove(repo_id);
        }
        if let Some(conns) = index.by_repo.get_mut(repo_id) {
            conns.remove(conn_id);
            if conns.is_empty() {
                index.by_repo.remove(repo_id);
            }
        }
    }

    /// Send a frame to one connection
    pub async fn send_to(&self, conn_id: &str, frame: String) {
        let index = self.index.read().await;
        if let Some(sender) = index.senders.get(conn_id) {
            let _ = sender.send(frame);
        }
    }

    /// Send a frame to every subscriber of a repo. A silent no-op when
    /// nobody is subscribed.
    pub async fn broadcast(&self, repo_id: &str, frame: &str) {
        let index = self.index.read().await;
        let Some(conns) = index.by_repo.get(repo_id) else {
            return;
        };
        for conn_id in conns {
            if let Some(sender) = index.senders.get(conn_id) {
                let _ = sender.send(frame.to_string());
            }
        }
    }

    /// Number of connections subscribed to a repo
    pub async fn subscriber_count(&self, repo_id: &str) -> usize {
        self.index
            .read()
            .await
            .by_repo
            .get(repo_id)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}
