//! Manager-to-gateway event bridge
//!
//! Consumes repo-tagged manager events in emission order: notifications
//! update the turn store first, terminal turn outcomes schedule a debounced
//! thread-list refresh, and every event is forwarded to the gateway. The
//! single consuming task preserves per-repo ordering end to end.

use crate::gateway::{Gateway, ServerMessage};
use crate::session::ManagerEvent;
use crate::threads::ThreadListRefresher;
use crate::turns::{self, TurnStateStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Wires manager events into the turn store, the refresher, and the gateway
pub struct Bridge {
    turns: Arc<TurnStateStore>,
    refresher: Arc<ThreadListRefresher>,
    gateway: Arc<Gateway>,
    refresh_delay: Duration,
}

impl Bridge {
    pub fn new(
        turns: Arc<TurnStateStore>,
        refresher: Arc<ThreadListRefresher>,
        gateway: Arc<Gateway>,
        refresh_delay: Duration,
    ) -> Self {
        Self {
            turns,
            refresher,
            gateway,
            refresh_delay,
        }
    }

    /// Consume manager events until the channel closes
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<ManagerEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<ManagerEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        tracing::debug!("Manager event channel closed, bridge exiting");
    }

    async fn handle(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::SessionNotification { repo_id, message } => {
                self.turns.apply(&repo_id, &message).await;

                if let Some(method) = message.get("method").and_then(Value::as_str) {
                    if turns::is_terminal_turn_method(method) {
                        self.refresher.schedule(&repo_id, self.refresh_delay).await;
                    }
                }

                self.gateway
                    .broadcast_to_repo(
                        &repo_id,
                        &ServerMessage::AppServerNotification {
                            repo_id: repo_id.clone(),
                            message,
                        },
                    )
                    .await;
            }
            ManagerEvent::SessionRequest { repo_id, message } => {
                self.gateway
                    .broadcast_to_repo(
                        &repo_id,
                        &ServerMessage::AppServerRequest {
                            repo_id: repo_id.clone(),
                            message,
                        },
                    )
                    .await;
            }
            ManagerEvent::SessionStatus { repo_id, status } => {
                self.gateway
                    .broadcast_to_repo(
                        &repo_id,
                        &ServerMessage::SessionStatus {
                            repo_id: repo_id.clone(),
                            status,
                        },
                    )
                    .await;
            }
        }
    }
}
