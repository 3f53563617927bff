//! One managed agent conversation
//!
//! A `Session` owns the agent subprocess for a single repository and speaks
//! the newline-delimited JSON-RPC protocol on its stdio. It correlates
//! responses to requests through a pending map, emits notifications and
//! agent-originated requests as typed events, and drives the
//! stopped → starting → connected state machine.
//!
//! The child handle is moved into the exit-monitor task and never shared;
//! out-of-band control (stop, escalation) uses PID signals.

use crate::config::{AgentConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::registry::RepoEntry;
use crate::session::events::{SessionEvent, SessionStatus};
use crate::session::rpc::{self, InboundFrame, RpcNotification, RpcRequest};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// Handshake request sent after spawn
pub const METHOD_INITIALIZE: &str = "initialize";

/// Handshake notification sent once `initialize` resolves
pub const METHOD_INITIALIZED: &str = "initialized";

/// Outcome delivered to a pending request waiter
type RpcOutcome = Result<Value>;

/// Result of claiming the starting slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartClaim {
    /// This caller owns the spawn; it must run the start sequence
    Claimed,
    /// Another caller is already starting the session
    InFlight,
    /// Nothing to do
    AlreadyConnected,
}

/// The managed conversation with one agent subprocess
#[derive(Debug)]
pub struct Session {
    repo_id: String,
    repo_path: PathBuf,
    agent: AgentConfig,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
    status_rx: watch::Receiver<SessionStatus>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcOutcome>>>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pid: Mutex<Option<u32>>,
    child_exited: AtomicBool,
    stopping: AtomicBool,
}

impl Session {
    /// Create a session for a repository. Nothing is spawned until `start`.
    pub fn new(
        repo: &RepoEntry,
        agent: AgentConfig,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Stopped);
        Arc::new(Self {
            repo_id: repo.id.clone(),
            repo_path: repo.path.clone(),
            agent,
            config,
            events,
            status_tx,
            status_rx,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            pid: Mutex::new(None),
            child_exited: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
        })
    }

    /// The repository this session belongs to
    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    /// Current lifecycle status
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the session: spawn the agent and perform the handshake.
    ///
    /// A no-op if already connected; if another caller is mid-start, this
    /// waits for that start's outcome instead of spawning a duplicate.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.claim_start() {
            StartClaim::AlreadyConnected => Ok(()),
            StartClaim::InFlight => self.wait_for_connected().await,
            StartClaim::Claimed => self.run_start().await,
        }
    }

    /// Atomically claim the starting slot. Callers that receive
    /// [`StartClaim::Claimed`] must follow up with [`Session::run_start`].
    pub(crate) fn claim_start(&self) -> StartClaim {
        let mut claim = StartClaim::AlreadyConnected;
        self.status_tx.send_if_modified(|status| match *status {
            SessionStatus::Connected => false,
            SessionStatus::Starting => {
                claim = StartClaim::InFlight;
                false
            }
            SessionStatus::Stopped | SessionStatus::Error => {
                *status = SessionStatus::Starting;
                claim = StartClaim::Claimed;
                true
            }
        });
        if claim == StartClaim::Claimed {
            let _ = self.events.send(SessionEvent::Status(SessionStatus::Starting));
        }
        claim
    }

    /// Run the spawn + handshake sequence. Requires a prior successful claim.
    pub(crate) async fn run_start(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.spawn_agent().await {
            self.fail_start();
            return Err(e);
        }
        match self.handshake().await {
            Ok(()) => {
                self.set_connected();
                tracing::info!(repo_id = %self.repo_id, "Session connected");
                Ok(())
            }
            Err(e) => {
                tracing::error!(repo_id = %self.repo_id, "Agent handshake failed: {}", e);
                self.fail_start();
                self.kill_now().await;
                Err(e)
            }
        }
    }

    /// Stop the subprocess: SIGTERM, a grace window, then SIGKILL.
    ///
    /// Idempotent; a session with no subprocess is left untouched.
    pub async fn stop(&self) -> Result<()> {
        let pid = match *self.pid.lock().await {
            Some(pid) => pid,
            None => return Ok(()),
        };
        self.stopping.store(true, Ordering::SeqCst);
        tracing::info!(repo_id = %self.repo_id, pid, "Stopping agent process");

        self.signal(pid, libc::SIGTERM);
        let grace = Duration::from_millis(self.config.stop_grace_ms);
        if self.wait_until_terminal(grace).await {
            return Ok(());
        }

        tracing::warn!(repo_id = %self.repo_id, pid, "Agent ignored SIGTERM, escalating to SIGKILL");
        self.signal(pid, libc::SIGKILL);
        self.wait_until_terminal(Duration::from_secs(2)).await;
        Ok(())
    }

    /// Wait until the session is connected, bounded by the connect timeout.
    ///
    /// Rejects if the session reaches a terminal state first, or with
    /// [`Error::ConnectTimeout`] when the bound elapses.
    pub async fn wait_for_connected(&self) -> Result<()> {
        let bound = Duration::from_secs(self.config.connect_timeout_secs);
        let mut rx = self.status_rx.clone();
        let wait = async move {
            loop {
                match *rx.borrow() {
                    SessionStatus::Connected => return Ok(()),
                    SessionStatus::Stopped => {
                        return Err(Error::ConnectFailed(
                            "session stopped before connecting".to_string(),
                        ))
                    }
                    SessionStatus::Error => {
                        return Err(Error::ConnectFailed(
                            "agent process failed while connecting".to_string(),
                        ))
                    }
                    SessionStatus::Starting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::ConnectFailed("session dropped".to_string()));
                }
            }
        };
        match tokio::time::timeout(bound, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ConnectTimeout),
        }
    }

    // =========================================================================
    // RPC primitives
    // =========================================================================

    /// Issue a request and await its correlated response.
    ///
    /// Settles exactly once: with the response result, with the response
    /// error, or with a timeout, whichever comes first. The pending entry
    /// is removed on every path.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = RpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.write_line(serde_json::to_string(&frame)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let bound = Duration::from_secs(self.config.request_timeout_secs);
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Session(
                "request dropped without a response".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::RpcTimeout(self.config.request_timeout_secs))
            }
        }
    }

    /// Send a notification; no correlated result
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = RpcNotification {
            method: method.to_string(),
            params,
        };
        self.write_line(serde_json::to_string(&frame)?).await
    }

    /// Answer a request the agent itself issued. The message is written
    /// verbatim; the agent correlates it by the id it chose.
    pub async fn send_response(&self, message: Value) -> Result<()> {
        self.write_line(serde_json::to_string(&message)?).await
    }

    // =========================================================================
    // Spawn and handshake
    // =========================================================================

    async fn spawn_agent(self: &Arc<Self>) -> Result<()> {
        let mut child = Command::new(&self.agent.program)
            .args(&self.agent.args)
            .current_dir(&self.repo_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Session(format!("Failed to spawn {}: {}", self.agent.program, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Session("agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Session("agent stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Session("agent stderr unavailable".to_string()))?;

        let pid = child.id();
        self.child_exited.store(false, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);
        *self.pid.lock().await = pid;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        *self.writer.lock().await = Some(writer_tx);

        tokio::spawn(Arc::clone(self).writer_loop(stdin, writer_rx));
        tokio::spawn(Arc::clone(self).read_loop(stdout));
        tokio::spawn(Self::stderr_loop(self.repo_id.clone(), stderr));
        tokio::spawn(Arc::clone(self).exit_monitor(child));

        tracing::info!(repo_id = %self.repo_id, pid = ?pid, "Spawned agent process");
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let params = serde_json::json!({
            "clientInfo": {
                "name": "codedeck",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.request(METHOD_INITIALIZE, Some(params)).await?;
        self.notify(METHOD_INITIALIZED, None).await
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    async fn writer_loop(
        self: Arc<Self>,
        mut stdin: ChildStdin,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                tracing::debug!(repo_id = %self.repo_id, "Agent stdin write failed");
                break;
            }
        }
        // a request enqueued after the exit flush would otherwise wait out
        // its full timeout
        self.flush_pending("agent stdin closed").await;
    }

    async fn read_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.dispatch_line(&line).await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(repo_id = %self.repo_id, "Agent stdout read failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn stderr_loop(repo_id: String, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(repo_id = %repo_id, "agent stderr: {}", line);
        }
    }

    /// Owns the child handle. Runs until the process exits, then flushes
    /// pending requests and drives the terminal status transition.
    async fn exit_monitor(self: Arc<Self>, mut child: Child) {
        let status = child.wait().await;
        self.child_exited.store(true, Ordering::SeqCst);
        *self.pid.lock().await = None;
        self.writer.lock().await.take();

        let reason = match &status {
            Ok(s) => format!("agent process exited: {s}"),
            Err(e) => format!("agent process wait failed: {e}"),
        };
        self.flush_pending(&reason).await;

        let clean = self.stopping.load(Ordering::SeqCst)
            || status.as_ref().map(|s| s.success()).unwrap_or(false);
        let terminal = if clean {
            SessionStatus::Stopped
        } else {
            SessionStatus::Error
        };
        self.finish_status(terminal);
        tracing::info!(repo_id = %self.repo_id, status = %terminal, "Agent process exited");
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    async fn dispatch_line(&self, line: &str) {
        let frame: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(repo_id = %self.repo_id, "Dropping malformed agent line: {}", e);
                return;
            }
        };
        match rpc::classify(&frame) {
            InboundFrame::Request => {
                let _ = self.events.send(SessionEvent::Request(frame));
            }
            InboundFrame::Response => self.settle_response(frame).await,
            InboundFrame::Notification => {
                let _ = self.events.send(SessionEvent::Notification(frame));
            }
            InboundFrame::Unrecognized => {
                tracing::warn!(repo_id = %self.repo_id, "Dropping unrecognized agent frame");
            }
        }
    }

    async fn settle_response(&self, frame: Value) {
        let id = match rpc::response_id(&frame) {
            Some(id) => id,
            None => {
                tracing::warn!(repo_id = %self.repo_id, "Dropping response with unusable id");
                return;
            }
        };
        let waiter = self.pending.lock().await.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(rpc::response_outcome(&frame).map_err(Error::Rpc));
            }
            None => {
                tracing::warn!(repo_id = %self.repo_id, id, "Response with no matching pending request");
            }
        }
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    async fn write_line(&self, line: String) -> Result<()> {
        let writer = self.writer.lock().await;
        match writer.as_ref() {
            Some(tx) => tx
                .send(line)
                .map_err(|_| Error::Session("agent stdin closed".to_string())),
            None => Err(Error::Session("session has no running process".to_string())),
        }
    }

    /// Reject every pending request. Each entry is consumed exactly once;
    /// a later response for a flushed id is dropped as unmatched.
    async fn flush_pending(&self, reason: &str) {
        let drained: Vec<(u64, oneshot::Sender<RpcOutcome>)> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        tracing::warn!(
            repo_id = %self.repo_id,
            count = drained.len(),
            "Rejecting pending requests: {}",
            reason
        );
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::Session(reason.to_string())));
        }
    }

    fn set_connected(&self) {
        let changed = self.status_tx.send_if_modified(|status| {
            if *status == SessionStatus::Starting {
                *status = SessionStatus::Connected;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self
                .events
                .send(SessionEvent::Status(SessionStatus::Connected));
        }
    }

    fn fail_start(&self) {
        let changed = self.status_tx.send_if_modified(|status| {
            if *status == SessionStatus::Starting {
                *status = SessionStatus::Error;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self.events.send(SessionEvent::Status(SessionStatus::Error));
        }
    }

    /// Terminal transition driven by the exit monitor. Only overwrites the
    /// live states; a handshake failure that already recorded `error` wins.
    fn finish_status(&self, terminal: SessionStatus) {
        let changed = self.status_tx.send_if_modified(|status| match *status {
            SessionStatus::Starting | SessionStatus::Connected => {
                *status = terminal;
                true
            }
            _ => false,
        });
        if changed {
            let _ = self.events.send(SessionEvent::Status(terminal));
        }
    }

    async fn wait_until_terminal(&self, bound: Duration) -> bool {
        let mut rx = self.status_rx.clone();
        let wait = async move {
            loop {
                if matches!(
                    *rx.borrow(),
                    SessionStatus::Stopped | SessionStatus::Error
                ) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(bound, wait).await.is_ok()
    }

    async fn kill_now(&self) {
        if let Some(pid) = *self.pid.lock().await {
            self.signal(pid, libc::SIGKILL);
        }
    }

    fn signal(&self, pid: u32, signal: i32) {
        // never signal a potentially-recycled pid
        if self.child_exited.load(Ordering::SeqCst) {
            return;
        }
        unsafe {
            libc::kill(pid as i32, signal);
        }
    }
}
