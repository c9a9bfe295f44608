use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::activity::ActivityTracker;
use crate::broker::Broker;
use crate::pty::{Pty, PtyError, SpawnCommand};

/// A single terminal session with all associated state.
///
/// Each `Session` owns the PTY, the input channel, and the event broker for
/// one spawned process. The `SessionRegistry` manages all sessions on the
/// server; session ids are UUIDs and are never reused.
#[derive(Clone)]
pub struct Session {
    /// Opaque unique session identifier.
    pub id: String,
    /// PID of the child process spawned in the PTY, if available.
    pub pid: Option<u32>,
    /// Working directory the session was bound to at creation.
    pub cwd: PathBuf,
    /// Human-readable display of the command being run.
    pub command: String,
    /// Wall-clock creation timestamp, unix milliseconds.
    pub created_at_ms: u64,
    pub input_tx: mpsc::Sender<Bytes>,
    /// Event source streaming clients subscribe to.
    pub events: Broker,
    pub activity: ActivityTracker,
    pub pty: Arc<parking_lot::Mutex<Pty>>,
    /// Signal to detach all streaming clients from this session.
    /// Fired on explicit kill only — natural child exit leaves listeners
    /// attached so they can observe the terminal exit event.
    pub detach_signal: broadcast::Sender<()>,
    /// Cancellation token that fires when this session is killed/removed.
    pub cancelled: tokio_util::sync::CancellationToken,
    /// Set by the exit monitor when the child process exits. Checked before
    /// signaling to avoid hitting a potentially-recycled PID.
    pub child_exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Session {
    /// Signal all attached streaming clients to detach.
    pub fn detach(&self) {
        let _ = self.detach_signal.send(());
    }

    /// Send SIGKILL to the child's process group.
    ///
    /// Signals the entire process group (negative PID) so processes spawned
    /// by the shell also receive the signal. portable_pty calls setsid()
    /// when spawning, so the child leads its own process group. Checks
    /// `child_exited` before signaling to avoid a recycled PID.
    pub fn kill_child(&self) {
        if let Some(pid) = self.pid {
            if pid == 0 || pid > i32::MAX as u32 {
                tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
                return;
            }
            if self.child_exited.load(Ordering::Acquire) {
                tracing::debug!(pid, "child already exited, skipping SIGKILL");
                return;
            }
            #[cfg(unix)]
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }

    /// Send SIGHUP to the child's process group, requesting graceful
    /// termination during drain.
    pub fn send_sighup(&self) {
        if let Some(pid) = self.pid {
            if pid == 0 || pid > i32::MAX as u32 {
                tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
                return;
            }
            if self.child_exited.load(Ordering::Acquire) {
                tracing::debug!(pid, "child already exited, skipping SIGHUP");
                return;
            }
            #[cfg(unix)]
            unsafe {
                libc::kill(-(pid as i32), libc::SIGHUP);
            }
        }
    }

    /// Spawn a new session with a PTY and its reader/writer tasks.
    ///
    /// The PTY reader publishes each chunk to the broker in arrival order
    /// and touches the activity tracker. The PTY writer consumes from the
    /// input channel. Returns the session and a oneshot receiver carrying
    /// the child's exit code.
    pub fn spawn(
        cwd: PathBuf,
        command: SpawnCommand,
        rows: u16,
        cols: u16,
    ) -> Result<(Self, oneshot::Receiver<i32>), PtyError> {
        let command_display = command.display();
        let cmd = Pty::build_command(&command, &cwd);
        let mut pty = Pty::spawn(rows, cols, cmd)?;
        let pty_reader = pty.take_reader()?;
        let pty_writer = pty.take_writer()?;
        let pty_child = pty.take_child();
        let pid = pty_child.as_ref().and_then(|c| c.process_id());
        let pty = Arc::new(parking_lot::Mutex::new(pty));

        // Monitor child exit via a oneshot carrying the exit code. The
        // JoinHandles of the blocking tasks below are intentionally not
        // stored: all of them self-terminate when the PTY fd closes or the
        // child exits.
        let (child_exit_tx, child_exit_rx) = oneshot::channel::<i32>();
        if let Some(mut child) = pty_child {
            tokio::task::spawn_blocking(move || {
                let code = match child.wait() {
                    Ok(status) => {
                        tracing::debug!(?status, "session child exited");
                        status.exit_code() as i32
                    }
                    Err(e) => {
                        tracing::error!(?e, "error waiting for session child");
                        -1
                    }
                };
                let _ = child_exit_tx.send(code);
            });
        } else {
            let _ = child_exit_tx.send(-1);
        }

        let events = Broker::new();
        let activity = ActivityTracker::new();
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);

        // PTY reader: broadcast each chunk (non-blocking, lossy for slow
        // subscribers) and refresh last-activity.
        let broker_clone = events.clone();
        let activity_clone = activity.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut reader = pty_reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        broker_clone.publish(Bytes::copy_from_slice(&buf[..n]));
                        activity_clone.touch();
                    }
                    Err(_) => break,
                }
            }
        });

        // PTY writer: blocks on the input channel until it closes or the
        // PTY write fails (child gone).
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut writer = pty_writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            pid,
            cwd,
            command: command_display,
            created_at_ms: now_unix_ms(),
            input_tx,
            events,
            activity,
            pty,
            detach_signal: broadcast::channel::<()>(1).0,
            cancelled: tokio_util::sync::CancellationToken::new(),
            child_exited: Arc::new(AtomicBool::new(false)),
        };

        Ok((session, child_exit_rx))
    }
}

/// Listing entry for discovery/reconnect UIs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub created_at: u64,
    pub last_activity_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,

    #[error("failed to spawn session: {0}")]
    SpawnFailed(#[from] PtyError),

    #[error("spawn task failed: {0}")]
    SpawnTaskFailed(#[from] tokio::task::JoinError),
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    max_sessions: Option<usize>,
}

/// Manages all live sessions by id.
///
/// The map is owned exclusively by the worker process that created it.
/// Construct one registry at process start and pass it by reference to all
/// consumers — there is no ambient global instance.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Default maximum number of sessions when no explicit limit is set.
    ///
    /// Each session costs ~2 fds (PTY pair) + 3 blocking threads + buffers.
    /// 256 leaves headroom in tokio's default blocking pool (512 threads)
    /// while containing a runaway caller.
    const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_max_sessions(Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                max_sessions,
            })),
        }
    }

    /// Create a new session bound to `cwd`, returning its freshly generated
    /// id.
    ///
    /// The registry trusts that `cwd` has already been authorized by its
    /// caller — it performs no scope check itself. The fork/exec runs on
    /// the blocking pool; no registry lock is held across it.
    pub async fn create(
        &self,
        cwd: PathBuf,
        command: SpawnCommand,
        rows: u16,
        cols: u16,
    ) -> Result<String, RegistryError> {
        {
            let inner = self.inner.read();
            if let Some(max) = inner.max_sessions {
                if inner.sessions.len() >= max {
                    return Err(RegistryError::MaxSessionsReached);
                }
            }
        }

        let (session, child_exit_rx) =
            tokio::task::spawn_blocking(move || Session::spawn(cwd, command, rows, cols))
                .await??;
        let id = session.id.clone();
        let child_exited = session.child_exited.clone();

        {
            let mut inner = self.inner.write();
            if let Some(max) = inner.max_sessions {
                if inner.sessions.len() >= max {
                    // Lost the admission race to concurrent creates; clean up
                    // the just-spawned child.
                    session.cancelled.cancel();
                    session.kill_child();
                    return Err(RegistryError::MaxSessionsReached);
                }
            }
            inner.sessions.insert(id.clone(), session);
        }

        self.monitor_child_exit(id.clone(), child_exited, child_exit_rx);
        tracing::info!(session = %id, "session created");
        Ok(id)
    }

    /// Look up a session by id, returning a clone if found.
    pub fn get(&self, id: &str) -> Option<Session> {
        let inner = self.inner.read();
        inner.sessions.get(id).cloned()
    }

    /// Forward bytes to the session's input and refresh last-activity.
    /// Returns `false` for an unknown id.
    pub async fn write(&self, id: &str, data: Bytes) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if session.input_tx.send(data).await.is_err() {
            // Writer task gone — the child already exited; treat like an
            // unknown session rather than an error.
            return false;
        }
        session.activity.touch();
        true
    }

    /// Propagate terminal dimension changes. Returns `false` for an unknown
    /// id.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if let Err(e) = session.pty.lock().resize(rows, cols) {
            tracing::warn!(session = %id, error = %e, "pty resize failed");
            return false;
        }
        session.activity.touch();
        true
    }

    /// Terminate the session's process, detach all listeners, and remove
    /// the entry. Returns `false` if not found.
    pub fn kill(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            inner.sessions.remove(id)
        };
        match removed {
            Some(session) => {
                session.cancelled.cancel();
                session.detach();
                session.kill_child();
                tracing::info!(session = %id, "session killed");
                true
            }
            None => false,
        }
    }

    /// Return all sessions with creation/activity timestamps.
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read();
        inner
            .sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                created_at: s.created_at_ms,
                last_activity_at: s.activity.last_activity_unix_ms(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all sessions atomically, detaching streaming clients first.
    ///
    /// Called during server shutdown. Sends explicit SIGHUP to each child
    /// rather than relying on PTY fd closure. Returns a `JoinHandle` for
    /// the SIGKILL escalation task if any sessions were drained.
    pub fn drain(&self) -> Option<tokio::task::JoinHandle<()>> {
        let sessions: Vec<Session> = {
            let mut inner = self.inner.write();
            let drained: Vec<(String, Session)> = inner.sessions.drain().collect();
            for (id, session) in &drained {
                session.cancelled.cancel();
                session.detach();
                session.send_sighup();
                tracing::info!(session = %id, "session drained");
            }
            drained.into_iter().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return None;
        }
        // Give children 3 seconds to exit from SIGHUP, then escalate.
        Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            for session in &sessions {
                session.kill_child();
            }
        }))
    }

    /// Watch for the session's child exit and remove the entry.
    ///
    /// On natural exit the terminal `Exit` event is published on the
    /// session's broker *before* the entry is removed, so listeners that
    /// have not yet detached still observe it. Listeners are NOT detached
    /// here — only an explicit `kill` fires the detach signal. If the
    /// session was already removed (kill/drain), nothing is emitted.
    fn monitor_child_exit(
        &self,
        id: String,
        child_exited: Arc<AtomicBool>,
        child_exit_rx: oneshot::Receiver<i32>,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            let code = child_exit_rx.await.unwrap_or(-1);
            // Mark exited BEFORE removal so concurrent drain/kill skip
            // signaling a recycled PID.
            child_exited.store(true, Ordering::Release);

            let removed = {
                let mut inner = registry.inner.write();
                if let Some(session) = inner.sessions.get(&id) {
                    session.events.publish_exit(code);
                }
                inner.sessions.remove(&id)
            };
            match removed {
                Some(session) => {
                    tracing::info!(session = %id, exit_code = code, "session child process exited");
                    session.cancelled.cancel();
                }
                None => {
                    tracing::debug!(session = %id, "session child exited (already removed)");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SessionEvent;
    use std::time::Duration;

    async fn create_shell_session(registry: &SessionRegistry) -> String {
        registry
            .create(PathBuf::from("/tmp"), SpawnCommand::Shell, 24, 80)
            .await
            .expect("create should succeed")
    }

    #[tokio::test]
    async fn unknown_id_operations_return_absent_or_false() {
        let registry = SessionRegistry::new();
        assert!(registry.get("no-such-id").is_none());
        assert!(!registry.write("no-such-id", Bytes::from("x")).await);
        assert!(!registry.resize("no-such-id", 80, 24));
        assert!(!registry.kill("no-such-id"));
    }

    #[tokio::test]
    async fn create_returns_distinct_ids_for_same_cwd() {
        let registry = SessionRegistry::new();
        let a = create_shell_session(&registry).await;
        let b = create_shell_session(&registry).await;
        assert_ne!(a, b);
        registry.kill(&a);
        registry.kill(&b);
    }

    #[tokio::test]
    async fn create_respects_max_sessions() {
        let registry = SessionRegistry::with_max_sessions(Some(1));
        let id = create_shell_session(&registry).await;

        let err = registry
            .create(PathBuf::from("/tmp"), SpawnCommand::Shell, 24, 80)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::MaxSessionsReached));
        registry.kill(&id);
    }

    #[tokio::test]
    async fn kill_removes_and_rejects_subsequent_write() {
        let registry = SessionRegistry::new();
        let id = create_shell_session(&registry).await;

        assert!(registry.kill(&id));
        assert!(registry.get(&id).is_none());
        assert!(!registry.write(&id, Bytes::from("echo hi\n")).await);
    }

    #[tokio::test]
    async fn kill_fires_detach_signal() {
        let registry = SessionRegistry::new();
        let id = create_shell_session(&registry).await;
        let session = registry.get(&id).unwrap();
        let mut detach_rx = session.detach_signal.subscribe();

        registry.kill(&id);

        tokio::time::timeout(Duration::from_millis(500), detach_rx.recv())
            .await
            .expect("detach signal should fire on kill")
            .expect("detach channel should be alive");
    }

    #[tokio::test]
    async fn write_advances_last_activity() {
        let registry = SessionRegistry::new();
        let id = create_shell_session(&registry).await;
        let session = registry.get(&id).unwrap();

        let before = session.activity.last_activity_unix_ms();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(registry.write(&id, Bytes::from("x")).await);
        let after = session.activity.last_activity_unix_ms();
        assert!(after >= before, "expected {after} >= {before}");
        registry.kill(&id);
    }

    #[tokio::test]
    async fn session_output_is_observable() {
        let registry = SessionRegistry::new();
        let id = create_shell_session(&registry).await;
        let session = registry.get(&id).unwrap();
        let mut rx = session.events.subscribe();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.write(&id, Bytes::from("echo hi-there\n")).await);

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let SessionEvent::Data(data) = event {
                collected.extend_from_slice(&data);
                if String::from_utf8_lossy(&collected).contains("hi-there") {
                    break;
                }
            }
        }
        assert!(
            String::from_utf8_lossy(&collected).contains("hi-there"),
            "expected output to contain 'hi-there'"
        );
        registry.kill(&id);
    }

    #[tokio::test]
    async fn natural_exit_emits_exit_event_and_keeps_listeners() {
        let registry = SessionRegistry::new();
        // A short-lived child that stays alive long enough to subscribe to
        // its events before it exits.
        let id = registry
            .create(
                PathBuf::from("/tmp"),
                SpawnCommand::Program("sleep 0.3".into()),
                24,
                80,
            )
            .await
            .expect("create should succeed");

        let session = registry.get(&id).expect("session should exist right after create");
        let mut events = session.events.subscribe();
        let mut detach_rx = session.detach_signal.subscribe();

        // The exit event must arrive on the still-attached subscription.
        let code = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Exit(code)) => break code,
                    Ok(SessionEvent::Data(_)) => continue,
                    Err(e) => panic!("event channel closed before exit event: {e}"),
                }
            }
        })
        .await
        .expect("exit event should arrive within timeout");
        assert_eq!(code, 0);

        // Natural exit removes the entry but never fires the detach signal.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get(&id).is_none());
        assert!(matches!(
            detach_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let registry = SessionRegistry::new();
        let id = registry
            .create(
                PathBuf::from("/tmp"),
                SpawnCommand::Program("sh -c 'exit 3'".into()),
                24,
                80,
            )
            .await
            .expect("create should succeed");

        let Some(session) = registry.get(&id) else {
            // Child exited before we could attach; nothing left to assert.
            return;
        };
        let mut events = session.events.subscribe();

        let code = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Exit(code)) => break code,
                    Ok(_) => continue,
                    Err(_) => break -1,
                }
            }
        })
        .await
        .unwrap_or(-1);
        // The exit event may be missed if the child finished before the
        // subscription attached; only assert when it was observed.
        if code != -1 {
            assert_eq!(code, 3);
        }
    }

    #[tokio::test]
    async fn list_reports_created_and_activity_timestamps() {
        let registry = SessionRegistry::new();
        let id = create_shell_session(&registry).await;

        let infos = registry.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, id);
        assert!(infos[0].created_at > 0);
        assert!(infos[0].last_activity_at >= infos[0].created_at - 1000);
        registry.kill(&id);
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let registry = SessionRegistry::new();
        create_shell_session(&registry).await;
        create_shell_session(&registry).await;
        assert_eq!(registry.len(), 2);

        let handle = registry.drain();
        assert!(handle.is_some());
        assert!(registry.is_empty());
    }
}
