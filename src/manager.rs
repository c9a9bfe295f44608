use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::sentinel::RunSentinel;

/// Default bound on one CLI invocation. A hung external process would
/// otherwise wedge the FIFO queue indefinitely.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// How the manager invokes the external CLI agent.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// The CLI binary.
    pub program: String,
    /// Fixed arguments passed on every invocation.
    pub args: Vec<String>,
    /// Instruction preamble composed with each command's text to form the
    /// prompt fed on the child's stdin.
    pub prompt_preamble: String,
    /// Bound on a single invocation; the child is killed when exceeded.
    pub command_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            program: "agent".to_string(),
            args: vec![],
            prompt_preamble: "Execute the following instruction and print a single JSON \
                              document describing the result."
                .to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Outcome events emitted by the processing loop.
///
/// These are the only way a command's result is observable — submission is
/// fire-and-forget and nothing is reported back to the submitter directly.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Exit 0 and stdout parsed as a single JSON document.
    Result {
        command: String,
        value: serde_json::Value,
    },
    /// Exit 0 but stdout was not valid JSON; raw output delivered instead.
    Text { command: String, output: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invocation exceeded {0:?} and was killed")]
    Timeout(Duration),

    #[error("CLI exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("io error talking to CLI: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire shape of `status()`: `running` reflects only the sentinel's current
/// existence. It is not a liveness check — it cannot distinguish "idle but
/// initialized" from "executing a command", nor detect a sentinel left by a
/// crashed process. `pid` is always null.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

struct ManagerInner {
    config: ManagerConfig,
    sentinel: RunSentinel,
    queue_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    stop_token: parking_lot::Mutex<Option<CancellationToken>>,
    /// Single-flight guard: true exactly while one invocation is running.
    processing: AtomicBool,
    /// True only in the worker whose `start()` created the sentinel file.
    owns_sentinel: AtomicBool,
    events_tx: broadcast::Sender<ManagerEvent>,
}

/// The command queue driver ("the manager").
///
/// Serializes free-form text commands into sequential one-shot invocations
/// of the external CLI, strictly FIFO and one at a time within this worker.
/// The filesystem sentinel coordinates "initialized" across workers: it is
/// acquired with create-exclusive semantics, so only the worker that wins
/// the sentinel runs a processing loop. Queue entries live in memory only
/// and are lost on crash or restart.
#[derive(Clone)]
pub struct CommandManager {
    inner: Arc<ManagerInner>,
}

impl CommandManager {
    pub fn new(config: ManagerConfig, sentinel: RunSentinel) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                sentinel,
                queue_tx: parking_lot::Mutex::new(None),
                stop_token: parking_lot::Mutex::new(None),
                processing: AtomicBool::new(false),
                owns_sentinel: AtomicBool::new(false),
                events_tx,
            }),
        }
    }

    /// Idempotent start.
    ///
    /// If the sentinel already indicates initialization (whether by this
    /// worker, another worker, or a crashed process), this is a no-op and
    /// returns `false`. Otherwise the sentinel is acquired atomically and
    /// the processing loop is spawned; returns `true`.
    pub fn start(&self) -> std::io::Result<bool> {
        if self.inner.queue_tx.lock().is_some() {
            tracing::debug!("manager already running in this worker");
            return Ok(false);
        }
        if !self.inner.sentinel.acquire()? {
            tracing::info!(
                path = %self.inner.sentinel.path().display(),
                "manager sentinel already present; not starting a queue here"
            );
            return Ok(false);
        }

        self.inner.owns_sentinel.store(true, Ordering::Release);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        *self.inner.queue_tx.lock() = Some(tx);
        *self.inner.stop_token.lock() = Some(token.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.process_loop(rx, token).await;
        });
        tracing::info!("manager started");
        Ok(true)
    }

    /// Release the sentinel and stop dequeuing.
    ///
    /// An explicit stop clears the sentinel unconditionally, even when
    /// another worker created it — this is the operator's lever for
    /// clearing a stale flag. Never terminates an already-spawned
    /// invocation; only future dequeues are cancelled and queued entries
    /// are discarded.
    pub fn stop(&self) -> std::io::Result<()> {
        self.inner.sentinel.release()?;
        self.inner.owns_sentinel.store(false, Ordering::Release);
        if let Some(token) = self.inner.stop_token.lock().take() {
            token.cancel();
        }
        self.inner.queue_tx.lock().take();
        tracing::info!("manager stopped");
        Ok(())
    }

    /// Process-exit teardown: stop dequeuing, and release the sentinel only
    /// if this worker created it. A worker that lost the `start()` race
    /// must not clear the owning worker's flag on its way down.
    pub fn shutdown(&self) -> std::io::Result<()> {
        if let Some(token) = self.inner.stop_token.lock().take() {
            token.cancel();
        }
        self.inner.queue_tx.lock().take();
        if self.inner.owns_sentinel.swap(false, Ordering::AcqRel) {
            self.inner.sentinel.release()?;
            tracing::info!("manager shut down, sentinel released");
        }
        Ok(())
    }

    /// Enqueue a command. Fire-and-forget: success or failure of this
    /// specific command is never reported back to the caller; outcomes are
    /// observable only via [`subscribe`](Self::subscribe) or logs.
    ///
    /// A command submitted while the manager is not running in this worker
    /// is dropped (logged), not enqueued.
    pub fn send_command(&self, text: impl Into<String>) {
        let text = text.into();
        let queue = self.inner.queue_tx.lock();
        match queue.as_ref() {
            Some(tx) => {
                if tx.send(text).is_err() {
                    tracing::error!("manager queue closed; command dropped");
                }
            }
            None => {
                tracing::warn!(command = %text, "manager not running; command dropped");
            }
        }
    }

    /// Current run state per the sentinel.
    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            running: self.inner.sentinel.exists(),
            pid: None,
        }
    }

    /// True exactly while an invocation is in flight. Test hook for the
    /// single-flight guarantee; not part of `status()`.
    pub fn processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Subscribe to command outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events_tx.subscribe()
    }

    async fn process_loop(
        &self,
        mut rx: mpsc::UnboundedReceiver<String>,
        token: CancellationToken,
    ) {
        loop {
            let command = tokio::select! {
                _ = token.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            self.inner.processing.store(true, Ordering::Release);
            // One failing command never blocks the rest of the queue: the
            // error is recorded and the loop proceeds.
            if let Err(e) = self.run_one(&command).await {
                tracing::error!(command = %command, error = %e, "command invocation failed");
            }
            self.inner.processing.store(false, Ordering::Release);
        }
        tracing::debug!("manager processing loop exited");
    }

    /// One invocation: compose the prompt, spawn the CLI, feed stdin, and
    /// interpret the captured output.
    async fn run_one(&self, command: &str) -> Result<(), ManagerError> {
        let config = &self.inner.config;
        let prompt = compose_prompt(&config.prompt_preamble, command);

        let mut child = tokio::process::Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ManagerError::Spawn {
                program: config.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            // Drop closes stdin, signaling EOF to the child.
        }

        // kill_on_drop ensures the child is killed when the timeout drops
        // the wait future.
        let output = tokio::time::timeout(config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| ManagerError::Timeout(config.command_timeout))??;

        if !output.status.success() {
            return Err(ManagerError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        match serde_json::from_str::<serde_json::Value>(stdout.trim()) {
            Ok(value) => {
                tracing::info!(command = %command, "command produced JSON result");
                let _ = self.inner.events_tx.send(ManagerEvent::Result {
                    command: command.to_string(),
                    value,
                });
            }
            Err(_) => {
                // Malformed-but-present output degrades to raw text, never
                // a hard failure.
                tracing::info!(command = %command, "command produced non-JSON output");
                let _ = self.inner.events_tx.send(ManagerEvent::Text {
                    command: command.to_string(),
                    output: stdout,
                });
            }
        }
        Ok(())
    }
}

fn compose_prompt(preamble: &str, command: &str) -> String {
    if preamble.is_empty() {
        command.to_string()
    } else {
        format!("{preamble}\n\n{command}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_manager(script: &str, timeout: Duration) -> (tempfile::TempDir, CommandManager) {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = RunSentinel::new(dir.path().join("manager.run"));
        let config = ManagerConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            prompt_preamble: String::new(),
            command_timeout: timeout,
        };
        (dir, CommandManager::new(config, sentinel))
    }

    async fn wait_until_idle(manager: &CommandManager) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !manager.processing() {
                // Allow the loop to pick up any queued entry.
                tokio::time::sleep(Duration::from_millis(50)).await;
                if !manager.processing() {
                    return;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "manager never went idle"
            );
        }
    }

    #[test]
    fn compose_prompt_joins_preamble_and_command() {
        assert_eq!(compose_prompt("", "do it"), "do it");
        assert_eq!(compose_prompt("rules", "do it"), "rules\n\ndo it");
    }

    #[tokio::test]
    async fn status_tracks_start_and_stop() {
        let (_dir, manager) = test_manager("cat > /dev/null", Duration::from_secs(5));
        assert!(!manager.status().running);

        assert!(manager.start().unwrap());
        assert!(manager.status().running);
        assert!(manager.status().pid.is_none());

        manager.stop().unwrap();
        assert!(!manager.status().running);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (_dir, manager) = test_manager("cat > /dev/null", Duration::from_secs(5));
        assert!(manager.start().unwrap());
        assert!(!manager.start().unwrap());
        manager.stop().unwrap();
    }

    #[tokio::test]
    async fn command_before_start_is_not_enqueued() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let script = format!("cat >> {}", out.display());
        let sentinel = RunSentinel::new(dir.path().join("manager.run"));
        let manager = CommandManager::new(
            ManagerConfig {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script],
                prompt_preamble: String::new(),
                command_timeout: Duration::from_secs(5),
            },
            sentinel,
        );

        manager.send_command("dropped");
        manager.start().unwrap();
        manager.send_command("kept");
        wait_until_idle(&manager).await;
        manager.stop().unwrap();

        let contents = std::fs::read_to_string(&out).unwrap_or_default();
        assert!(contents.contains("kept"));
        assert!(!contents.contains("dropped"));
    }

    #[tokio::test]
    async fn commands_run_fifo_with_no_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        // Each invocation brackets its command with < and >. Any temporal
        // overlap between two invocations would interleave the markers.
        let script = format!(
            "cmd=$(cat); printf '<%s' \"$cmd\" >> {out}; sleep 0.05; printf '>' >> {out}",
            out = out.display()
        );
        let sentinel = RunSentinel::new(dir.path().join("manager.run"));
        let manager = CommandManager::new(
            ManagerConfig {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script],
                prompt_preamble: String::new(),
                command_timeout: Duration::from_secs(5),
            },
            sentinel,
        );

        manager.start().unwrap();
        for cmd in ["a", "b", "c", "d"] {
            manager.send_command(cmd);
        }
        wait_until_idle(&manager).await;
        manager.stop().unwrap();

        let contents = std::fs::read_to_string(&out).unwrap_or_default();
        assert_eq!(contents, "<a><b><c><d>");
    }

    #[tokio::test]
    async fn failing_command_does_not_stall_the_queue() {
        let script = r#"cmd=$(cat); if [ "$cmd" = "fail" ]; then exit 1; fi; printf '{"ok":true}'"#;
        let (_dir, manager) = test_manager(script, Duration::from_secs(5));
        let mut events = manager.subscribe();

        manager.start().unwrap();
        manager.send_command("fail");
        manager.send_command("good");

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event should arrive despite the earlier failure")
            .expect("event channel should be alive");
        match event {
            ManagerEvent::Result { command, value } => {
                assert_eq!(command, "good");
                assert_eq!(value["ok"], serde_json::json!(true));
            }
            other => panic!("expected Result event, got: {other:?}"),
        }
        manager.stop().unwrap();
    }

    #[tokio::test]
    async fn json_stdout_emits_result_event() {
        let (_dir, manager) = test_manager(
            r#"cat > /dev/null; printf '{"answer":42}'"#,
            Duration::from_secs(5),
        );
        let mut events = manager.subscribe();

        manager.start().unwrap();
        manager.send_command("ask");

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ManagerEvent::Result { value, .. } => {
                assert_eq!(value["answer"], serde_json::json!(42));
            }
            other => panic!("expected Result event, got: {other:?}"),
        }
        manager.stop().unwrap();
    }

    #[tokio::test]
    async fn malformed_stdout_degrades_to_text_event() {
        let (_dir, manager) = test_manager(
            "cat > /dev/null; printf 'plain words, not json'",
            Duration::from_secs(5),
        );
        let mut events = manager.subscribe();

        manager.start().unwrap();
        manager.send_command("ask");

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ManagerEvent::Text { output, .. } => {
                assert_eq!(output, "plain words, not json");
            }
            other => panic!("expected Text event, got: {other:?}"),
        }
        manager.stop().unwrap();
    }

    #[tokio::test]
    async fn hung_invocation_is_timed_out_and_queue_continues() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        // "hang" ignores stdin EOF and sleeps well past the timeout.
        let script = format!(
            "cmd=$(cat); if [ \"$cmd\" = hang ]; then sleep 30; fi; printf '%s' \"$cmd\" >> {}",
            out.display()
        );
        let sentinel = RunSentinel::new(dir.path().join("manager.run"));
        let manager = CommandManager::new(
            ManagerConfig {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script],
                prompt_preamble: String::new(),
                command_timeout: Duration::from_millis(200),
            },
            sentinel,
        );

        manager.start().unwrap();
        manager.send_command("hang");
        manager.send_command("after");
        wait_until_idle(&manager).await;
        manager.stop().unwrap();

        let contents = std::fs::read_to_string(&out).unwrap_or_default();
        assert!(
            contents.contains("after"),
            "queue should continue past the hung command, got: {contents:?}"
        );
        assert!(!contents.contains("hang"));
    }

    #[tokio::test]
    async fn spawn_failure_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = RunSentinel::new(dir.path().join("manager.run"));
        let manager = CommandManager::new(
            ManagerConfig {
                program: "/no/such/binary".to_string(),
                args: vec![],
                prompt_preamble: String::new(),
                command_timeout: Duration::from_secs(1),
            },
            sentinel,
        );

        manager.start().unwrap();
        manager.send_command("anything");
        wait_until_idle(&manager).await;
        // The loop survives the spawn failure; status still reflects the
        // sentinel.
        assert!(manager.status().running);
        manager.stop().unwrap();
    }

    #[tokio::test]
    async fn sentinel_held_elsewhere_means_no_local_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.run");
        // Another worker already owns the sentinel.
        RunSentinel::new(path.clone()).acquire().unwrap();

        let manager = CommandManager::new(
            ManagerConfig {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
                prompt_preamble: String::new(),
                command_timeout: Duration::from_secs(1),
            },
            RunSentinel::new(path),
        );

        assert!(!manager.start().unwrap());
        // status reports running (sentinel exists) even though this worker
        // will not accept commands — the documented sentinel limitation.
        assert!(manager.status().running);
        manager.send_command("dropped");
        assert!(!manager.processing());
    }

    #[tokio::test]
    async fn shutdown_releases_owned_sentinel() {
        let (_dir, manager) = test_manager("cat > /dev/null", Duration::from_secs(5));
        assert!(manager.start().unwrap());
        assert!(manager.status().running);

        manager.shutdown().unwrap();
        assert!(!manager.status().running);
    }

    #[tokio::test]
    async fn shutdown_preserves_sentinel_owned_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.run");
        // Another worker owns the sentinel.
        RunSentinel::new(path.clone()).acquire().unwrap();

        let manager = CommandManager::new(
            ManagerConfig {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
                prompt_preamble: String::new(),
                command_timeout: Duration::from_secs(1),
            },
            RunSentinel::new(path.clone()),
        );
        assert!(!manager.start().unwrap());

        // A non-owning worker going down must not clear the owner's flag.
        manager.shutdown().unwrap();
        assert!(RunSentinel::new(path).exists());
    }

    #[tokio::test]
    async fn explicit_stop_clears_even_a_foreign_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.run");
        RunSentinel::new(path.clone()).acquire().unwrap();

        let manager = CommandManager::new(
            ManagerConfig {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
                prompt_preamble: String::new(),
                command_timeout: Duration::from_secs(1),
            },
            RunSentinel::new(path.clone()),
        );
        assert!(!manager.start().unwrap());

        // stop() is the operator's lever for clearing a stale flag.
        manager.stop().unwrap();
        assert!(!RunSentinel::new(path).exists());
    }
}
