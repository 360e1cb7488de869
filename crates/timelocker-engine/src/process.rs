use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::command::EngineRequest;
use crate::error::EngineError;
use crate::events::{parse_event, EngineEvent, SummaryEvent};
use crate::version::{parse_version_output, EngineVersion, MIN_ENGINE_VERSION};

/// Cooperative cancellation flag, checked between engine events (never
/// mid-line) so the engine is never interrupted inside a write.
pub type CancelFlag = Arc<AtomicBool>;

pub fn cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

/// Captured result of a successful engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
    pub events: Vec<EngineEvent>,
}

impl EngineOutput {
    /// The terminal summary event. The engine emits it last on success.
    pub fn summary(&self) -> Option<&SummaryEvent> {
        self.events.iter().rev().find_map(|event| match event {
            EngineEvent::Summary(summary) => Some(summary),
            _ => None,
        })
    }
}

/// Seam between the orchestration layer and the engine process. Services
/// and orchestrators hold an `Arc<dyn EngineClient>`; tests substitute stubs.
#[async_trait]
pub trait EngineClient: Send + Sync + 'static {
    /// Engine version, probed once per process and gated against the
    /// pinned minimum.
    async fn version(&self) -> Result<EngineVersion, EngineError>;

    /// Run to completion, streaming parsed events to `events_tx` when given
    /// and honouring `cancel` at event boundaries.
    async fn run_streaming(
        &self,
        request: EngineRequest,
        cancel: CancelFlag,
        events_tx: Option<UnboundedSender<EngineEvent>>,
    ) -> Result<EngineOutput, EngineError>;

    /// Run to completion without streaming or cancellation.
    async fn run(&self, request: EngineRequest) -> Result<EngineOutput, EngineError> {
        self.run_streaming(request, cancel_flag(), None).await
    }
}

// ── Production implementation ─────────────────────────────────────────────────

/// Drives the `restic` binary: scrubbed child environment, line-streamed
/// JSON events, substring-classified failures.
pub struct ResticEngine {
    binary: String,
    min_version: EngineVersion,
    probed: OnceCell<EngineVersion>,
}

impl Default for ResticEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ResticEngine {
    pub fn new() -> Self {
        Self::with_binary("restic")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            min_version: MIN_ENGINE_VERSION,
            probed: OnceCell::new(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// One-shot capture for the version probe.
    async fn capture(&self, argv: &[&str]) -> Result<String, EngineError> {
        let output = Command::new(&self.binary)
            .args(argv)
            .env_clear()
            .envs(passthrough_env())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn probe_version(&self) -> Result<EngineVersion, EngineError> {
        debug!(binary = %self.binary, "probing engine version");
        let version = match self
            .capture(&["--json", "version"])
            .await
            .ok()
            .and_then(|stdout| parse_version_output(&stdout).ok())
        {
            Some(version) => version,
            None => {
                // Older engines print plain text for `version` even with the
                // global json flag set.
                let stdout = self.capture(&["version"]).await?;
                parse_version_output(&stdout)?
            }
        };

        if version < self.min_version {
            return Err(EngineError::VersionBelowMinimum {
                found: version.to_string(),
                minimum: self.min_version.to_string(),
            });
        }
        info!(binary = %self.binary, %version, "engine version verified");
        Ok(version)
    }

    fn spawn_error(&self, e: std::io::Error) -> EngineError {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::BinaryNotFound(self.binary.clone())
        } else {
            EngineError::Io(e)
        }
    }
}

#[async_trait]
impl EngineClient for ResticEngine {
    async fn version(&self) -> Result<EngineVersion, EngineError> {
        self.probed
            .get_or_try_init(|| self.probe_version())
            .await
            .copied()
    }

    async fn run_streaming(
        &self,
        request: EngineRequest,
        cancel: CancelFlag,
        events_tx: Option<UnboundedSender<EngineEvent>>,
    ) -> Result<EngineOutput, EngineError> {
        self.version().await?;

        let argv = request.to_argv();
        let env = request.scrubbed_env();
        debug!(
            binary = %self.binary,
            subcommand = request.subcommand_name(),
            "running engine command"
        );

        let mut child = Command::new(&self.binary)
            .args(&argv)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push_str(&line);
                buf.push('\n');
            }
            buf
        });

        let collect = async {
            let mut stdout_buf = String::new();
            let mut events = Vec::new();
            let mut lines = BufReader::new(stdout).lines();
            loop {
                if cancel.load(Ordering::Relaxed) {
                    return Err(EngineError::Cancelled);
                }
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        stdout_buf.push_str(&line);
                        stdout_buf.push('\n');
                        if let Some(event) = parse_event(&line) {
                            if let Some(tx) = &events_tx {
                                let _ = tx.send(event.clone());
                            }
                            events.push(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(EngineError::Io(e)),
                }
            }
            Ok((stdout_buf, events))
        };

        let collected = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(EngineError::Timeout(limit.as_secs()));
                }
            },
            None => collect.await,
        };

        let (stdout_buf, events) = match collected {
            Ok(collected) => collected,
            Err(e) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(e);
            }
        };

        let status = child.wait().await.map_err(EngineError::Io)?;
        let stderr_buf = stderr_task.await.unwrap_or_default();
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(binary = %self.binary, code, "engine exited non-zero");
            return Err(EngineError::classify_exit(code, &stderr_buf));
        }

        Ok(EngineOutput { stdout: stdout_buf, stderr: stderr_buf, events })
    }
}

fn passthrough_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in ["PATH", "HOME", "TMPDIR", "TEMP", "TMP"] {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    env
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    /// Write an executable fake engine script and return its path.
    fn fake_engine(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-restic");
        let script = format!(
            "#!/bin/sh\nif [ \"$2\" = \"version\" ]; then echo '{{\"version\":\"0.18.0\"}}'; exit 0; fi\n{}",
            body
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn version_gate_passes_for_pinned_minimum() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = ResticEngine::with_binary(fake_engine(tmp.path(), "exit 0"));
        let version = engine.version().await.unwrap();
        assert_eq!(version.to_string(), "0.18.0");
    }

    #[tokio::test]
    async fn version_gate_rejects_old_engines() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("old-restic");
        std::fs::write(&path, "#!/bin/sh\necho '{\"version\":\"0.17.3\"}'\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = ResticEngine::with_binary(path.display().to_string());
        assert!(matches!(
            engine.version().await,
            Err(EngineError::VersionBelowMinimum { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_such() {
        let engine = ResticEngine::with_binary("/definitely/not/restic");
        assert!(matches!(
            engine.version().await,
            Err(EngineError::BinaryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn streams_events_in_order_with_summary_last() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = fake_engine(
            tmp.path(),
            concat!(
                "echo '{\"message_type\":\"status\",\"percent_done\":0.5,\"files_done\":1}'\n",
                "echo '{\"message_type\":\"summary\",\"snapshot_id\":\"ab12cd34ef567890\",\"files_new\":3}'\n",
            ),
        );
        let engine = ResticEngine::with_binary(binary);

        let output = engine
            .run(EngineRequest::new("backup").repository("file:///tmp/r"))
            .await
            .unwrap();

        assert_eq!(output.events.len(), 2);
        assert!(matches!(output.events[0], EngineEvent::Status(_)));
        let summary = output.summary().unwrap();
        assert_eq!(summary.snapshot_id.as_deref(), Some("ab12cd34ef567890"));
        assert_eq!(summary.files_new, 3);
    }

    #[tokio::test]
    async fn nonzero_exit_is_classified_from_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = fake_engine(
            tmp.path(),
            "echo 'Fatal: repository is locked by PID 7' >&2\nexit 1\n",
        );
        let engine = ResticEngine::with_binary(binary);

        let result = engine.run(EngineRequest::new("backup")).await;
        assert!(matches!(result, Err(EngineError::RepositoryLocked)));
    }

    #[tokio::test]
    async fn cancellation_lands_between_events() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = fake_engine(
            tmp.path(),
            concat!(
                "i=0\n",
                "while [ $i -lt 100 ]; do\n",
                "  echo '{\"message_type\":\"status\",\"percent_done\":0.1}'\n",
                "  sleep 0.05\n",
                "  i=$((i+1))\n",
                "done\n",
            ),
        );
        let engine = ResticEngine::with_binary(binary);

        let cancel = cancel_flag();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let flag = cancel.clone();
        tokio::spawn(async move {
            // Flip the flag after the first event arrives.
            let _ = rx.recv().await;
            flag.store(true, Ordering::Relaxed);
        });

        let result = engine
            .run_streaming(EngineRequest::new("backup"), cancel, Some(tx))
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = fake_engine(tmp.path(), "sleep 30\n");
        let engine = ResticEngine::with_binary(binary);

        let request = EngineRequest::new("check").timeout(Duration::from_millis(200));
        let result = engine.run(request).await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[tokio::test]
    async fn child_env_is_scrubbed() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = fake_engine(
            tmp.path(),
            "echo \"{\\\"message_type\\\":\\\"other\\\",\\\"leak\\\":\\\"${TIMELOCKER_PARENT_SECRET:-clean}\\\"}\"\n",
        );
        std::env::set_var("TIMELOCKER_PARENT_SECRET", "oops");
        let engine = ResticEngine::with_binary(binary);
        let output = engine.run(EngineRequest::new("backup")).await.unwrap();
        std::env::remove_var("TIMELOCKER_PARENT_SECRET");

        match &output.events[0] {
            EngineEvent::Other { raw, .. } => assert_eq!(raw["leak"], "clean"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
