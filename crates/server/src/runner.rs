//! Process runner: drives one external agent process per operation.
//!
//! Output is consumed as a `LineSource`: a lazy, finite, non-restartable
//! stream of raw lines merged from the child's stdout and stderr. stdout lines
//! are classified and appended to the operation log; stderr only feeds a
//! bounded diagnostic tail. The runner never waits on observers.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use specstream_protocol::{ExitOutcome, MessageType, OperationStatus};

use crate::classifier::{strip_ansi, LineClassifier};
use crate::registry::{capitalize, OperationRegistry, RegistryError, TypedLine};

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

const DIAGNOSTIC_TAIL_LINES: usize = 20;
const DIAGNOSTIC_TAIL_BYTES: usize = 4 * 1024;
const DIAGNOSTIC_EXCERPT_CHARS: usize = 1000;
const MAX_ARTIFACT_BYTES: usize = 1024 * 1024;

/// A credential value that never shows up in `Debug` output
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// What to run for an operation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Injected through the environment only, never as arguments
    pub credentials: Vec<(String, Secret)>,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: Vec::new(),
            credentials: Vec::new(),
            timeout,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn credential(mut self, name: &str, value: Secret) -> Self {
        self.credentials.push((name.to_string(), value));
        self
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("process timed out after {0:?}")]
    ProcessTimeout(Duration),
    #[error("process exited with code {0:?}")]
    ProcessNonZeroExit(Option<i32>),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One line of raw process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Stdout(String),
    Stderr(String),
}

/// Merged line stream over a child's stdout and stderr.
/// Ends once both pipes reach end-of-stream.
pub struct LineSource {
    rx: mpsc::Receiver<RawLine>,
}

impl LineSource {
    pub fn from_child(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_pipe_reader(stdout, tx.clone(), RawLine::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_pipe_reader(stderr, tx, RawLine::Stderr);
        }
        Self { rx }
    }
}

impl Stream for LineSource {
    type Item = RawLine;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RawLine>> {
        self.rx.poll_recv(cx)
    }
}

fn spawn_pipe_reader<R>(pipe: R, tx: mpsc::Sender<RawLine>, wrap: fn(String) -> RawLine)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(wrap(line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(
                        component = "runner",
                        event = "runner.pipe.read_error",
                        error = %e,
                        "Error reading process output"
                    );
                    return;
                }
            }
        }
    });
}

/// Last few stderr lines, bounded by count and size
#[derive(Debug, Default)]
struct DiagnosticTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl DiagnosticTail {
    fn push(&mut self, line: &str) {
        let line = strip_ansi(line).trim_end().to_string();
        if line.is_empty() {
            return;
        }
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.lines.len() > DIAGNOSTIC_TAIL_LINES || self.bytes > DIAGNOSTIC_TAIL_BYTES {
            match self.lines.pop_front() {
                Some(dropped) => self.bytes -= dropped.len(),
                None => break,
            }
        }
    }

    /// Bounded excerpt safe to show to a client
    fn excerpt(&self) -> String {
        let joined = self.lines.iter().cloned().collect::<Vec<_>>().join("\n");
        let skip = joined.chars().count().saturating_sub(DIAGNOSTIC_EXCERPT_CHARS);
        joined.chars().skip(skip).collect()
    }
}

/// Accumulates the document text the agent writes to stdout
#[derive(Debug, Default)]
struct ArtifactBuffer {
    text: String,
    truncated: bool,
}

impl ArtifactBuffer {
    fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let line = strip_ansi(line);
        let line = line.trim_end();
        if self.text.len() + line.len() + 1 > MAX_ARTIFACT_BYTES {
            self.truncated = true;
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn finish(self) -> String {
        self.text.trim().to_string()
    }
}

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    WaitFailed(std::io::Error),
}

/// Runs agent processes and records their output in the registry
#[derive(Clone)]
pub struct ProcessRunner {
    registry: Arc<OperationRegistry>,
    classifier: Arc<dyn LineClassifier>,
}

impl ProcessRunner {
    pub fn new(registry: Arc<OperationRegistry>, classifier: Arc<dyn LineClassifier>) -> Self {
        Self {
            registry,
            classifier,
        }
    }

    /// Run `spec` to completion for `operation_id`.
    ///
    /// The operation always ends terminal: `completed` on exit code zero,
    /// `failed` on non-zero exit, spawn failure or timeout.
    pub async fn run(&self, operation_id: &str, spec: CommandSpec) -> Result<ExitOutcome, RunnerError> {
        let label = capitalize(self.registry.summary(operation_id).await?.kind.label());
        self.registry
            .transition(operation_id, OperationStatus::Running, None)
            .await?;

        info!(
            component = "runner",
            event = "runner.spawn",
            operation_id = %operation_id,
            program = %spec.program,
            args = spec.args.len(),
            timeout_secs = spec.timeout.as_secs(),
            "Spawning agent process"
        );

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(
                spec.credentials
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.expose())),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                warn!(
                    component = "runner",
                    event = "runner.spawn_failed",
                    operation_id = %operation_id,
                    program = %spec.program,
                    error = %source,
                    "Failed to spawn agent process"
                );
                let outcome = ExitOutcome::SpawnFailed {
                    reason: source.kind().to_string(),
                };
                self.fail(operation_id, &label, "The agent could not be started.".to_string(), outcome)
                    .await?;
                return Err(RunnerError::Spawn {
                    program: spec.program,
                    source,
                });
            }
        };

        let deadline = Instant::now() + spec.timeout;
        let mut source = LineSource::from_child(&mut child);
        let mut diagnostics = DiagnosticTail::default();
        let mut artifact = ArtifactBuffer::default();
        let mut stdout_lines = 0usize;

        let ending = loop {
            match tokio::time::timeout_at(deadline, source.next()).await {
                Ok(Some(RawLine::Stdout(line))) => {
                    stdout_lines += 1;
                    let Some(classified) = self.classifier.classify(&line) else {
                        artifact.push_line(&line);
                        continue;
                    };
                    if classified.message_type == MessageType::Execution {
                        artifact.push_line(&line);
                    }
                    let appended = self
                        .registry
                        .append(
                            operation_id,
                            TypedLine::agent(classified.message_type, classified.content),
                        )
                        .await;
                    if let Err(e) = appended {
                        // Aborted from outside; the log is already closed.
                        warn!(
                            component = "runner",
                            event = "runner.append_rejected",
                            operation_id = %operation_id,
                            error = %e,
                            "Operation closed while running, stopping agent"
                        );
                        terminate(&mut child, spec.kill_grace).await;
                        return Err(e.into());
                    }
                }
                Ok(Some(RawLine::Stderr(line))) => {
                    debug!(
                        component = "runner",
                        event = "runner.stderr",
                        operation_id = %operation_id,
                        line = %line,
                        "Agent stderr"
                    );
                    diagnostics.push(&line);
                }
                Ok(None) => match tokio::time::timeout_at(deadline, child.wait()).await {
                    Ok(Ok(status)) => break Ending::Exited(status),
                    Ok(Err(e)) => break Ending::WaitFailed(e),
                    Err(_) => break Ending::TimedOut,
                },
                Err(_) => break Ending::TimedOut,
            }
        };

        match ending {
            Ending::Exited(status) if status.success() => {
                let exit_code = status.code().unwrap_or(0);
                info!(
                    component = "runner",
                    event = "runner.exited",
                    operation_id = %operation_id,
                    exit_code = exit_code,
                    stdout_lines = stdout_lines,
                    "Agent process finished"
                );
                self.registry
                    .set_artifact(operation_id, artifact.finish())
                    .await?;
                self.registry
                    .append(
                        operation_id,
                        TypedLine::system(
                            MessageType::Complete,
                            format!("{label} generation complete. Review and save when ready."),
                        )
                        .with_extra("success", true),
                    )
                    .await?;
                let outcome = ExitOutcome::Success { exit_code };
                self.registry
                    .transition(operation_id, OperationStatus::Completed, Some(outcome.clone()))
                    .await?;
                Ok(outcome)
            }
            Ending::Exited(status) => {
                let exit_code = status.code();
                let diagnostic = diagnostics.excerpt();
                warn!(
                    component = "runner",
                    event = "runner.exited_non_zero",
                    operation_id = %operation_id,
                    exit_code = ?exit_code,
                    "Agent process failed"
                );
                let outcome = ExitOutcome::NonZeroExit {
                    exit_code,
                    diagnostic: diagnostic.clone(),
                };
                let mut content = format!("{label} generation failed: {}.", outcome.summary());
                if !diagnostic.is_empty() {
                    content.push('\n');
                    content.push_str(&diagnostic);
                }
                self.fail(operation_id, &label, content, outcome).await?;
                Err(RunnerError::ProcessNonZeroExit(exit_code))
            }
            Ending::TimedOut => {
                warn!(
                    component = "runner",
                    event = "runner.timeout",
                    operation_id = %operation_id,
                    timeout_secs = spec.timeout.as_secs(),
                    "Agent process timed out, terminating"
                );
                terminate(&mut child, spec.kill_grace).await;
                let outcome = ExitOutcome::Timeout {
                    after_secs: spec.timeout.as_secs(),
                };
                self.fail(
                    operation_id,
                    &label,
                    format!(
                        "Operation timed out after {} seconds.",
                        spec.timeout.as_secs()
                    ),
                    outcome,
                )
                .await?;
                Err(RunnerError::ProcessTimeout(spec.timeout))
            }
            Ending::WaitFailed(e) => {
                warn!(
                    component = "runner",
                    event = "runner.wait_failed",
                    operation_id = %operation_id,
                    error = %e,
                    "Lost track of agent process"
                );
                terminate(&mut child, spec.kill_grace).await;
                self.fail(
                    operation_id,
                    &label,
                    format!("{label} generation failed: the agent process was lost."),
                    ExitOutcome::Aborted {
                        reason: "process wait failed".to_string(),
                    },
                )
                .await?;
                Err(RunnerError::Io(e))
            }
        }
    }

    /// Append `error` then `complete` and transition to `failed`.
    async fn fail(
        &self,
        operation_id: &str,
        label: &str,
        error_content: String,
        outcome: ExitOutcome,
    ) -> Result<(), RegistryError> {
        self.registry
            .append(
                operation_id,
                TypedLine::system(MessageType::Error, error_content),
            )
            .await?;
        self.registry
            .append(
                operation_id,
                TypedLine::system(MessageType::Complete, format!("{label} generation failed."))
                    .with_extra("success", false),
            )
            .await?;
        self.registry
            .transition(operation_id, OperationStatus::Failed, Some(outcome))
            .await?;
        Ok(())
    }
}

/// SIGTERM, then SIGKILL if the process outlives `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we spawned and still own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        debug!(
            component = "runner",
            event = "runner.kill_failed",
            error = %e,
            "Failed to kill agent process"
        );
    }
}

#[cfg(test)]
mod tests {
    use specstream_protocol::{OperationKind, StreamMessage};

    use super::*;
    use crate::classifier::HeuristicClassifier;
    use crate::registry::tests::registry_with;
    use crate::registry::{RetentionConfig, TerminalEvent};

    fn sh(script: &str, timeout: Duration) -> CommandSpec {
        let mut spec = CommandSpec::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
            timeout,
        );
        spec.kill_grace = Duration::from_millis(200);
        spec
    }

    async fn setup(
        id: &str,
    ) -> (
        ProcessRunner,
        Arc<OperationRegistry>,
        mpsc::UnboundedReceiver<TerminalEvent>,
    ) {
        let (registry, rx) = registry_with(RetentionConfig::default());
        registry
            .create(id, OperationKind::GenerateSpec, None)
            .expect("create");
        let runner = ProcessRunner::new(registry.clone(), Arc::new(HeuristicClassifier));
        (runner, registry, rx)
    }

    fn types(log: &[StreamMessage]) -> Vec<MessageType> {
        log.iter().map(|m| m.message_type).collect()
    }

    #[tokio::test]
    async fn successful_run_completes_with_artifact() {
        let (runner, registry, mut rx) = setup("op-1").await;
        let script = "echo 'Thinking: outline sections'; echo '# Login spec'; echo; echo 'Users sign in.'";

        let outcome = runner
            .run("op-1", sh(script, Duration::from_secs(10)))
            .await
            .expect("run");
        assert_eq!(outcome, ExitOutcome::Success { exit_code: 0 });

        let log = registry.snapshot("op-1", None).await.expect("snapshot");
        assert_eq!(
            types(&log),
            vec![
                MessageType::Thinking,
                MessageType::Execution,
                MessageType::Execution,
                MessageType::Complete
            ]
        );
        let sequences: Vec<u64> = log.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(log[3].metadata.extra["success"], true);

        let summary = registry.summary("op-1").await.expect("summary");
        assert_eq!(summary.status, OperationStatus::Completed);

        let event = rx.recv().await.expect("terminal event");
        assert_eq!(
            event.artifact.as_deref(),
            Some("# Login spec\n\nUsers sign in.")
        );
    }

    #[tokio::test]
    async fn non_zero_exit_ends_with_error_then_complete() {
        let (runner, registry, mut rx) = setup("op-1").await;
        let script = "echo 'partial output'; echo 'model quota exhausted' >&2; exit 3";

        let err = runner
            .run("op-1", sh(script, Duration::from_secs(10)))
            .await
            .expect_err("non-zero exit");
        assert!(matches!(err, RunnerError::ProcessNonZeroExit(Some(3))));

        let log = registry.snapshot("op-1", None).await.expect("snapshot");
        assert_eq!(
            types(&log),
            vec![
                MessageType::Execution,
                MessageType::Error,
                MessageType::Complete
            ]
        );
        assert!(log[1].content.contains("exited with code 3"));
        assert!(log[1].content.contains("model quota exhausted"));
        assert_eq!(log[2].metadata.extra["success"], false);

        let summary = registry.summary("op-1").await.expect("summary");
        assert_eq!(summary.status, OperationStatus::Failed);
        assert!(matches!(
            summary.exit_outcome,
            Some(ExitOutcome::NonZeroExit {
                exit_code: Some(3),
                ..
            })
        ));

        let event = rx.recv().await.expect("terminal event");
        assert!(event.artifact.is_none());
    }

    #[tokio::test]
    async fn timeout_terminates_and_fails() {
        let (runner, registry, _rx) = setup("op-1").await;

        let err = runner
            .run("op-1", sh("echo started; exec sleep 30", Duration::from_millis(300)))
            .await
            .expect_err("timeout");
        assert!(matches!(err, RunnerError::ProcessTimeout(_)));

        let log = registry.snapshot("op-1", None).await.expect("snapshot");
        assert_eq!(
            types(&log),
            vec![
                MessageType::Execution,
                MessageType::Error,
                MessageType::Complete
            ]
        );
        assert!(log[1].content.contains("timed out"));
        let summary = registry.summary("op-1").await.expect("summary");
        assert!(matches!(
            summary.exit_outcome,
            Some(ExitOutcome::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn credentials_reach_the_environment_only() {
        let (runner, registry, _rx) = setup("op-1").await;
        let spec = sh("printf '%s\\n' \"$GH_TOKEN\"", Duration::from_secs(10))
            .credential("GH_TOKEN", Secret::new("ghp_secret"));

        assert!(!spec.args.iter().any(|arg| arg.contains("ghp_secret")));
        assert!(!format!("{spec:?}").contains("ghp_secret"));

        runner.run("op-1", spec).await.expect("run");
        let log = registry.snapshot("op-1", None).await.expect("snapshot");
        assert_eq!(log[0].content, "ghp_secret");
    }

    #[tokio::test]
    async fn spawn_failure_fails_the_operation() {
        let (runner, registry, _rx) = setup("op-1").await;
        let spec = CommandSpec::new(
            "/nonexistent/agent-binary",
            Vec::new(),
            Duration::from_secs(5),
        );

        let err = runner.run("op-1", spec).await.expect_err("spawn failure");
        assert!(matches!(err, RunnerError::Spawn { .. }));

        let summary = registry.summary("op-1").await.expect("summary");
        assert_eq!(summary.status, OperationStatus::Failed);
        assert!(matches!(
            summary.exit_outcome,
            Some(ExitOutcome::SpawnFailed { .. })
        ));
        let log = registry.snapshot("op-1", None).await.expect("snapshot");
        assert_eq!(types(&log), vec![MessageType::Error, MessageType::Complete]);
    }

    #[tokio::test]
    async fn abort_stops_the_process() {
        let (runner, registry, _rx) = setup("op-1").await;
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run(
                        "op-1",
                        sh(
                            "while true; do echo tick; sleep 0.05; done",
                            Duration::from_secs(30),
                        ),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.abort("op-1", "shutdown").await.expect("abort");

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("runner stops")
            .expect("runner task");
        assert!(matches!(
            result,
            Err(RunnerError::Registry(RegistryError::Closed(OperationStatus::Failed)))
        ));
        let log = registry.snapshot("op-1", None).await.expect("snapshot");
        assert_eq!(log.last().map(|m| m.message_type), Some(MessageType::Complete));
    }

    #[test]
    fn diagnostic_tail_is_bounded() {
        let mut tail = DiagnosticTail::default();
        for i in 0..100 {
            tail.push(&format!("warning line {i}"));
        }
        assert_eq!(tail.lines.len(), DIAGNOSTIC_TAIL_LINES);
        assert!(tail.excerpt().ends_with("warning line 99"));
        assert!(tail.excerpt().chars().count() <= DIAGNOSTIC_EXCERPT_CHARS);
    }
}
