use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use super::error::ProcessError;

#[derive(Debug, Clone, Default)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Timeout,
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            _ => None,
        }
    }
}

/// Cloneable handle that asks a streaming child to die.
///
/// Safe to use from a task other than the one draining the output; the
/// request is a no-op once the child has exited.
#[derive(Clone)]
pub struct KillHandle {
    tx: mpsc::Sender<()>,
}

impl KillHandle {
    pub async fn kill(&self) {
        let _ = self.tx.send(()).await;
    }
}

/// A spawned child whose stdout is consumed line by line.
///
/// The `lines` channel closes when the child closes stdout; `wait` then
/// reports the exit status. The child is supervised by a manager task, so a
/// kill issued from another task never races the waiter.
pub struct StreamingChild {
    pub lines: mpsc::Receiver<String>,
    kill: KillHandle,
    status: oneshot::Receiver<Result<ExitStatus, ProcessError>>,
}

impl StreamingChild {
    pub fn kill_handle(&self) -> KillHandle {
        self.kill.clone()
    }

    pub async fn wait(self) -> Result<ExitStatus, ProcessError> {
        match self.status.await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Io(std::io::Error::other(
                "child supervisor dropped",
            ))),
        }
    }
}

fn exit_status_from(status: std::process::ExitStatus) -> ExitStatus {
    if status.success() {
        ExitStatus::Success
    } else if let Some(code) = status.code() {
        ExitStatus::Error(code)
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signal(signal);
            }
        }
        ExitStatus::Error(1)
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion, capturing stdout/stderr.
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;

    /// Spawn and stream stdout lines as they are produced.
    async fn spawn_streaming(&self, command: ProcessCommand)
        -> Result<StreamingChild, ProcessError>;
}

pub struct TokioProcessRunner;

impl TokioProcessRunner {
    fn build(command: &ProcessCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn(
        command: &ProcessCommand,
        mut cmd: tokio::process::Command,
    ) -> Result<tokio::process::Child, ProcessError> {
        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(command.program.clone())
            } else {
                ProcessError::Io(e)
            }
        })
    }
}

async fn feed_stdin(
    child: &mut tokio::process::Child,
    data: &Option<String>,
) -> Result<(), ProcessError> {
    if let Some(stdin_data) = data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_data.as_bytes())
                .await
                .map_err(ProcessError::Io)?;
            stdin.shutdown().await.map_err(ProcessError::Io)?;
        }
    }
    Ok(())
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let start = std::time::Instant::now();

        tracing::debug!(
            "Executing subprocess: {} {}",
            command.program,
            command.args.join(" ")
        );

        let mut cmd = Self::build(&command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        if command.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = Self::spawn(&command, cmd)?;
        feed_stdin(&mut child, &command.stdin).await?;

        let output = if let Some(timeout_duration) = command.timeout {
            match tokio::time::timeout(timeout_duration, child.wait_with_output()).await {
                Ok(result) => result.map_err(ProcessError::Io)?,
                Err(_) => return Err(ProcessError::Timeout(timeout_duration)),
            }
        } else {
            child.wait_with_output().await.map_err(ProcessError::Io)?
        };

        let duration = start.elapsed();
        let status = exit_status_from(output.status);

        match &status {
            ExitStatus::Success => {
                tracing::debug!(
                    "Subprocess completed in {:?}: {} {}",
                    duration,
                    command.program,
                    command.args.join(" ")
                );
            }
            other => {
                tracing::warn!(
                    "Subprocess failed ({:?}) in {:?}: {} {}",
                    other,
                    duration,
                    command.program,
                    command.args.join(" ")
                );
            }
        }

        Ok(ProcessOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration,
        })
    }

    async fn spawn_streaming(
        &self,
        command: ProcessCommand,
    ) -> Result<StreamingChild, ProcessError> {
        tracing::debug!(
            "Spawning streaming subprocess: {} {}",
            command.program,
            command.args.join(" ")
        );

        let mut cmd = Self::build(&command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        if command.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = Self::spawn(&command, cmd)?;
        feed_stdin(&mut child, &command.stdin).await?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::Io(std::io::Error::other("stdout not captured")))?;

        let (line_tx, line_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (status_tx, status_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = tokio::select! {
                status = child.wait() => {
                    status.map(exit_status_from).map_err(ProcessError::Io)
                }
                _ = kill_rx.recv() => {
                    let _ = child.kill().await;
                    child.wait().await.map(exit_status_from).map_err(ProcessError::Io)
                }
            };
            let _ = status_tx.send(result);
        });

        Ok(StreamingChild {
            lines: line_rx,
            kill: KillHandle { tx: kill_tx },
            status: status_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let runner = TokioProcessRunner;
        let out = runner
            .run(ProcessCommand::new("echo").arg("hello"))
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_reports_exit_code() {
        let runner = TokioProcessRunner;
        let out = runner
            .run(ProcessCommand::new("sh").args(["-c", "exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.status, ExitStatus::Error(3));
        assert_eq!(out.status.code(), Some(3));
    }

    #[tokio::test]
    async fn run_times_out() {
        let runner = TokioProcessRunner;
        let result = runner
            .run(
                ProcessCommand::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(ProcessError::Timeout(_))));
    }

    #[tokio::test]
    async fn run_missing_command() {
        let runner = TokioProcessRunner;
        let result = runner
            .run(ProcessCommand::new("this-command-does-not-exist-xyz"))
            .await;
        assert!(matches!(result, Err(ProcessError::CommandNotFound(_))));
    }

    #[tokio::test]
    async fn streaming_yields_lines_then_exit() {
        let runner = TokioProcessRunner;
        let mut child = runner
            .spawn_streaming(ProcessCommand::new("sh").args(["-c", "echo one; echo two"]))
            .await
            .unwrap();

        let mut collected = Vec::new();
        while let Some(line) = child.lines.recv().await {
            collected.push(line);
        }
        assert_eq!(collected, vec!["one", "two"]);
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn streaming_kill_stops_child() {
        let runner = TokioProcessRunner;
        let child = runner
            .spawn_streaming(ProcessCommand::new("sleep").arg("30"))
            .await
            .unwrap();
        child.kill_handle().kill().await;
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
