use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::ProcessError;
use super::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, StreamingChild};

/// Scripted process runner for tests.
///
/// Responses are matched by program name in FIFO order; unmatched commands
/// fail the test with `MockExpectationNotMet`. Call history is retained for
/// assertions.
#[derive(Clone, Default)]
pub struct MockProcessRunner {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    call_history: Arc<Mutex<Vec<ProcessCommand>>>,
}

struct MockResponse {
    program: String,
    output: ProcessOutput,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success(&self, program: &str, stdout: &str) {
        self.push_response(program, ExitStatus::Success, stdout, "");
    }

    pub fn push_failure(&self, program: &str, code: i32, stderr: &str) {
        self.push_response(program, ExitStatus::Error(code), "", stderr);
    }

    pub fn push_response(&self, program: &str, status: ExitStatus, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().push_back(MockResponse {
            program: program.to_string(),
            output: ProcessOutput {
                status,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                duration: Duration::from_millis(5),
            },
        });
    }

    pub fn call_history(&self) -> Vec<ProcessCommand> {
        self.call_history.lock().unwrap().clone()
    }

    pub fn calls_for(&self, program: &str) -> usize {
        self.call_history
            .lock()
            .unwrap()
            .iter()
            .filter(|cmd| cmd.program == program)
            .count()
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        self.call_history.lock().unwrap().push(command.clone());

        let mut responses = self.responses.lock().unwrap();
        let position = responses
            .iter()
            .position(|r| r.program == command.program)
            .ok_or_else(|| {
                ProcessError::MockExpectationNotMet(format!(
                    "no scripted response for '{}'",
                    command.program
                ))
            })?;
        let response = responses.remove(position).unwrap();
        Ok(response.output)
    }

    async fn spawn_streaming(
        &self,
        command: ProcessCommand,
    ) -> Result<StreamingChild, ProcessError> {
        Err(ProcessError::MockExpectationNotMet(format!(
            "streaming not scripted for '{}'",
            command.program
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_consumed_in_order() {
        let mock = MockProcessRunner::new();
        mock.push_success("bd", "first");
        mock.push_success("bd", "second");

        let out = mock.run(ProcessCommand::new("bd")).await.unwrap();
        assert_eq!(out.stdout, "first");
        let out = mock.run(ProcessCommand::new("bd")).await.unwrap();
        assert_eq!(out.stdout, "second");
        assert_eq!(mock.calls_for("bd"), 2);
    }

    #[tokio::test]
    async fn unmatched_command_errors() {
        let mock = MockProcessRunner::new();
        let result = mock.run(ProcessCommand::new("unexpected")).await;
        assert!(matches!(
            result,
            Err(ProcessError::MockExpectationNotMet(_))
        ));
    }
}
