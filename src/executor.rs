//! Command executor - the only component that touches the outside world.
//!
//! An [`OperationHandler`] (picked by the agent's role) turns an operation
//! into a [`CommandSpec`]; an [`ExternalRunner`] runs it. Every failure,
//! including a panicking runner, comes back as an [`OperationResult`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{ConclaveError, Result};
use crate::task::{CommandSpec, ExternalOutput, Operation, OperationKind, OperationResult};

/// Boundary to shells, tools and file I/O
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalRunner: Send + Sync {
    /// Run `command` to completion
    async fn run_external(&self, command: CommandSpec) -> Result<ExternalOutput>;
}

/// Runs commands as child processes
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            timeout,
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh", Duration::from_secs(300))
    }
}

#[async_trait]
impl ExternalRunner for ShellRunner {
    async fn run_external(&self, spec: CommandSpec) -> Result<ExternalOutput> {
        let mut cmd = if spec.shell {
            let mut cmd = Command::new(&self.shell);
            cmd.arg("-c").arg(spec.to_string());
            cmd
        } else {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args);
            cmd
        };
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(command = %spec, "Running external command");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ConclaveError::OperationExecution(format!(
                    "`{spec}` timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        Ok(ExternalOutput {
            exit_status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Role strategy: how an operation without an explicit command is carried out
pub trait OperationHandler: Send + Sync {
    fn prepare(&self, operation: &Operation) -> Result<CommandSpec>;
}

/// Hands `<kind>: <subject>` to a fixed tool command as its last argument
#[derive(Debug, Clone)]
pub struct TemplateHandler {
    program: String,
    args: Vec<String>,
}

impl TemplateHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn instruction(operation: &Operation) -> Option<String> {
        let subject = operation.subject()?;
        Some(match operation.kind {
            OperationKind::Generic => subject.to_string(),
            kind => format!("{kind}: {subject}"),
        })
    }
}

impl OperationHandler for TemplateHandler {
    fn prepare(&self, operation: &Operation) -> Result<CommandSpec> {
        if operation.kind == OperationKind::Shell {
            return Err(ConclaveError::OperationExecution(
                "shell operation has no command".into(),
            ));
        }
        let instruction = Self::instruction(operation).ok_or_else(|| {
            ConclaveError::OperationExecution(format!("{} operation has no subject", operation.kind))
        })?;
        Ok(CommandSpec::new(&self.program)
            .args(self.args.iter().cloned())
            .arg(instruction))
    }
}

/// Handlers by role, with a fallback for undeclared roles
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
    fallback: Arc<dyn OperationHandler>,
}

impl HandlerRegistry {
    pub fn new(fallback: Arc<dyn OperationHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    pub fn register(&mut self, role: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(role.into(), handler);
    }

    pub fn for_role(&self, role: &str) -> Arc<dyn OperationHandler> {
        self.handlers
            .get(role)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// Runs one operation at a time and reports the outcome as data
#[derive(Clone)]
pub struct CommandExecutor {
    handler: Arc<dyn OperationHandler>,
    runner: Arc<dyn ExternalRunner>,
}

impl CommandExecutor {
    pub fn new(handler: Arc<dyn OperationHandler>, runner: Arc<dyn ExternalRunner>) -> Self {
        Self { handler, runner }
    }

    /// Execute `operation`. Never fails and never retries.
    #[instrument(skip_all, fields(kind = %operation.kind))]
    pub async fn execute(&self, operation: &Operation) -> OperationResult {
        let command = match &operation.command {
            Some(command) => command.clone(),
            None => match self.handler.prepare(operation) {
                Ok(command) => command,
                Err(e) => return OperationResult::failed(e.to_string()),
            },
        };
        let label = command.to_string();
        let runner = Arc::clone(&self.runner);

        // Spawned so a panicking runner surfaces as a JoinError, not an unwind.
        let outcome = tokio::spawn(async move { runner.run_external(command).await }).await;

        match outcome {
            Ok(Ok(output)) if output.success() => OperationResult {
                success: true,
                output: output.stdout,
                error: None,
                stderr: output.stderr,
                exit_code: output.exit_status,
            },
            Ok(Ok(output)) => {
                let status = output
                    .exit_status
                    .map_or_else(|| "a signal".to_string(), |code| format!("status {code}"));
                let err =
                    ConclaveError::OperationExecution(format!("`{label}` exited with {status}"));
                warn!(command = %label, stderr = %output.stderr.trim(), "Operation failed");
                OperationResult {
                    success: false,
                    output: output.stdout,
                    error: Some(err.to_string()),
                    stderr: output.stderr,
                    exit_code: output.exit_status,
                }
            }
            Ok(Err(e)) => {
                warn!(command = %label, error = %e, "Operation could not run");
                let err = match e {
                    ConclaveError::OperationExecution(_) => e,
                    other => ConclaveError::OperationExecution(format!("`{label}`: {other}")),
                };
                OperationResult::failed(err.to_string())
            }
            Err(join) => {
                warn!(command = %label, error = %join, "Runner aborted");
                OperationResult::failed(
                    ConclaveError::OperationExecution(format!("`{label}` aborted: {join}"))
                        .to_string(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_executor(runner: MockExternalRunner) -> CommandExecutor {
        CommandExecutor::new(
            Arc::new(TemplateHandler::new("agent-cli", vec!["--print".into()])),
            Arc::new(runner),
        )
    }

    #[tokio::test]
    async fn test_template_command_success() {
        let mut runner = MockExternalRunner::new();
        runner
            .expect_run_external()
            .withf(|cmd| {
                cmd.program == "agent-cli"
                    && cmd.args == vec!["--print".to_string(), "implementation: login form".to_string()]
            })
            .times(1)
            .returning(|_| {
                Ok(ExternalOutput {
                    exit_status: Some(0),
                    stdout: "done".into(),
                    stderr: String::new(),
                })
            });

        let op = Operation::new(OperationKind::Implementation, json!({ "subject": "login form" }));
        let result = echo_executor(runner).execute(&op).await;

        assert!(result.success);
        assert_eq!(result.output, "done");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_data() {
        let mut runner = MockExternalRunner::new();
        runner.expect_run_external().returning(|_| {
            Ok(ExternalOutput {
                exit_status: Some(2),
                stdout: String::new(),
                stderr: "boom".into(),
            })
        });

        let op = Operation::with_command(OperationKind::Shell, CommandSpec::shell_line("false"));
        let result = echo_executor(runner).execute(&op).await;

        assert!(!result.success);
        assert_eq!(result.stderr, "boom");
        assert_eq!(result.exit_code, Some(2));
        assert!(result.error.unwrap().contains("status 2"));
    }

    #[tokio::test]
    async fn test_runner_error_is_data() {
        let mut runner = MockExternalRunner::new();
        runner.expect_run_external().returning(|_| {
            Err(ConclaveError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such program",
            )))
        });

        let op = Operation::new(OperationKind::Research, json!({ "subject": "caching" }));
        let result = echo_executor(runner).execute(&op).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("no such program"));
    }

    struct CrashingRunner;

    #[async_trait]
    impl ExternalRunner for CrashingRunner {
        async fn run_external(&self, _command: CommandSpec) -> Result<ExternalOutput> {
            panic!("tool crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_runner_is_contained() {
        let executor = CommandExecutor::new(
            Arc::new(TemplateHandler::new("agent-cli", vec![])),
            Arc::new(CrashingRunner),
        );

        let op = Operation::new(OperationKind::Testing, json!({ "subject": "auth" }));
        let result = executor.execute(&op).await;

        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_shell_without_command_fails_without_running() {
        let mut runner = MockExternalRunner::new();
        runner.expect_run_external().never();

        let op = Operation::new(OperationKind::Shell, json!({}));
        let result = echo_executor(runner).execute(&op).await;
        assert!(!result.success);
    }

    #[test]
    fn test_registry_falls_back() {
        let mut registry = HandlerRegistry::new(Arc::new(TemplateHandler::new("generic", vec![])));
        registry.register("research", Arc::new(TemplateHandler::new("researcher", vec![])));

        let op = Operation::new(OperationKind::Research, json!({ "subject": "x" }));
        assert_eq!(registry.for_role("research").prepare(&op).unwrap().program, "researcher");
        assert_eq!(registry.for_role("qa").prepare(&op).unwrap().program, "generic");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_captures_streams() {
        let runner = ShellRunner::new("sh", Duration::from_secs(10));

        let ok = runner
            .run_external(CommandSpec::shell_line("echo hello"))
            .await
            .unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = runner
            .run_external(CommandSpec::shell_line("echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(failed.exit_status, Some(3));
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let runner = ShellRunner::new("sh", Duration::from_millis(100));
        let result = runner.run_external(CommandSpec::shell_line("sleep 5")).await;
        assert!(matches!(result, Err(ConclaveError::OperationExecution(_))));
    }
}
