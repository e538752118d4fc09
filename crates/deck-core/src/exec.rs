use crate::model::Command;
use std::io;
use std::process::{self, ExitStatus};
use thiserror::Error;
use tracing::{debug, info};

/// `action` value that switches a command to the application-open path.
pub const OPEN_ACTION: &str = "open";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty action")]
    EmptyAction,
    #[error("failed to launch {target}: {reason}")]
    LaunchFailed { target: String, reason: String },
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} {}", describe_status(.code))]
    NonZeroExit { program: String, code: Option<i32> },
}

fn describe_status(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exited with status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// How a command's `action` line is carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Open { target: String },
    Run { program: String, args: Vec<String> },
}

impl Invocation {
    pub fn for_command(command: &Command) -> Result<Self, ExecError> {
        if command.action_line.trim() == OPEN_ACTION {
            return Ok(Invocation::Open {
                target: command.application_target.clone(),
            });
        }
        Self::parse_action_line(&command.action_line)
    }

    pub fn parse_action_line(action_line: &str) -> Result<Self, ExecError> {
        let (program, args) = split_action_line(action_line)?;
        Ok(Invocation::Run { program, args })
    }
}

/// Whitespace split, first token is the program. No quoting or escapes.
fn split_action_line(action_line: &str) -> Result<(String, Vec<String>), ExecError> {
    let mut parts = action_line.split_whitespace().map(str::to_string);
    let program = parts.next().ok_or(ExecError::EmptyAction)?;
    Ok((program, parts.collect()))
}

/// Side-effecting half of `run`. Implementations must be callable from any
/// session thread.
pub trait Executor: Send + Sync {
    fn open_application(&self, target: &str) -> Result<(), ExecError>;
    fn run_action(&self, action_line: &str) -> Result<(), ExecError>;
}

pub fn execute(executor: &dyn Executor, command: &Command) -> Result<(), ExecError> {
    match Invocation::for_command(command)? {
        Invocation::Open { target } => executor.open_application(&target),
        Invocation::Run { .. } => executor.run_action(&command.action_line),
    }
}

/// Runs real processes. Children inherit the server's environment and
/// stdout/stderr, and `run_action` waits for them to exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn open_application(&self, target: &str) -> Result<(), ExecError> {
        if target.trim().is_empty() {
            return Err(ExecError::LaunchFailed {
                target: target.to_string(),
                reason: "no application named".to_string(),
            });
        }
        debug!(event = "open_application", app = target);
        let status = open_command(target)
            .status()
            .map_err(|err| ExecError::LaunchFailed {
                target: target.to_string(),
                reason: err.to_string(),
            })?;
        if !status.success() {
            return Err(ExecError::LaunchFailed {
                target: target.to_string(),
                reason: describe_status(&status.code()),
            });
        }
        info!(event = "application_opened", app = target);
        Ok(())
    }

    fn run_action(&self, action_line: &str) -> Result<(), ExecError> {
        let (program, args) = split_action_line(action_line)?;
        debug!(event = "spawn", program = %program, args = args.len());
        let status = process::Command::new(&program)
            .args(&args)
            .status()
            .map_err(|source| ExecError::SpawnFailed {
                program: program.clone(),
                source,
            })?;
        ensure_success(&program, status)
    }
}

fn ensure_success(program: &str, status: ExitStatus) -> Result<(), ExecError> {
    if status.success() {
        Ok(())
    } else {
        Err(ExecError::NonZeroExit {
            program: program.to_string(),
            code: status.code(),
        })
    }
}

#[cfg(target_os = "macos")]
fn open_command(target: &str) -> process::Command {
    let mut command = process::Command::new("open");
    command.arg("-a").arg(target);
    command
}

#[cfg(target_os = "windows")]
fn open_command(target: &str) -> process::Command {
    let mut command = process::Command::new("cmd");
    command.arg("/C").arg("start").arg("").arg(target);
    command
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn open_command(target: &str) -> process::Command {
    let mut command = process::Command::new("gtk-launch");
    command.arg(target);
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommandKind;

    fn command(action: &str, app: &str) -> Command {
        Command {
            id: "a1".to_string(),
            application_target: app.to_string(),
            action_line: action.to_string(),
            kind: CommandKind::Action,
            context_id: "main".to_string(),
            ..Command::default()
        }
    }

    #[test]
    fn action_line_splits_on_whitespace() {
        let invocation = Invocation::parse_action_line("  echo   hi there ").expect("parse");
        assert_eq!(
            invocation,
            Invocation::Run {
                program: "echo".to_string(),
                args: vec!["hi".to_string(), "there".to_string()],
            }
        );
    }

    #[test]
    fn empty_action_line_is_an_error() {
        assert!(matches!(
            Invocation::parse_action_line("   "),
            Err(ExecError::EmptyAction)
        ));
    }

    #[test]
    fn open_token_selects_application_path() {
        let invocation = Invocation::for_command(&command("open", "Safari")).expect("open");
        assert_eq!(
            invocation,
            Invocation::Open {
                target: "Safari".to_string()
            }
        );
        let invocation = Invocation::for_command(&command("open -a Safari", "Safari")).expect("run");
        assert!(matches!(invocation, Invocation::Run { ref program, .. } if program == "open"));
    }

    #[test]
    fn missing_program_is_a_spawn_failure() {
        let err = SystemExecutor
            .run_action("deck-definitely-not-a-real-program --flag")
            .expect_err("spawn should fail");
        match err {
            ExecError::SpawnFailed { program, .. } => {
                assert_eq!(program, "deck-definitely-not-a-real-program")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn blank_application_target_fails_to_launch() {
        assert!(matches!(
            SystemExecutor.open_application(""),
            Err(ExecError::LaunchFailed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_is_reported() {
        SystemExecutor.run_action("true").expect("true succeeds");
        let err = SystemExecutor.run_action("false").expect_err("false fails");
        assert!(matches!(err, ExecError::NonZeroExit { code: Some(1), .. }));
        assert_eq!(err.to_string(), "false exited with status 1");
    }
}
