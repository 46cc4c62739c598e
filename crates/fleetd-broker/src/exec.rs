//! Privileged command execution.
//!
//! Commands run under the broker's elevated identity and always produce
//! a response, success or failure; errors travel in the outcome's `err`
//! field, never as a panic or a dropped request.
//!
//! Known composite command names expand into an ordered step list that
//! short-circuits on the first failing step and surfaces that step's
//! error; remaining steps are skipped.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::debug;

/// One step of a command sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory override.
    pub cwd: Option<PathBuf>,
}

impl CommandStep {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            cwd: None,
        }
    }
}

/// Result of a command or sequence: the first error if any step failed,
/// and the captured output of the failing step (or of the last step on
/// success).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// First error encountered, if any.
    pub err: Option<String>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutcome {
    fn failed(message: String) -> Self {
        Self {
            err: Some(message),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Execute a command by name, expanding known composites.
pub async fn run(cmd: &str, params: &[String]) -> ExecOutcome {
    match expand(cmd, params) {
        Ok(steps) => run_sequence(&steps).await,
        Err(message) => ExecOutcome::failed(message),
    }
}

/// Expand a command name into its step sequence.
///
/// Unknown names run as a single step with the parameters as arguments.
///
/// # Errors
///
/// Returns a message when a composite's parameters are malformed.
pub fn expand(cmd: &str, params: &[String]) -> Result<Vec<CommandStep>, String> {
    match cmd {
        // Recursively fix ownership, then fix permissions.
        "fix_ownership" => {
            let [owner, path] = params else {
                return Err("fix_ownership requires <owner> <path>".to_string());
            };
            Ok(vec![
                CommandStep::new("chown", &["-R", owner, path]),
                CommandStep::new("chmod", &["-R", "u+rwX,go-w", path]),
            ])
        }

        // Update a package manifest's dependency tree, then prune
        // whatever the manifest no longer lists.
        "refresh_packages" => {
            let [manifest_dir] = params else {
                return Err("refresh_packages requires <manifest-dir>".to_string());
            };
            let cwd = Some(PathBuf::from(manifest_dir));
            Ok(vec![
                CommandStep {
                    program: "npm".to_string(),
                    args: vec!["update".to_string()],
                    cwd: cwd.clone(),
                },
                CommandStep {
                    program: "npm".to_string(),
                    args: vec!["prune".to_string()],
                    cwd,
                },
            ])
        }

        _ => Ok(vec![CommandStep {
            program: cmd.to_string(),
            args: params.to_vec(),
            cwd: None,
        }]),
    }
}

/// Run steps in order; the first failure wins and skips the rest.
pub async fn run_sequence(steps: &[CommandStep]) -> ExecOutcome {
    let mut last = ExecOutcome {
        err: None,
        stdout: String::new(),
        stderr: String::new(),
    };
    for step in steps {
        debug!(program = %step.program, "running privileged step");
        let outcome = run_step(step).await;
        if outcome.err.is_some() {
            return outcome;
        }
        last = outcome;
    }
    last
}

async fn run_step(step: &CommandStep) -> ExecOutcome {
    let mut cmd = Command::new(&step.program);
    cmd.args(&step.args);
    if let Some(cwd) = &step.cwd {
        cmd.current_dir(cwd);
    }

    match cmd.output().await {
        Err(e) => ExecOutcome::failed(format!("{}: {e}", step.program)),
        Ok(output) => ExecOutcome {
            err: (!output.status.success())
                .then(|| format!("{} exited with {}", step.program, output.status)),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_command_captures_stdout() {
        let outcome = run("echo", &["hi".to_string()]).await;
        assert_eq!(outcome.err, None);
        assert_eq!(outcome.stdout, "hi\n");
        assert_eq!(outcome.stderr, "");
    }

    #[tokio::test]
    async fn failing_command_reports_its_status() {
        let outcome = run("false", &[]).await;
        let err = outcome.err.unwrap();
        assert!(err.contains("false"));
    }

    #[tokio::test]
    async fn missing_program_reports_the_spawn_error() {
        let outcome = run("nonexistent_command_12345", &[]).await;
        assert!(outcome.err.is_some());
    }

    #[tokio::test]
    async fn first_failing_step_short_circuits_the_sequence() {
        let steps = vec![
            CommandStep::new("sh", &["-c", "echo before; exit 3"]),
            CommandStep::new("sh", &["-c", "echo after"]),
        ];

        let outcome = run_sequence(&steps).await;
        let err = outcome.err.unwrap();
        assert!(err.contains("sh"));
        // The failing step's output is surfaced; the skipped step's never
        // appears.
        assert_eq!(outcome.stdout, "before\n");
    }

    #[tokio::test]
    async fn successful_sequence_surfaces_the_last_step_output() {
        let steps = vec![
            CommandStep::new("sh", &["-c", "echo one"]),
            CommandStep::new("sh", &["-c", "echo two"]),
        ];

        let outcome = run_sequence(&steps).await;
        assert_eq!(outcome.err, None);
        assert_eq!(outcome.stdout, "two\n");
    }

    #[test]
    fn ownership_fixup_expands_to_chown_then_chmod() {
        let steps = expand(
            "fix_ownership",
            &["acme:acme".to_string(), "/home/acme".to_string()],
        )
        .unwrap();

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].program, "chown");
        assert_eq!(steps[0].args, vec!["-R", "acme:acme", "/home/acme"]);
        assert_eq!(steps[1].program, "chmod");
    }

    #[test]
    fn package_refresh_expands_to_update_then_prune() {
        let steps = expand("refresh_packages", &["/home/acme/app".to_string()]).unwrap();

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].args, vec!["update"]);
        assert_eq!(steps[1].args, vec!["prune"]);
        assert!(steps.iter().all(|s| s.cwd.is_some()));
    }

    #[test]
    fn malformed_composite_parameters_are_an_error() {
        assert!(expand("fix_ownership", &[]).is_err());
        assert!(expand("refresh_packages", &[]).is_err());
    }
}
