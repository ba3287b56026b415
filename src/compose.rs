//! Driving `docker compose` for one composition directory.
//!
//! Every operation is a single blocking child process; the exit code is the
//! only success signal. Running state is never cached: each call asks
//! `docker compose ps` again.

use crate::error::{AnydevError, ProcessErrorDetails, Result};
use std::borrow::Cow;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

/// Service that `shell` execs into.
pub const PRIMARY_SERVICE: &str = "app";
/// Profile selector that matches every profile in the manifest.
pub const ALL_PROFILES: &str = "*";
/// Exit status of a child terminated by SIGINT.
const INTERRUPTED_STATUS: i32 = 130;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

pub trait DockerRunner {
    fn run(&self, args: &[String], cwd: &Path, capture_output: bool)
        -> io::Result<CommandOutput>;
}

pub struct RealDockerRunner;

impl DockerRunner for RealDockerRunner {
    fn run(
        &self,
        args: &[String],
        cwd: &Path,
        capture_output: bool,
    ) -> io::Result<CommandOutput> {
        let mut cmd = Command::new("docker");
        cmd.args(args).current_dir(cwd);
        if capture_output {
            cmd.stdin(Stdio::null());
            let output = cmd.output()?;
            Ok(CommandOutput {
                status_code: status_code(&output.status),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            Ok(CommandOutput {
                status_code: status_code(&status),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

fn status_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    if status.success() {
        0
    } else {
        1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped,
}

#[derive(Debug, PartialEq, Eq)]
enum StatusRows {
    Empty,
    Rows(usize),
    Unparseable(String),
}

pub struct ComposeController<'a, R: DockerRunner> {
    runner: &'a R,
    passthrough_stdout: bool,
}

impl<'a, R: DockerRunner> ComposeController<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self {
            runner,
            passthrough_stdout: false,
        }
    }

    /// Echo captured stdout of lifecycle commands to our own stdout.
    pub fn with_passthrough(mut self, enabled: bool) -> Self {
        self.passthrough_stdout = enabled;
        self
    }

    /// Whether `docker` can be spawned and reaches its daemon.
    pub fn is_tool_available(&self) -> bool {
        let args = vec!["version".to_string()];
        match self.runner.run(&args, Path::new("."), true) {
            Ok(output) => output.success(),
            Err(err) => {
                tracing::debug!("docker availability check failed: {err}");
                false
            }
        }
    }

    pub fn state(&self, path: &Path) -> Result<CompositionState> {
        let args = compose_args(&["ps", "--format", "json"]);
        let output = self.execute(&args, path, true)?;
        let text = String::from_utf8_lossy(&output.stdout);
        match parse_status_rows(&text) {
            StatusRows::Empty => {
                tracing::debug!(path = %path.display(), "status query returned no containers");
                Ok(CompositionState::Stopped)
            }
            StatusRows::Rows(0) => Ok(CompositionState::Stopped),
            StatusRows::Rows(_) => Ok(CompositionState::Running),
            StatusRows::Unparseable(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    "could not parse `docker compose ps` output ({reason}); treating composition as stopped"
                );
                Ok(CompositionState::Stopped)
            }
        }
    }

    pub fn is_running(&self, path: &Path) -> Result<bool> {
        Ok(self.state(path)? == CompositionState::Running)
    }

    /// Stop-then-start. Starting a running composition restarts it.
    pub fn start(&self, path: &Path, profiles: &[String]) -> Result<StopOutcome> {
        let stopped = self.stop(path)?;
        if profiles.is_empty() {
            tracing::info!("no profiles selected; starting the default service set");
        }
        let mut args = vec!["compose".to_string()];
        for profile in profiles {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args.push("up".to_string());
        args.push("-d".to_string());
        self.execute(&args, path, true)?;
        Ok(stopped)
    }

    /// Tears down across every profile, so services from profiles that were
    /// deselected since the last start are not left behind.
    pub fn stop(&self, path: &Path) -> Result<StopOutcome> {
        if !self.is_running(path)? {
            return Ok(StopOutcome::NotRunning);
        }
        let args = compose_args(&["--profile", ALL_PROFILES, "down"]);
        self.execute(&args, path, true)?;
        Ok(StopOutcome::Stopped)
    }

    /// Follows `service` logs until the child exits. A non-zero exit after
    /// the user interrupted is the normal way out and is not an error.
    pub fn tail_logs(&self, path: &Path, service: &str, interrupted: &AtomicBool) -> Result<()> {
        if !self.is_running(path)? {
            return Err(AnydevError::Validation(format!(
                "the composition at {} is not currently running",
                path.display()
            )));
        }
        let args = compose_args(&["logs", service, "-f"]);
        let command = render_docker_command(&args);
        let output = self.spawn(&args, path, false, &command)?;
        if output.success()
            || output.status_code == INTERRUPTED_STATUS
            || interrupted.load(Ordering::SeqCst)
        {
            return Ok(());
        }
        Err(self.failure(&output, command))
    }

    /// Interactive exec of `command` in the primary service container.
    pub fn shell(&self, path: &Path, command: &str) -> Result<()> {
        let args = compose_args(&["exec", PRIMARY_SERVICE, command]);
        self.execute(&args, path, false)?;
        Ok(())
    }

    fn execute(&self, args: &[String], cwd: &Path, capture_output: bool) -> Result<CommandOutput> {
        let command = render_docker_command(args);
        let output = self.spawn(args, cwd, capture_output, &command)?;
        if !output.success() {
            return Err(self.failure(&output, command));
        }
        let echo = capture_output && self.passthrough_stdout && args_are_lifecycle(args);
        if echo && !output.stdout.is_empty() {
            print!("{}", String::from_utf8_lossy(&output.stdout));
        }
        Ok(output)
    }

    fn spawn(
        &self,
        args: &[String],
        cwd: &Path,
        capture_output: bool,
        command: &str,
    ) -> Result<CommandOutput> {
        tracing::debug!(cwd = %cwd.display(), "running `{command}`");
        self.runner
            .run(args, cwd, capture_output)
            .map_err(|err| spawn_error(&err, command))
    }

    fn failure(&self, output: &CommandOutput, command: String) -> AnydevError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let (error_code, hint) = classify_docker_command_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        let details = ProcessErrorDetails {
            error_code: error_code.clone(),
            hint,
            command: Some(command),
            raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
        };
        if error_code == "docker_daemon_unreachable" {
            return AnydevError::ToolUnavailable { message, details };
        }
        AnydevError::Composition {
            message,
            status_code: output.status_code,
            details,
        }
    }
}

fn compose_args(rest: &[&str]) -> Vec<String> {
    std::iter::once("compose")
        .chain(rest.iter().copied())
        .map(ToString::to_string)
        .collect()
}

fn args_are_lifecycle(args: &[String]) -> bool {
    args.iter().any(|arg| arg == "up" || arg == "down")
}

/// Accepts a JSON array, a single object, or one object per line. Anything
/// else is reported as unparseable rather than as an empty result.
fn parse_status_rows(text: &str) -> StatusRows {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return StatusRows::Empty;
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(rows)) => return StatusRows::Rows(rows.len()),
        Ok(serde_json::Value::Object(_)) => return StatusRows::Rows(1),
        Ok(serde_json::Value::Null) => return StatusRows::Rows(0),
        Ok(other) => return StatusRows::Unparseable(format!("unexpected value `{other}`")),
        Err(_) => {}
    }
    let mut rows = 0;
    for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(_)) => rows += 1,
            Ok(other) => return StatusRows::Unparseable(format!("unexpected row `{other}`")),
            Err(err) => return StatusRows::Unparseable(err.to_string()),
        }
    }
    StatusRows::Rows(rows)
}

/// The invocation as a user could paste it into a POSIX shell. Arguments with
/// whitespace or quotes are single-quoted.
pub fn render_docker_command(args: &[String]) -> String {
    std::iter::once("docker")
        .chain(args.iter().map(String::as_str))
        .map(quote_arg)
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("''");
    }
    if arg
        .chars()
        .any(|c| c.is_whitespace() || c == '\'' || c == '"')
    {
        return Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")));
    }
    Cow::Borrowed(arg)
}

fn spawn_error(err: &io::Error, command: &str) -> AnydevError {
    if err.kind() == io::ErrorKind::NotFound {
        return AnydevError::ToolUnavailable {
            message: format!("failed to run command `{command}`: docker was not found"),
            details: ProcessErrorDetails {
                error_code: "docker_not_found".to_string(),
                hint: Some("Install Docker and ensure `docker` is on your PATH.".to_string()),
                command: Some(command.to_string()),
                raw_stderr: None,
            },
        };
    }
    AnydevError::Composition {
        message: format!("failed to run command `{command}`: {err}"),
        status_code: 1,
        details: ProcessErrorDetails {
            error_code: "process_command_failed".to_string(),
            hint: None,
            command: Some(command.to_string()),
            raw_stderr: None,
        },
    }
}

fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker daemon is unreachable. Start Docker Desktop (or dockerd) and retry.".to_string()),
        );
    }

    if lower.contains("unknown command: docker compose")
        || lower.contains("is not a docker command")
    {
        return (
            "docker_compose_unavailable".to_string(),
            Some("Docker Compose is unavailable. Install the compose plugin and retry.".to_string()),
        );
    }

    if lower.contains("no configuration file provided") {
        return (
            "compose_file_missing".to_string(),
            Some("Run this command from a directory containing a compose file.".to_string()),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            "docker_port_conflict".to_string(),
            Some("A required host port is already in use. Stop the conflicting service and retry.".to_string()),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login` for private images.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}
