//! Runs one plan step: either a shell subprocess or an in-process command.
//!
//! Subprocesses get their own process group so a timeout can take down the
//! whole tree. Captured output goes through the step's filter/tail/byte
//! limits and a hard per-observation cap before it reaches the model; the
//! raw buffers are kept aside for the failure report.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use goagent_protocol::CommandDraft;
use goagent_protocol::PlanStep;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::warn;

use crate::error::AgentErr;
use crate::internal_commands::CommandRegistry;
use crate::util::take_last_bytes_at_char_boundary;
use crate::util::wait_for_cancel;

/// Hard cap applied to every persisted observation buffer.
pub(crate) const OBSERVATION_MAX_BYTES: usize = 50 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Directory (under the step cwd) that failure reports are written to.
const FAILURE_DIR: &str = ".goagent";

/// What one executed command produced.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub details: String,
    pub truncated: bool,
    /// Wall-clock time spent executing, for host-facing status events.
    pub duration: Duration,
}

/// Shared execution environment for one runtime.
pub(crate) struct ExecContext {
    pub registry: Arc<CommandRegistry>,
    /// Root that relative step cwds resolve against.
    pub root_cwd: PathBuf,
    pub cancel: watch::Receiver<bool>,
}

impl ExecContext {
    fn resolve_cwd(&self, step_cwd: &str) -> PathBuf {
        if step_cwd.is_empty() {
            return self.root_cwd.clone();
        }
        let path = PathBuf::from(step_cwd);
        if path.is_absolute() {
            path
        } else {
            self.root_cwd.join(path)
        }
    }
}

/// Execute one step to completion. Always returns an observation; the
/// error half tells the scheduler whether to halt further scheduling.
pub(crate) async fn execute_step(
    ctx: &ExecContext,
    step: &PlanStep,
) -> (CommandOutcome, Option<AgentErr>) {
    let cwd = ctx.resolve_cwd(&step.command.cwd);
    let started = std::time::Instant::now();
    let (mut outcome, error) = if step.command.is_internal() {
        run_internal(ctx, step, &cwd).await
    } else {
        run_shell(ctx, step, &cwd).await
    };
    outcome.duration = started.elapsed();
    if error.is_some() {
        write_failure_report(&cwd, step, &outcome, error.as_ref());
    }
    (outcome, error)
}

async fn run_internal(
    ctx: &ExecContext,
    step: &PlanStep,
    cwd: &Path,
) -> (CommandOutcome, Option<AgentErr>) {
    match ctx.registry.dispatch(step, cwd).await {
        Ok(mut outcome) => {
            if outcome.exit_code.is_none() {
                outcome.exit_code = Some(0);
            }
            let error = match outcome.exit_code {
                Some(0) | None => None,
                Some(code) => {
                    if outcome.details.is_empty() {
                        outcome.details = format!("command exited with status {code}");
                    }
                    Some(AgentErr::ExitStatus(code))
                }
            };
            (finish_outcome(outcome, &step.command), error)
        }
        Err(err) => {
            let outcome = CommandOutcome {
                details: err.to_string(),
                exit_code: Some(1),
                ..Default::default()
            };
            (outcome, Some(err))
        }
    }
}

async fn run_shell(
    ctx: &ExecContext,
    step: &PlanStep,
    cwd: &Path,
) -> (CommandOutcome, Option<AgentErr>) {
    let draft = &step.command;
    let timeout = if draft.timeout_sec > 0 {
        Duration::from_secs(draft.timeout_sec as u64)
    } else {
        DEFAULT_TIMEOUT
    };

    let mut tokens = draft.shell.split_whitespace();
    let Some(program) = tokens.next() else {
        let err = AgentErr::Spawn {
            command: draft.shell.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty shell"),
        };
        return (
            CommandOutcome {
                details: err.to_string(),
                ..Default::default()
            },
            Some(err),
        );
    };
    let mut args: Vec<String> = tokens.map(str::to_string).collect();
    if args.is_empty() {
        args.push("-lc".to_string());
    }
    args.push(draft.run.clone());

    let mut command = Command::new(program);
    command
        .args(&args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = AgentErr::Spawn {
                command: program.to_string(),
                source,
            };
            return (
                CommandOutcome {
                    details: err.to_string(),
                    ..Default::default()
                },
                Some(err),
            );
        }
    };

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(read_pipe(stdout_pipe));
    let stderr_task = tokio::spawn(read_pipe(stderr_pipe));

    let mut cancel = ctx.cancel.clone();
    let mut timed_out = false;
    let mut canceled = false;
    let wait_result = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            None
        }
        _ = wait_for_cancel(&mut cancel) => {
            canceled = true;
            None
        }
    };

    let wait_result = match wait_result {
        Some(result) => result,
        None => {
            kill_process_group(&child);
            let _ = child.kill().await;
            child.wait().await
        }
    };

    let raw_stdout = stdout_task.await.unwrap_or_default();
    let raw_stderr = stderr_task.await.unwrap_or_default();

    let exit_code = match &wait_result {
        Ok(status) => status.code(),
        Err(_) => None,
    };

    let mut outcome = CommandOutcome {
        stdout: String::from_utf8_lossy(&raw_stdout).into_owned(),
        stderr: String::from_utf8_lossy(&raw_stderr).into_owned(),
        exit_code,
        ..Default::default()
    };

    let error = if canceled {
        outcome.details = "operation canceled".to_string();
        Some(AgentErr::Interrupted)
    } else if timed_out {
        outcome.details = format!("command timed out after {timeout:?}");
        Some(AgentErr::Timeout(timeout))
    } else {
        match wait_result {
            Err(err) => {
                outcome.details = err.to_string();
                Some(AgentErr::Io(err))
            }
            Ok(status) if status.success() => None,
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                outcome.details = format!("command exited with status {code}");
                Some(AgentErr::ExitStatus(code))
            }
        }
    };

    (finish_outcome(outcome, draft), error)
}

async fn read_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        // The child was spawned into its own process group.
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) {}

/// Apply the step's output shaping to both buffers.
fn finish_outcome(mut outcome: CommandOutcome, draft: &CommandDraft) -> CommandOutcome {
    let (stdout, stdout_truncated) = post_process(&outcome.stdout, draft);
    let (stderr, stderr_truncated) = post_process(&outcome.stderr, draft);
    outcome.stdout = stdout;
    outcome.stderr = stderr;
    outcome.truncated = outcome.truncated || stdout_truncated || stderr_truncated;
    outcome
}

/// Filter, byte-trim, tail, then enforce the observation cap, in that
/// order. Returns the shaped text and whether anything was cut.
fn post_process(text: &str, draft: &CommandDraft) -> (String, bool) {
    let mut text = text.to_string();
    let mut truncated = false;

    if !draft.filter_regex.is_empty() {
        // An invalid pattern leaves the output untouched.
        if let Ok(re) = Regex::new(&draft.filter_regex) {
            text = text
                .lines()
                .filter(|line| re.is_match(line))
                .collect::<Vec<_>>()
                .join("\n");
        }
    }

    if draft.max_bytes > 0 && text.len() > draft.max_bytes as usize {
        text = take_last_bytes_at_char_boundary(&text, draft.max_bytes as usize).to_string();
        truncated = true;
    }

    if draft.tail_lines > 0 {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() > draft.tail_lines as usize {
            text = lines[lines.len() - draft.tail_lines as usize..].join("\n");
            truncated = true;
        }
    }

    if text.len() > OBSERVATION_MAX_BYTES {
        text = take_last_bytes_at_char_boundary(&text, OBSERVATION_MAX_BYTES).to_string();
        truncated = true;
    }

    (text, truncated)
}

/// Clamp an already-shaped buffer to the observation cap. Used again when
/// buffers are copied into the consolidated payload.
pub(crate) fn cap_observation_buffer(text: &mut String, truncated: &mut bool) {
    if text.len() > OBSERVATION_MAX_BYTES {
        *text = take_last_bytes_at_char_boundary(text, OBSERVATION_MAX_BYTES).to_string();
        *truncated = true;
    }
}

/// Best-effort diagnostic dump under `<cwd>/.goagent/`. Never fails the
/// pass; write errors are only logged.
fn write_failure_report(
    cwd: &Path,
    step: &PlanStep,
    outcome: &CommandOutcome,
    error: Option<&AgentErr>,
) {
    let dir = cwd.join(FAILURE_DIR);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), "failed to create failure-report dir: {err}");
        return;
    }
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("failure-{stamp}.txt"));
    let report = format!(
        "time: {}\nstep: {} ({})\nshell: {}\ncwd: {}\nrun: {}\nreason: {}\nerror: {}\nexit_code: {}\n\n--- stdout ---\n{}\n\n--- stderr ---\n{}\n",
        chrono::Utc::now().to_rfc3339(),
        step.id,
        step.title,
        step.command.shell,
        cwd.display(),
        step.command.run,
        step.command.reason,
        error.map(|e| e.to_string()).unwrap_or_default(),
        outcome
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
        outcome.stdout,
        outcome.stderr,
    );
    if let Err(err) = std::fs::write(&path, report) {
        warn!(path = %path.display(), "failed to write failure report: {err}");
    }
}
