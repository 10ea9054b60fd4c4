//! Stage adapter that runs a configured external program.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::config::ToolCommand;
use crate::options::JobOptions;
use crate::sanitize;
use crate::stages::context::{StageAdapter, StageContext, StageInputs, StageOutcome};
use crate::stages::error::StageError;
use crate::storage::StageDir;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}\s]+)\}").unwrap());

const STDERR_TAIL_LINES: usize = 40;
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Time a cancelled tool gets between SIGTERM and SIGKILL.
#[cfg(unix)]
const TERMINATE_GRACE: Duration = Duration::from_secs(3);
/// How long stderr may stay open after the tool itself has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
    Input,
    InputDir(StageDir),
    Output,
    Option(String),
}

fn parse_placeholder(name: &str) -> Result<Placeholder, String> {
    match name {
        "input" => Ok(Placeholder::Input),
        "output" => Ok(Placeholder::Output),
        _ => {
            if let Some(dir) = name.strip_prefix("input.") {
                StageDir::from_name(dir)
                    .map(Placeholder::InputDir)
                    .ok_or_else(|| format!("unknown input directory '{}'", dir))
            } else if let Some(key) = name.strip_prefix("option.") {
                if key.is_empty() {
                    Err("empty option key".to_string())
                } else {
                    Ok(Placeholder::Option(key.to_string()))
                }
            } else {
                Err(format!("unknown placeholder '{{{}}}'", name))
            }
        }
    }
}

/// Checks placeholders and output patterns of a tool definition.
pub fn validate_template(tool: &ToolCommand) -> Result<(), String> {
    if tool.program.trim().is_empty() {
        return Err("program is empty".to_string());
    }
    for arg in &tool.args {
        for caps in PLACEHOLDER_RE.captures_iter(arg) {
            parse_placeholder(&caps[1])?;
        }
    }
    for pattern in &tool.expected_outputs {
        for alternative in pattern.split('|') {
            glob::Pattern::new(alternative)
                .map_err(|e| format!("invalid output pattern '{}': {}", alternative, e))?;
        }
    }
    Ok(())
}

pub struct CommandAdapter {
    tool: ToolCommand,
}

impl CommandAdapter {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> &ToolCommand {
        &self.tool
    }

    fn render_arg(
        &self,
        arg: &str,
        inputs: &StageInputs,
        output_dir: &Path,
        options: &JobOptions,
    ) -> Result<String, StageError> {
        let mut failure = None;
        let rendered = PLACEHOLDER_RE.replace_all(arg, |caps: &Captures| {
            let value = parse_placeholder(&caps[1])
                .map_err(StageError::Template)
                .and_then(|placeholder| match placeholder {
                    Placeholder::Input => inputs
                        .primary()
                        .map(|p| p.to_string_lossy().to_string())
                        .ok_or_else(|| StageError::Template("stage has no inputs".to_string())),
                    Placeholder::InputDir(dir) => {
                        inputs.require(dir).map(|p| p.to_string_lossy().to_string())
                    }
                    Placeholder::Output => Ok(output_dir.to_string_lossy().to_string()),
                    Placeholder::Option(key) => options.lookup(&key).ok_or_else(|| {
                        StageError::Template(format!("option '{}' has no value", key))
                    }),
                });
            match value {
                Ok(value) => value,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(rendered.into_owned()),
        }
    }

    fn verify_outputs(&self, output_dir: &Path) -> Result<(), StageError> {
        let base = glob::Pattern::escape(&output_dir.to_string_lossy());
        for pattern in &self.tool.expected_outputs {
            let found = pattern.split('|').any(|alternative| {
                glob::glob(&format!("{}/{}", base, alternative))
                    .map(|paths| paths.filter_map(|p| p.ok()).any(|p| p.is_file()))
                    .unwrap_or(false)
            });
            if !found {
                return Err(StageError::MissingOutput {
                    pattern: pattern.clone(),
                    dir: output_dir.to_path_buf(),
                });
            }
        }
        Ok(())
    }
}

impl StageAdapter for CommandAdapter {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        ctx.cancel.check()?;

        let args = self
            .tool
            .args
            .iter()
            .map(|arg| self.render_arg(arg, inputs, output_dir, options))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            program = %self.tool.program,
            output = %sanitize::redact_path(output_dir),
            "Launching external tool"
        );

        let mut command = Command::new(&self.tool.program);
        command
            .args(&args)
            .envs(&self.tool.env)
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // The tool leads its own process group so cancellation reaches
        // everything it spawned.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = command
            .spawn()
            .map_err(|e| StageError::Launch {
                program: self.tool.program.clone(),
                source: e,
            })?;

        let stderr_reader = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                sanitize::tail_lines(
                    BufReader::new(stderr).lines().map_while(Result::ok),
                    STDERR_TAIL_LINES,
                )
            })
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    terminate(&mut child);
                    return Err(StageError::Io {
                        path: output_dir.to_path_buf(),
                        source: e,
                    });
                }
            }

            if let Some(reason) = ctx.cancel.reason() {
                warn!(
                    job_id = %ctx.job_id,
                    stage = ctx.stage,
                    program = %self.tool.program,
                    %reason,
                    "Killing external tool"
                );
                terminate(&mut child);
                drain_stderr(&child, stderr_reader);
                return Err(StageError::Cancelled(reason.to_string()));
            }

            thread::sleep(CHILD_POLL_INTERVAL);
        };

        let stderr_tail = drain_stderr(&child, stderr_reader);

        if !status.success() {
            return Err(StageError::ToolFailed {
                program: self.tool.program.clone(),
                status: status.to_string(),
                stderr: stderr_tail,
            });
        }

        self.verify_outputs(output_dir)?;
        StageOutcome::from_dir(output_dir)
    }
}

/// Stops the tool and everything in its process group: SIGTERM, a grace
/// period, then SIGKILL. Always reaps the direct child.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    if killpg(group, Signal::SIGTERM).is_ok() {
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                break;
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        }
    }
    // Stragglers that ignored SIGTERM, or outlived the leader.
    let _ = killpg(group, Signal::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Collects the stderr tail without waiting forever on a descendant that
/// still holds the pipe open. A reader that misses the deadline is detached.
fn drain_stderr(child: &Child, reader: Option<JoinHandle<String>>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };

    let deadline = Instant::now() + STDERR_DRAIN_TIMEOUT;
    while !reader.is_finished() {
        if Instant::now() >= deadline {
            warn!(pid = child.id(), "Tool stderr still open after exit, detaching reader");
            return String::new();
        }
        thread::sleep(Duration::from_millis(10));
    }
    reader.join().unwrap_or_default()
}
