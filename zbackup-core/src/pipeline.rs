/*!
External process pipelines.

A [`Pipeline`] is an ordered list of [`Stage`]s whose standard streams are
chained with OS pipes, so the first stage can keep producing while the last
one consumes. Only the stdout of the last stage is captured and returned.

Execution goes through the [`Executor`] capability. [`ProcessExecutor`]
spawns real processes; [`DryRunExecutor`] spawns nothing, records the command
lines it was handed and returns empty output.
*/

use crate::{BackupError, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What happens to a stage's standard error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrPolicy {
    /// Dropped
    Discard,
    /// Passed through verbatim to the operator's error stream
    Forward,
    /// Read line by line and logged; kept for error context
    #[default]
    Log,
}

/// One command of a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    program: String,
    args: Vec<String>,
    stderr: StderrPolicy,
    echo_stdout: bool,
}

impl Stage {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stderr: StderrPolicy::default(),
            echo_stdout: false,
        }
    }

    /// Set the standard error policy
    pub fn with_stderr(mut self, policy: StderrPolicy) -> Self {
        self.stderr = policy;
        self
    }

    /// Echo stdout lines to the console as they arrive (last stage only)
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo_stdout = echo;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn stderr_policy(&self) -> StderrPolicy {
        self.stderr
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Ordered chain of stages plus optional text fed to the first stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
    stdin: Option<String>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            stdin: None,
        }
    }

    pub fn single(stage: Stage) -> Self {
        Self::new(vec![stage])
    }

    pub fn with_stdin<S: Into<String>>(mut self, input: S) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}

/// Runs pipelines and returns the captured stdout of the last stage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, pipeline: &Pipeline) -> Result<String>;
}

/// Executor that spawns real OS processes
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(&self, pipeline: &Pipeline) -> Result<String> {
        let stages = pipeline.stages();
        if stages.is_empty() {
            return Err(BackupError::validation("cannot run an empty pipeline"));
        }
        debug!(command = %pipeline, "running pipeline");

        let mut children = Vec::with_capacity(stages.len());
        let mut stderr_tasks: Vec<Option<JoinHandle<Vec<String>>>> =
            Vec::with_capacity(stages.len());
        let mut stdin_task = None;
        let mut upstream: Option<Stdio> = None;

        for (index, stage) in stages.iter().enumerate() {
            let is_last = index + 1 == stages.len();
            let mut command = Command::new(&stage.program);
            command.args(&stage.args).kill_on_drop(true);

            match upstream.take() {
                Some(stdio) => command.stdin(stdio),
                None if pipeline.stdin.is_some() => command.stdin(Stdio::piped()),
                None => command.stdin(Stdio::null()),
            };
            command.stdout(Stdio::piped());
            command.stderr(match stage.stderr {
                StderrPolicy::Discard => Stdio::null(),
                StderrPolicy::Forward => Stdio::inherit(),
                StderrPolicy::Log => Stdio::piped(),
            });

            let mut child = command.spawn().map_err(|e| BackupError::Process {
                command: stage.to_string(),
                status: format!("failed to start: {e}"),
                stderr: Vec::new(),
            })?;

            if index == 0 {
                if let (Some(input), Some(mut writer)) = (pipeline.stdin.clone(), child.stdin.take())
                {
                    stdin_task = Some(tokio::spawn(async move {
                        writer.write_all(input.as_bytes()).await?;
                        writer.shutdown().await
                    }));
                }
            }

            stderr_tasks.push(
                child
                    .stderr
                    .take()
                    .map(|stderr| tokio::spawn(collect_stderr(stage.program.clone(), stderr))),
            );

            if !is_last {
                let stdout = child.stdout.take().ok_or_else(|| {
                    BackupError::parse(format!("no stdout handle for `{stage}`"))
                })?;
                upstream = Some(stdout.try_into()?);
            }
            children.push(child);
        }

        let tail = stages.len() - 1;
        let mut captured = String::new();
        if let Some(stdout) = children[tail].stdout.take() {
            let echo = stages[tail].echo_stdout;
            let mut console = tokio::io::stdout();
            let mut reader = BufReader::new(stdout);
            let mut raw = Vec::new();
            while let Some(line) = next_line_lossy(&mut reader, &mut raw).await? {
                if echo {
                    console.write_all(&raw).await?;
                    if !raw.ends_with(b"\n") {
                        console.write_all(b"\n").await?;
                    }
                    console.flush().await?;
                }
                captured.push_str(&line);
                captured.push('\n');
            }
        }

        let mut failures = Vec::new();
        for ((stage, child), task) in stages.iter().zip(children.iter_mut()).zip(stderr_tasks) {
            let status = child.wait().await?;
            let stderr = join_stderr(stage, task).await;
            if !status.success() {
                failures.push(BackupError::Process {
                    command: stage.to_string(),
                    status: status.to_string(),
                    stderr,
                });
            }
        }

        if let Some(task) = stdin_task {
            match task.await {
                Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }

        // A stage that explains itself on stderr beats one that died of SIGPIPE.
        let explained = failures
            .iter()
            .position(|f| matches!(f, BackupError::Process { stderr, .. } if !stderr.is_empty()));
        match explained {
            Some(index) => Err(failures.swap_remove(index)),
            None => match failures.into_iter().next() {
                Some(failure) => Err(failure),
                None => Ok(captured),
            },
        }
    }
}

async fn collect_stderr(program: String, stderr: ChildStderr) -> Vec<String> {
    let mut kept = Vec::new();
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    while let Ok(Some(line)) = next_line_lossy(&mut reader, &mut raw).await {
        warn!(program = %program, "{line}");
        kept.push(line);
    }
    kept
}

/// Wait for a stage's stderr collector; a collector that died yields no lines
async fn join_stderr(stage: &Stage, task: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    let Some(task) = task else {
        return Vec::new();
    };
    match task.await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(command = %stage, "stderr collector failed: {e}");
            Vec::new()
        }
    }
}

/// Next line without its terminator, invalid UTF-8 replaced; `None` at end of stream
///
/// `raw` is left holding the bytes exactly as read.
async fn next_line_lossy<R>(reader: &mut R, raw: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    raw.clear();
    if reader.read_until(b'\n', raw).await? == 0 {
        return Ok(None);
    }
    let bytes = raw.as_slice();
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
}

/// Executor that performs no side effects
///
/// Every pipeline it is handed is logged and recorded, then answered with
/// empty output.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    recorded: Mutex<Vec<String>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command lines that would have been executed, in order
    pub fn recorded(&self) -> Vec<String> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Executor for DryRunExecutor {
    async fn run(&self, pipeline: &Pipeline) -> Result<String> {
        let line = pipeline
            .stages()
            .iter()
            .map(Stage::to_string)
            .collect::<Vec<_>>()
            .join(" | ");
        info!("[dry-run] {line}");
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
        Ok(String::new())
    }
}
