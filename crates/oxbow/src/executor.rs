//! Writes command lists to a temporary script, runs them in a shell and
//! streams the merged output line by line.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{OxbowError, Result};

/// A callback receiving each output line of a supervised process.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for one script execution.
#[derive(Clone)]
pub struct RunOptions {
    /// Interleave an abort-on-failure check after every command.
    pub check_errors: bool,
    /// Forward output lines to the tracing log.
    pub log_output: bool,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    /// Extra per-line callbacks, invoked after logging.
    pub sinks: Vec<LogSink>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            check_errors: true,
            log_output: true,
            cwd: None,
            envs: Vec::new(),
            sinks: Vec::new(),
        }
    }
}

impl RunOptions {
    pub fn quiet() -> Self {
        Self {
            log_output: false,
            ..Default::default()
        }
    }
}

struct LineBuffer {
    lines: parking_lot::Mutex<Vec<String>>,
    closed: AtomicBool,
    version: watch::Sender<u64>,
}

impl LineBuffer {
    fn new() -> Self {
        Self {
            lines: parking_lot::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            version: watch::Sender::new(0),
        }
    }

    fn push(&self, line: String) {
        self.lines.lock().push(line);
        self.version.send_modify(|v| *v += 1);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.version.send_modify(|v| *v += 1);
    }
}

/// A running script with its line pump.
///
/// The pump keeps every line; [`ProcessHandle::wait_for_line`] can therefore
/// never miss an announcement that raced its caller, and completion returns
/// the full output.
pub struct ProcessHandle {
    child: Child,
    buffer: Arc<LineBuffer>,
    pumps: JoinHandle<()>,
    fatal: Arc<AtomicBool>,
    tail: String,
    _script: tempfile::NamedTempFile,
}

impl ProcessHandle {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Blocks until a line matching the predicate has been seen, including
    /// lines that arrived before the call. Returns `None` on timeout or when
    /// the stream closed without a match.
    pub async fn wait_for_line<F>(&self, predicate: F, timeout: Duration) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut receiver = self.buffer.version.subscribe();
        let mut cursor = 0;
        loop {
            {
                let lines = self.buffer.lines.lock();
                while cursor < lines.len() {
                    if predicate(&lines[cursor]) {
                        return Some(lines[cursor].clone());
                    }
                    cursor += 1;
                }
                if self.buffer.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            match tokio::time::timeout_at(deadline, receiver.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    let lines = self.buffer.lines.lock();
                    return lines[cursor.min(lines.len())..]
                        .iter()
                        .find(|line| predicate(line))
                        .cloned();
                }
            }
        }
    }

    /// Waits until the output stream closed and the process exited, then
    /// enforces the failure policy and returns the collected lines.
    pub async fn stream_to_completion(mut self) -> Result<Vec<String>> {
        let _ = (&mut self.pumps).await;
        let status = self.child.wait().await?;
        if self.fatal.load(Ordering::Acquire) {
            return Err(OxbowError::Command {
                tail: self.tail,
                exit_code: None,
            });
        }
        if !status.success() {
            return Err(OxbowError::Command {
                tail: self.tail,
                exit_code: status.code(),
            });
        }
        Ok(self.buffer.lines.lock().clone())
    }

    /// Kills the process group and reaps the shell. The spawned shell is
    /// usually a wrapper around the real workload, so the whole group goes.
    pub async fn kill_tree(&mut self) {
        if let Some(pid) = self.child.id() {
            kill_process_group(pid);
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

pub(crate) fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
    }
}

/// Runs command lists in a shell. The trait is the seam the manager and the
/// worker supervisor depend on, so tests can substitute a recording runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn spawn(&self, commands: Vec<String>, options: RunOptions) -> Result<ProcessHandle>;

    async fn run_to_completion(
        &self,
        commands: Vec<String>,
        options: RunOptions,
    ) -> Result<Vec<String>> {
        self.spawn(commands, options)
            .await?
            .stream_to_completion()
            .await
    }
}

/// The real executor.
#[derive(Debug, Default)]
pub struct CommandExecutor;

#[async_trait]
impl CommandRunner for CommandExecutor {
    async fn spawn(&self, commands: Vec<String>, options: RunOptions) -> Result<ProcessHandle> {
        let windows = cfg!(windows);
        let script = build_script(&commands, options.check_errors, windows);
        let tail = command_tail(&commands);

        let mut file = tempfile::Builder::new()
            .prefix("oxbow-")
            .suffix(if windows { ".ps1" } else { ".sh" })
            .tempfile()?;
        std::io::Write::write_all(&mut file, script.as_bytes())?;
        std::io::Write::flush(&mut file)?;
        tracing::debug!(script = %file.path().display(), "executing command script");

        let mut command = if windows {
            let mut command = Command::new("powershell");
            command.args([
                "-WindowStyle",
                "Hidden",
                "-NoProfile",
                "-ExecutionPolicy",
                "ByPass",
                "-File",
            ]);
            command.arg(file.path());
            command
        } else {
            let mut command = Command::new("/bin/bash");
            command.arg(file.path());
            command
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &options.envs {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let buffer = Arc::new(LineBuffer::new());
        let fatal = Arc::new(AtomicBool::new(false));
        let sinks = Arc::new(options.sinks.clone());

        let out_pump = pump(stdout, buffer.clone(), sinks.clone(), fatal.clone(), options.log_output, pid);
        let err_pump = pump(stderr, buffer.clone(), sinks, fatal.clone(), options.log_output, pid);
        let watcher_buffer = buffer.clone();
        let pumps = tokio::spawn(async move {
            let _ = tokio::join!(out_pump, err_pump);
            watcher_buffer.close();
        });

        Ok(ProcessHandle {
            child,
            buffer,
            pumps,
            fatal,
            tail,
            _script: file,
        })
    }
}

fn pump<R>(
    reader: R,
    buffer: Arc<LineBuffer>,
    sinks: Arc<Vec<LogSink>>,
    fatal: Arc<AtomicBool>,
    log_output: bool,
    pid: Option<u32>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim().to_string();
                    if log_output {
                        tracing::info!(target: "oxbow::process", "{line}");
                    }
                    for sink in sinks.iter() {
                        let result =
                            std::panic::catch_unwind(AssertUnwindSafe(|| sink(&line)));
                        if result.is_err() {
                            tracing::error!("a log callback panicked; continuing");
                        }
                    }
                    if line.contains("CondaSystemExit") {
                        fatal.store(true, Ordering::Release);
                        if let Some(pid) = pid {
                            kill_process_group(pid);
                        }
                    }
                    buffer.push(line);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!("error reading process output: {err}");
                    break;
                }
            }
        }
    })
}

fn build_script(commands: &[String], check_errors: bool, windows: bool) -> String {
    if !check_errors {
        return commands.join("\n");
    }
    let checks: &[&str] = if windows {
        &["", "if (! $?) { exit 1 } "]
    } else {
        &[
            "",
            "return_status=$?",
            "if [ $return_status -ne 0 ]",
            "then",
            "    echo \"Errors encountered during execution. Exited with status: $return_status\"",
            "    exit 1",
            "fi",
            "",
        ]
    };
    let mut script = Vec::new();
    for command in commands {
        script.push(command.clone());
        script.extend(checks.iter().map(|line| line.to_string()));
    }
    script.join("\n")
}

/// The abbreviated command list carried by failure errors.
fn command_tail(commands: &[String]) -> String {
    let rendered = format!("{commands:?}");
    if rendered.chars().count() <= 150 {
        return rendered;
    }
    let cut = rendered
        .char_indices()
        .rev()
        .nth(149)
        .map(|(index, _)| index)
        .unwrap_or(0);
    format!("[...] {}", &rendered[cut..])
}
