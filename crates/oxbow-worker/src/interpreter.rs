//! The bridge into the environment's own Python interpreter.
//!
//! The worker process handles supervision and framing; the actual dynamic
//! dispatch (importing modules, calling functions, running scripts) happens
//! in a lazily-spawned `python` child driven over a JSON-lines pipe by the
//! embedded driver program.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use oxbow_protocol::Frame;

const DRIVER: &str = include_str!("driver.py");

/// A failure to report back to the host as an `error` frame.
#[derive(Debug)]
pub struct RemoteError {
    pub exception: String,
    pub traceback: Vec<String>,
}

impl RemoteError {
    pub fn internal(exception: impl Into<String>) -> Self {
        Self {
            exception: exception.into(),
            traceback: Vec::new(),
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::Error {
            exception: self.exception,
            traceback: self.traceback,
        }
    }
}

/// What the serve loop needs from an interpreter. A stub implementation
/// stands in for Python in the tests.
#[async_trait]
pub trait Interpreter: Send {
    async fn execute(
        &mut self,
        module_path: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RemoteError>;

    async fn run_script(
        &mut self,
        script_path: &str,
        args: Vec<Value>,
        run_name: &str,
    ) -> Result<Value, RemoteError>;

    /// Opens a debugger port in the interpreter and returns it.
    async fn start_debugger(&mut self) -> Result<u16, RemoteError>;

    async fn shutdown(&mut self);
}

/// Drives the environment's `python` through the embedded driver program.
#[derive(Default)]
pub struct PythonInterpreter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
}

impl PythonInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ensure_started(&mut self) -> Result<(), RemoteError> {
        if self.child.is_some() {
            return Ok(());
        }
        // `python` resolves to the environment's interpreter because the
        // worker itself was spawned inside the activated environment.
        let mut child = Command::new("python")
            .arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .map_err(|err| {
                RemoteError::internal(format!("could not start the python interpreter: {err}"))
            })?;
        self.stdin = child.stdin.take();
        self.stdout = child
            .stdout
            .take()
            .map(|stdout| BufReader::new(stdout).lines());
        self.child = Some(child);
        tracing::debug!("python driver started");
        Ok(())
    }

    fn reset(&mut self) {
        self.stdin = None;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }

    async fn request(&mut self, payload: Value) -> Result<Value, RemoteError> {
        self.ensure_started().await?;

        let mut line = serde_json::to_string(&payload)
            .map_err(|err| RemoteError::internal(format!("unserializable request: {err}")))?;
        line.push('\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RemoteError::internal("the interpreter bridge is closed"))?;
        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            self.reset();
            return Err(RemoteError::internal(format!(
                "the interpreter bridge broke while sending: {err}"
            )));
        }

        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| RemoteError::internal("the interpreter bridge is closed"))?;
        let reply = match stdout.next_line().await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                self.reset();
                return Err(RemoteError::internal("the python interpreter exited"));
            }
            Err(err) => {
                self.reset();
                return Err(RemoteError::internal(format!(
                    "the interpreter bridge broke while receiving: {err}"
                )));
            }
        };

        let reply: Value = serde_json::from_str(&reply).map_err(|err| {
            RemoteError::internal(format!("garbled reply from the interpreter: {err}"))
        })?;
        if let Some(err) = reply.get("err") {
            return Err(RemoteError {
                exception: err
                    .get("exception")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown interpreter error")
                    .to_string(),
                traceback: err
                    .get("traceback")
                    .and_then(Value::as_array)
                    .map(|lines| {
                        lines
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            });
        }
        Ok(reply.get("ok").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Interpreter for PythonInterpreter {
    async fn execute(
        &mut self,
        module_path: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RemoteError> {
        self.request(json!({
            "op": "execute",
            "module_path": module_path,
            "function": function,
            "args": args,
            "kwargs": kwargs,
        }))
        .await
    }

    async fn run_script(
        &mut self,
        script_path: &str,
        args: Vec<Value>,
        run_name: &str,
    ) -> Result<Value, RemoteError> {
        self.request(json!({
            "op": "run",
            "script_path": script_path,
            "args": args,
            "run_name": run_name,
        }))
        .await
    }

    async fn start_debugger(&mut self) -> Result<u16, RemoteError> {
        let reply = self.request(json!({"op": "debug"})).await?;
        reply
            .get("debug_port")
            .and_then(Value::as_u64)
            .map(|port| port as u16)
            .ok_or_else(|| RemoteError::internal("the interpreter reported no debug port"))
    }

    async fn shutdown(&mut self) {
        if let Some(stdin) = self.stdin.as_mut() {
            let _ = stdin.write_all(b"{\"op\": \"exit\"}\n").await;
            let _ = stdin.flush().await;
        }
        if let Some(mut child) = self.child.take() {
            let graceful =
                tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await;
            if graceful.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        self.stdin = None;
        self.stdout = None;
    }
}
