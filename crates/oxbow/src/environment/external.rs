//! Supervision of the worker process backing an external environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use oxbow_protocol::{Connection, Frame};
use serde_json::{Map, Value};
use tokio::net::TcpStream;

use crate::commands::PlatformCommands;
use crate::error::{OxbowError, Result};
use crate::executor::{LogSink, ProcessHandle, RunOptions};
use crate::manager::ManagerShared;

const PORT_PREFIX: &str = "Listening port ";
const DEBUG_PORT_PREFIX: &str = "Listening debug port ";
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEBUG_LAUNCH_TIMEOUT: Duration = Duration::from_secs(5);

struct Worker {
    handle: ProcessHandle,
    port: u16,
    connection: Connection<TcpStream>,
}

impl Worker {
    fn alive(&mut self) -> bool {
        matches!(self.handle.try_wait(), Ok(None)) && self.connection.get_ref().peer_addr().is_ok()
    }
}

/// An environment backed by an on-disk prefix and, once launched, a worker
/// subprocess reachable over the frame channel.
///
/// Every operation serializes on the per-environment lock, which also
/// guarantees at most one outstanding request per connection.
pub struct ExternalEnvironment {
    name: String,
    path: PathBuf,
    shared: Arc<ManagerShared>,
    worker: tokio::sync::Mutex<Option<Worker>>,
    global_log_callback: Arc<parking_lot::Mutex<Option<LogSink>>>,
    execution_log_callback: Arc<parking_lot::Mutex<Option<LogSink>>>,
}

impl std::fmt::Debug for ExternalEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalEnvironment")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl ExternalEnvironment {
    pub(crate) fn new(
        name: impl Into<String>,
        path: PathBuf,
        shared: Arc<ManagerShared>,
    ) -> Self {
        Self {
            name: name.into(),
            path,
            shared,
            worker: tokio::sync::Mutex::new(None),
            global_log_callback: Arc::new(parking_lot::Mutex::new(None)),
            execution_log_callback: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The environment prefix (Micromamba) or manifest file (Pixi).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The rendezvous port of the running worker, if any.
    pub async fn port(&self) -> Option<u16> {
        self.worker.lock().await.as_ref().map(|worker| worker.port)
    }

    fn log_sink(&self) -> LogSink {
        let global = self.global_log_callback.clone();
        let execution = self.execution_log_callback.clone();
        Arc::new(move |line: &str| {
            if let Some(callback) = global.lock().as_ref() {
                callback(line);
            }
            if let Some(callback) = execution.lock().as_ref() {
                callback(line);
            }
        })
    }

    /// Starts the worker inside the environment and opens the frame channel.
    ///
    /// Idempotent: returns immediately when a live worker already exists.
    /// The optional callback receives every output line of the worker for
    /// its whole lifetime.
    pub async fn launch(
        &self,
        extra_activate: &PlatformCommands,
        log_callback: Option<LogSink>,
    ) -> Result<()> {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.as_mut() {
            if worker.alive() {
                return Ok(());
            }
            *slot = None;
        }

        *self.global_log_callback.lock() = log_callback;

        let worker_program = self.shared.worker_program()?;
        let commands = {
            let settings = self.shared.settings();
            let target = match settings.backend() {
                crate::settings::Backend::Pixi => crate::commands::EnvTarget::Manifest(&self.path),
                crate::settings::Backend::Micromamba => crate::commands::EnvTarget::Name(&self.name),
            };
            let mut commands =
                crate::commands::activate_environment(&settings, target, extra_activate);
            let debug_args = if self.shared.debug() {
                " --debug-port 0"
            } else {
                ""
            };
            commands.push(format!(
                "\"{}\" {} --instance-path \"{}\"{debug_args}",
                worker_program.display(),
                self.name,
                self.shared.instance_dir().display(),
            ));
            commands
        };

        let options = RunOptions {
            sinks: vec![self.log_sink()],
            ..Default::default()
        };
        let mut handle = self.shared.executor().spawn(commands, options).await?;

        let port_line = handle
            .wait_for_line(|line| line.starts_with(PORT_PREFIX), LAUNCH_TIMEOUT)
            .await;
        let port = match port_line {
            Some(line) => parse_port(&line, PORT_PREFIX)?,
            None => {
                let detail = match handle.try_wait() {
                    Ok(Some(status)) => {
                        format!("the worker exited with {status} before announcing its port")
                    }
                    _ => "timed out waiting for the worker port announcement".to_string(),
                };
                handle.kill_tree().await;
                return Err(OxbowError::Launch(detail));
            }
        };

        if self.shared.debug() {
            let debug_line = handle
                .wait_for_line(
                    |line| line.starts_with(DEBUG_PORT_PREFIX),
                    DEBUG_LAUNCH_TIMEOUT,
                )
                .await;
            match debug_line {
                Some(line) => {
                    let debug_port = parse_port(&line, DEBUG_PORT_PREFIX)?;
                    self.shared
                        .register_debug_port(&self.name, debug_port, &worker_program)?;
                }
                None => {
                    handle.kill_tree().await;
                    return Err(OxbowError::Launch(
                        "timed out waiting for the worker debug port announcement".to_string(),
                    ));
                }
            }
        }

        if let Ok(Some(status)) = handle.try_wait() {
            return Err(OxbowError::Launch(format!(
                "the worker exited with {status} before the channel opened"
            )));
        }

        let stream = match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => stream,
            Err(err) => {
                handle.kill_tree().await;
                return Err(OxbowError::Launch(format!(
                    "could not connect to the worker on port {port}: {err}"
                )));
            }
        };
        tracing::info!(environment = %self.name, port, "worker launched");

        *slot = Some(Worker {
            handle,
            port,
            connection: Connection::new(stream),
        });
        Ok(())
    }

    /// Calls `function` from the module at `module_path` inside the worker.
    ///
    /// Returns `Ok(None)` when the connection was lost mid-request; a
    /// worker-side failure surfaces as [`OxbowError::Execution`].
    pub async fn execute(
        &self,
        module_path: impl AsRef<Path>,
        function: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        log_callback: Option<LogSink>,
    ) -> Result<Option<Value>> {
        let mut slot = self.worker.lock().await;
        let worker = slot.as_mut().ok_or(OxbowError::ConnectionNotReady)?;

        *self.execution_log_callback.lock() = log_callback;
        let frame = Frame::Execute {
            module_path: module_path.as_ref().to_string_lossy().into_owned(),
            function: function.to_string(),
            args,
            kwargs,
        };
        let result = send_and_wait(&mut worker.connection, frame).await;
        *self.execution_log_callback.lock() = None;
        result
    }

    /// Runs the script at `script_path` inside the worker as if it were
    /// invoked from the command line.
    ///
    /// The result is the script's global namespace filtered to serializable
    /// entries; everything else is silently dropped by the worker.
    pub async fn run_script(
        &self,
        script_path: impl AsRef<Path>,
        args: Vec<Value>,
        run_name: Option<&str>,
        log_callback: Option<LogSink>,
    ) -> Result<Option<Value>> {
        let mut slot = self.worker.lock().await;
        let worker = slot.as_mut().ok_or(OxbowError::ConnectionNotReady)?;

        *self.execution_log_callback.lock() = log_callback;
        let frame = Frame::Run {
            script_path: script_path.as_ref().to_string_lossy().into_owned(),
            args,
            run_name: run_name.unwrap_or("__main__").to_string(),
        };
        let result = send_and_wait(&mut worker.connection, frame).await;
        *self.execution_log_callback.lock() = None;
        result
    }

    /// True while the worker process is alive and its connection is open.
    pub async fn launched(&self) -> bool {
        let mut slot = self.worker.lock().await;
        match slot.as_mut() {
            Some(worker) => worker.alive(),
            None => false,
        }
    }

    /// Sends the termination frame, closes the channel and kills the worker
    /// process tree, then removes the environment from the registry.
    pub async fn exit(&self) -> Result<()> {
        let mut slot = self.worker.lock().await;
        if let Some(mut worker) = slot.take() {
            if let Err(err) = worker.connection.send(&Frame::Exit).await {
                tracing::debug!(environment = %self.name, "exit frame not delivered: {err}");
            }
            drop(worker.connection);
            worker.handle.kill_tree().await;
            tracing::info!(environment = %self.name, "worker stopped");
        }
        drop(slot);
        self.shared.remove_environment(&self.name);
        Ok(())
    }

    /// Tears down the worker if needed, moves the on-disk environment to the
    /// OS trash and deregisters the environment.
    pub async fn delete(&self) -> Result<()> {
        if !self.shared.environment_exists(&self.path) {
            return Err(OxbowError::EnvironmentNotFound(self.path.clone()));
        }
        if self.launched().await {
            self.exit().await?;
        }

        let target = self.shared.trash_target(&self.path);
        trash::delete(&target).map_err(|source| OxbowError::Trash {
            path: target.clone(),
            source,
        })?;
        self.shared.remove_environment(&self.name);
        Ok(())
    }

    /// Deletes the environment and recreates it under the same name with the
    /// new dependency set.
    pub async fn update(
        &self,
        deps: crate::deps::Dependencies,
        extra_install: &PlatformCommands,
    ) -> Result<crate::environment::Environment> {
        if !self.shared.environment_exists(&self.path) {
            return Err(OxbowError::EnvironmentNotFound(self.path.clone()));
        }
        self.delete().await?;
        self.shared
            .create(&self.name, deps, extra_install, false)
            .await
    }
}

fn parse_port(line: &str, prefix: &str) -> Result<u16> {
    line[prefix.len()..]
        .trim()
        .parse()
        .map_err(|_| OxbowError::Launch(format!("could not parse the port announcement {line:?}")))
}

/// Sends one request frame and waits for its terminal reply.
///
/// Non-terminal frames are logged and skipped; a lost connection yields
/// `Ok(None)` so a forced shutdown during a request is not an error.
async fn send_and_wait(
    connection: &mut Connection<TcpStream>,
    frame: Frame,
) -> Result<Option<Value>> {
    if let Err(err) = connection.send(&frame).await {
        if err.is_disconnect() {
            tracing::error!("the worker connection broke while sending: {err}");
            return Ok(None);
        }
        return Err(err.into());
    }

    loop {
        match connection.recv().await {
            Ok(Some(Frame::ExecutionFinished { result, .. })) => {
                tracing::info!("execution finished");
                return Ok(Some(result));
            }
            Ok(Some(Frame::Error {
                exception,
                traceback,
            })) => {
                tracing::error!("{exception}");
                tracing::error!("Traceback:");
                for line in &traceback {
                    tracing::error!("{}", line.trim_end());
                }
                return Err(OxbowError::Execution {
                    exception,
                    traceback,
                });
            }
            Ok(Some(other)) => {
                tracing::warn!("got an unexpected message: {other:?}");
            }
            Ok(None) => {
                tracing::info!("connection closed gracefully by the peer");
                return Ok(None);
            }
            Err(err) if err.is_disconnect() => {
                tracing::error!("the worker connection broke mid-request: {err}");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }
    }
}
