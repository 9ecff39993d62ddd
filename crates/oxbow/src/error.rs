use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::manifest::ManifestError;

pub type Result<T, E = OxbowError> = std::result::Result<T, E>;

/// Errors surfaced by the host library.
///
/// Connection loss during a remote call is deliberately absent: the affected
/// operations return `Ok(None)` instead, see
/// [`ExternalEnvironment::execute`](crate::environment::ExternalEnvironment::execute).
#[derive(Debug, Error, Diagnostic)]
pub enum OxbowError {
    #[error(
        "the package {name} is not available on this platform ({current}), only on: {}",
        platforms.join(", ")
    )]
    Incompatibility {
        name: String,
        platforms: Vec<String>,
        current: String,
    },

    #[error("Python version must be greater than 3.8 (requested {0})")]
    InvalidPythonVersion(String),

    #[error("one pip dependency has a channel specifier \"::\", is it a conda dependency? ({0})")]
    PipChannelSpec(String),

    #[error("the execution of the commands {tail:?} failed{}", exit_code.map(|c| format!(" with exit status {c}")).unwrap_or_default())]
    Command {
        tail: String,
        exit_code: Option<i32>,
    },

    #[error("failed to launch the worker: {0}")]
    Launch(String),

    #[error("remote execution failed: {exception}")]
    Execution {
        exception: String,
        traceback: Vec<String>,
    },

    #[error("the worker connection is not ready")]
    ConnectionNotReady,

    #[error("module {module} has no function {function}")]
    NoFunction { module: String, function: String },

    #[error("cannot launch the internal environment")]
    CannotLaunchInternal,

    #[error("the internal environment cannot run scripts")]
    CannotRunScriptInternally,

    #[error("cannot delete or update the internal environment")]
    CannotDeleteInternal,

    #[error("the environment {} was not found", .0.display())]
    EnvironmentNotFound(PathBuf),

    #[error(
        "no worker program at {}, set ManagerOptions::worker_program or the OXBOW_WORKER variable",
        .0.display()
    )]
    WorkerProgramNotFound(PathBuf),

    #[error(
        "the Micromamba root cannot contain a space character on Windows (given {})",
        .0.display()
    )]
    SpaceInBackendRoot(PathBuf),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Protocol(#[from] oxbow_protocol::ProtocolError),

    #[error("failed to move {} to the trash", .path.display())]
    Trash {
        path: PathBuf,
        #[source]
        source: trash::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
