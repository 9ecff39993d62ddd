//! Environment handles: the host's own runtime or an external worker.

mod external;
mod internal;

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};

pub use external::ExternalEnvironment;
pub use internal::{Handler, InternalEnvironment};

use crate::commands::PlatformCommands;
use crate::deps::Dependencies;
use crate::error::{OxbowError, Result};
use crate::executor::LogSink;

/// A cheaply clonable handle to a registered environment.
#[derive(Debug, Clone)]
pub enum Environment {
    /// The host runtime itself; execution dispatches to registered handlers.
    Internal(Arc<InternalEnvironment>),
    /// An isolated on-disk environment with its own worker.
    External(Arc<ExternalEnvironment>),
}

impl Environment {
    pub fn name(&self) -> &str {
        match self {
            Environment::Internal(env) => env.name(),
            Environment::External(env) => env.name(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Environment::Internal(env) => env.path(),
            Environment::External(env) => Some(env.path()),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Environment::External(_))
    }

    pub fn as_internal(&self) -> Option<&Arc<InternalEnvironment>> {
        match self {
            Environment::Internal(env) => Some(env),
            Environment::External(_) => None,
        }
    }

    pub fn as_external(&self) -> Option<&Arc<ExternalEnvironment>> {
        match self {
            Environment::External(env) => Some(env),
            Environment::Internal(_) => None,
        }
    }

    /// Starts the worker for an external environment. The internal
    /// environment has nothing to launch.
    pub async fn launch(
        &self,
        extra_activate: &PlatformCommands,
        log_callback: Option<LogSink>,
    ) -> Result<()> {
        match self {
            Environment::Internal(_) => Err(OxbowError::CannotLaunchInternal),
            Environment::External(env) => env.launch(extra_activate, log_callback).await,
        }
    }

    /// Calls a module function in the environment.
    ///
    /// Internal environments dispatch to their handler table; external ones
    /// go through the worker and may return `None` on a lost connection.
    pub async fn execute(
        &self,
        module_path: impl AsRef<Path>,
        function: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Option<Value>> {
        match self {
            Environment::Internal(env) => env
                .execute(module_path.as_ref(), function, &args, &kwargs)
                .map(Some),
            Environment::External(env) => {
                env.execute(module_path, function, args, kwargs, None).await
            }
        }
    }

    /// Runs a script in the environment's worker.
    pub async fn run_script(
        &self,
        script_path: impl AsRef<Path>,
        args: Vec<Value>,
        run_name: Option<&str>,
    ) -> Result<Option<Value>> {
        match self {
            Environment::Internal(_) => Err(OxbowError::CannotRunScriptInternally),
            Environment::External(env) => {
                env.run_script(script_path, args, run_name, None).await
            }
        }
    }

    /// True when execution requests can be served right now.
    pub async fn launched(&self) -> bool {
        match self {
            Environment::Internal(_) => true,
            Environment::External(env) => env.launched().await,
        }
    }

    /// Stops the worker of an external environment; no-op for the internal
    /// one.
    pub async fn exit(&self) -> Result<()> {
        match self {
            Environment::Internal(_) => Ok(()),
            Environment::External(env) => env.exit().await,
        }
    }

    /// Removes the environment from disk and from the registry.
    pub async fn delete(&self) -> Result<()> {
        match self {
            Environment::Internal(_) => Err(OxbowError::CannotDeleteInternal),
            Environment::External(env) => env.delete().await,
        }
    }

    /// Recreates the environment with a new dependency set.
    pub async fn update(
        &self,
        deps: Dependencies,
        extra_install: &PlatformCommands,
    ) -> Result<Environment> {
        match self {
            Environment::Internal(_) => Err(OxbowError::CannotDeleteInternal),
            Environment::External(env) => env.update(deps, extra_install).await,
        }
    }
}
