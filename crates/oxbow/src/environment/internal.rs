//! The environment that is the host process itself.
//!
//! The host does not embed an interpreter, so in-process execution is a
//! typed dispatch: the embedding application registers handlers keyed by
//! `(module name, function name)` and `execute` looks them up. Dynamic
//! imports only exist inside external workers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{OxbowError, Result};

/// An in-process handler standing in for a module function.
pub type Handler =
    Box<dyn Fn(&[Value], &Map<String, Value>) -> Result<Value> + Send + Sync>;

pub struct InternalEnvironment {
    name: String,
    path: Option<PathBuf>,
    python_version: Option<String>,
    handlers: parking_lot::RwLock<HashMap<(String, String), Handler>>,
}

impl std::fmt::Debug for InternalEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalEnvironment")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl InternalEnvironment {
    pub(crate) fn new(
        name: impl Into<String>,
        path: Option<PathBuf>,
        python_version: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path,
            python_version,
            handlers: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host runtime's own environment prefix, when the embedding
    /// application points at one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The Python version the host runtime considers its own, used by the
    /// dependency reconciler.
    pub fn python_version(&self) -> Option<&str> {
        self.python_version.as_deref()
    }

    /// Registers the in-process handler for `module`.`function`.
    pub fn register<F>(&self, module: impl Into<String>, function: impl Into<String>, handler: F)
    where
        F: Fn(&[Value], &Map<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert((module.into(), function.into()), Box::new(handler));
    }

    /// Calls the handler registered for the module at `module_path`. The
    /// module is addressed by file stem, matching how a worker would import
    /// it.
    pub fn execute(
        &self,
        module_path: &Path,
        function: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value> {
        let module = module_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| module_path.display().to_string());
        let handlers = self.handlers.read();
        match handlers.get(&(module, function.to_string())) {
            Some(handler) => handler(args, kwargs),
            None => Err(OxbowError::NoFunction {
                module: module_path.display().to_string(),
                function: function.to_string(),
            }),
        }
    }
}
