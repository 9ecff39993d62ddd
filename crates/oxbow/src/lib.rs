//! Isolated execution environments for Python workloads.
//!
//! A [`Manager`] provisions Conda environments through a Pixi or Micromamba
//! backend, spawns a long-lived worker inside each one and dispatches module
//! function calls and script runs to those workers over a local framed IPC
//! channel. Dependency sets the host runtime already satisfies are served by
//! the internal environment instead, without spawning anything.
//!
//! ```no_run
//! # async fn demo() -> oxbow::Result<()> {
//! use oxbow::{Dependencies, Manager, ManagerOptions, PlatformCommands};
//!
//! let manager = Manager::new(ManagerOptions::default())?;
//! let deps = Dependencies {
//!     conda: vec!["numpy".into()],
//!     ..Default::default()
//! };
//! let env = manager
//!     .create("imaging", deps, &PlatformCommands::default(), false)
//!     .await?;
//! env.launch(&PlatformCommands::default(), None).await?;
//! let result = env
//!     .execute("segment.py", "run", vec![serde_json::json!([1, 2, 3])], Default::default())
//!     .await?;
//! println!("{result:?}");
//! env.exit().await?;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod deps;
pub mod environment;
pub mod error;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod manifest;
pub mod settings;

pub use commands::PlatformCommands;
pub use deps::{
    Dependencies, DetailedRequirement, InstalledPackage, PackageKind, Requirement,
};
pub use environment::{Environment, ExternalEnvironment, Handler, InternalEnvironment};
pub use error::{OxbowError, Result};
pub use executor::{CommandExecutor, CommandRunner, LogSink, ProcessHandle, RunOptions};
pub use manager::{Manager, ManagerOptions};
pub use settings::{Backend, ProxyMap, Settings};
