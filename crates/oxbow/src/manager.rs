//! The process-wide coordinator: registry, lifecycle entry points and the
//! shared state every environment handle hangs on to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rattler_conda_types::Platform;
use serde_json::json;

use crate::commands::{self, EnvTarget, PlatformCommands};
use crate::deps::{
    Dependencies, InstalledPackage, PackageKind, dependencies_satisfied, format_dependencies,
    json_document, mentions_package, parse_installed_json, parse_pip_freeze,
};
use crate::environment::{Environment, ExternalEnvironment, InternalEnvironment};
use crate::error::{OxbowError, Result};
use crate::executor::{CommandExecutor, CommandRunner, ProcessHandle, RunOptions};
use crate::manifest::{self, ManifestOptions};
use crate::settings::{Backend, ProxyMap, Settings};

/// Python version pinned into new environments when the dependency set does
/// not constrain one.
const DEFAULT_PYTHON: &str = "3.12";

const DEBUG_PORTS_FILE: &str = "debug_ports.json";

/// Construction parameters for a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Directory holding this instance's state: logs, the debug-port map
    /// and, by default, the backend installation.
    pub instance_dir: PathBuf,
    /// Backend installation root; defaults to `<instance_dir>/pixi`.
    pub backend_root: Option<PathBuf>,
    /// Defaults to inferring from the root path, falling back to Pixi.
    pub backend: Option<Backend>,
    /// Prefix (Micromamba) or manifest (Pixi) of the environment the host
    /// runtime itself runs in, consulted by the dependency reconciler.
    pub main_environment_path: Option<PathBuf>,
    /// Python version of the host runtime, for the reconciler's python
    /// check when no main environment path is available.
    pub main_python_version: Option<String>,
    /// Have workers open a debugger port and record it in the instance
    /// directory.
    pub debug: bool,
    /// Explicit worker program; defaults to the `OXBOW_WORKER` variable or
    /// an `oxbow-worker` binary next to the current executable.
    pub worker_program: Option<PathBuf>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            instance_dir: PathBuf::from("oxbow"),
            backend_root: None,
            backend: None,
            main_environment_path: None,
            main_python_version: None,
            debug: false,
            worker_program: None,
        }
    }
}

/// Manages isolated environments and the workers inside them.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<ManagerShared>,
}

pub(crate) struct ManagerShared {
    settings: parking_lot::RwLock<Settings>,
    executor: Arc<dyn CommandRunner>,
    registry: parking_lot::Mutex<HashMap<String, Arc<ExternalEnvironment>>>,
    main: Arc<InternalEnvironment>,
    instance_dir: PathBuf,
    debug: bool,
    worker_program: Option<PathBuf>,
}

impl Manager {
    /// Creates a manager running real shell commands.
    pub fn new(options: ManagerOptions) -> Result<Self> {
        Self::with_runner(options, Arc::new(CommandExecutor))
    }

    /// Creates a manager with a custom command runner. This is the seam
    /// tests use to observe generated commands without a backend install.
    pub fn with_runner(options: ManagerOptions, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let instance_dir = std::path::absolute(&options.instance_dir)?;
        fs_err::create_dir_all(&instance_dir)?;

        let backend_root = options
            .backend_root
            .unwrap_or_else(|| instance_dir.join("pixi"));
        let backend = options
            .backend
            .or_else(|| Backend::infer_from_path(&backend_root))
            .unwrap_or(Backend::Pixi);
        if Platform::current().is_windows()
            && backend == Backend::Micromamba
            && backend_root.to_string_lossy().contains(' ')
            && !backend_root.exists()
        {
            return Err(OxbowError::SpaceInBackendRoot(backend_root));
        }

        let main = Arc::new(InternalEnvironment::new(
            "main",
            options.main_environment_path,
            options.main_python_version,
        ));

        Ok(Self {
            shared: Arc::new(ManagerShared {
                settings: parking_lot::RwLock::new(Settings::new(backend_root, backend)),
                executor: runner,
                registry: parking_lot::Mutex::new(HashMap::new()),
                main,
                instance_dir,
                debug: options.debug,
                worker_program: options.worker_program,
            }),
        })
    }

    /// The environment representing the host runtime itself.
    pub fn main_environment(&self) -> Environment {
        Environment::Internal(self.shared.main.clone())
    }

    /// Looks up a registered environment by name.
    pub fn environment(&self, name: &str) -> Option<Environment> {
        self.shared
            .registry
            .lock()
            .get(name)
            .cloned()
            .map(Environment::External)
    }

    /// Names of all registered external environments.
    pub fn environment_names(&self) -> Vec<String> {
        self.shared.registry.lock().keys().cloned().collect()
    }

    /// Stores the proxy configuration, persisting it for Micromamba.
    pub fn set_proxies(&self, proxies: ProxyMap) -> Result<()> {
        self.shared.settings.write().set_proxies(proxies)
    }

    /// Creates an environment with the given dependency set, or returns the
    /// internal environment when the host runtime already satisfies it.
    ///
    /// Idempotent by name: a second `create` under the same name returns
    /// the registered instance untouched.
    pub async fn create(
        &self,
        name: &str,
        deps: Dependencies,
        extra_install: &PlatformCommands,
        force_external: bool,
    ) -> Result<Environment> {
        self.shared
            .create(name, deps, extra_install, force_external)
            .await
    }

    /// Like [`Manager::create`], reading the dependency set from a manifest
    /// file (`pixi.toml`, `pyproject.toml`, `environment.yml` or
    /// `requirements.txt`).
    pub async fn create_from_config(
        &self,
        name: &str,
        config_path: &Path,
        optional_dependencies: Vec<String>,
        extra_install: &PlatformCommands,
        force_external: bool,
    ) -> Result<Environment> {
        let options = ManifestOptions {
            environment: Some(name.to_string()),
            optional_dependencies,
        };
        let deps = manifest::parse(config_path, &options)?;
        self.create(name, deps, extra_install, force_external).await
    }

    /// Registers an existing on-disk environment under `name`.
    pub fn load(&self, name: &str, path: &Path) -> Result<Environment> {
        self.shared.load(name, path)
    }

    /// Installs additional dependencies into an existing environment.
    pub async fn install(
        &self,
        environment: &Environment,
        deps: &Dependencies,
        extra_install: &PlatformCommands,
    ) -> Result<Vec<String>> {
        let commands = {
            let settings = self.shared.settings.read();
            let mut commands = commands::activate_backend(&settings);
            commands.extend(commands::install_dependencies(
                &settings,
                target_of(&settings, environment)?,
                deps,
            )?);
            commands.extend(extra_install.for_current_platform());
            commands
        };
        self.shared
            .executor
            .run_to_completion(commands, RunOptions::default())
            .await
    }

    /// Spawns a shell with the environment activated and the given commands
    /// appended. The escape hatch for workloads outside the protocol.
    pub async fn execute_commands(
        &self,
        environment: &Environment,
        commands: &PlatformCommands,
        extra_activate: &PlatformCommands,
        options: RunOptions,
    ) -> Result<ProcessHandle> {
        let full = {
            let settings = self.shared.settings.read();
            let mut full = commands::activate_environment(
                &settings,
                target_of(&settings, environment)?,
                extra_activate,
            );
            full.extend(commands.for_current_platform());
            full
        };
        self.shared.executor.spawn(full, options).await
    }

    /// The packages installed in the environment, as reported by the
    /// backend (and pip, for Micromamba).
    pub async fn installed_packages(
        &self,
        environment: &Environment,
    ) -> Result<Vec<InstalledPackage>> {
        let path = environment
            .path()
            .ok_or_else(|| OxbowError::EnvironmentNotFound(PathBuf::from(environment.name())))?
            .to_path_buf();
        self.shared.installed_packages_at(&path).await
    }

    /// Whether the host runtime already satisfies the dependency set.
    pub async fn dependencies_installed(&self, deps: &Dependencies) -> Result<bool> {
        self.shared.dependencies_installed(deps).await
    }

    /// Whether an environment exists on disk at `path`.
    pub fn environment_exists(&self, path: &Path) -> bool {
        self.shared.environment_exists(path)
    }
}

/// How to address an environment in generated commands, given the backend.
fn target_of<'a>(settings: &Settings, environment: &'a Environment) -> Result<EnvTarget<'a>> {
    let path = environment
        .path()
        .ok_or_else(|| OxbowError::EnvironmentNotFound(PathBuf::from(environment.name())))?;
    Ok(match (settings.backend(), environment) {
        (Backend::Pixi, _) => EnvTarget::Manifest(path),
        (Backend::Micromamba, Environment::External(env)) => EnvTarget::Name(env.name()),
        (Backend::Micromamba, Environment::Internal(_)) => EnvTarget::Prefix(path),
    })
}

impl ManagerShared {
    pub(crate) fn settings(&self) -> parking_lot::RwLockReadGuard<'_, Settings> {
        self.settings.read()
    }

    pub(crate) fn executor(&self) -> &Arc<dyn CommandRunner> {
        &self.executor
    }

    pub(crate) fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    pub(crate) fn debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn remove_environment(&self, name: &str) {
        self.registry.lock().remove(name);
    }

    pub(crate) fn environment_exists(&self, path: &Path) -> bool {
        match self.settings.read().backend() {
            Backend::Pixi => {
                path.is_file() && Settings::pixi_default_prefix(path).join("conda-meta").is_dir()
            }
            Backend::Micromamba => path.join("conda-meta").is_dir(),
        }
    }

    /// The directory `delete` moves to the trash: the whole Pixi workspace,
    /// or the Micromamba prefix.
    pub(crate) fn trash_target(&self, path: &Path) -> PathBuf {
        match self.settings.read().backend() {
            Backend::Pixi => path.parent().unwrap_or(path).to_path_buf(),
            Backend::Micromamba => path.to_path_buf(),
        }
    }

    /// Resolves the worker program: explicit option, `OXBOW_WORKER`, then a
    /// sibling of the current executable.
    pub(crate) fn worker_program(&self) -> Result<PathBuf> {
        if let Some(program) = &self.worker_program {
            return Ok(program.clone());
        }
        if let Ok(program) = std::env::var("OXBOW_WORKER") {
            return Ok(PathBuf::from(program));
        }
        let current = std::env::current_exe()?;
        let sibling = current
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("oxbow-worker{}", std::env::consts::EXE_SUFFIX));
        if sibling.exists() {
            Ok(sibling)
        } else {
            Err(OxbowError::WorkerProgramNotFound(sibling))
        }
    }

    /// Persists a worker's debugger port into the instance directory so a
    /// debugger can attach later.
    pub(crate) fn register_debug_port(
        &self,
        name: &str,
        debug_port: u16,
        worker_program: &Path,
    ) -> Result<()> {
        let path = self.instance_dir.join(DEBUG_PORTS_FILE);
        let mut ports: serde_json::Map<String, serde_json::Value> = if path.exists() {
            serde_json::from_str(&fs_err::read_to_string(&path)?)?
        } else {
            serde_json::Map::new()
        };
        ports.insert(
            name.to_string(),
            json!({
                "debug_port": debug_port,
                "worker_path": worker_program.to_string_lossy(),
            }),
        );
        fs_err::write(&path, serde_json::to_string(&ports)?)?;
        Ok(())
    }

    pub(crate) async fn create(
        self: &Arc<Self>,
        name: &str,
        deps: Dependencies,
        extra_install: &PlatformCommands,
        force_external: bool,
    ) -> Result<Environment> {
        if let Some(existing) = self.registry.lock().get(name) {
            tracing::debug!("environment {name} already exists, returning the existing instance");
            return Ok(Environment::External(existing.clone()));
        }

        let mut deps = deps;
        if self.debug && !mentions_package(&deps.conda, "debugpy")
            && !mentions_package(&deps.pip, "debugpy")
        {
            // The worker needs a debugger compatible with whatever python
            // ends up in the environment, so the entry is unpinned.
            deps.conda.push("debugpy".into());
        }

        if !force_external && self.dependencies_installed(&deps).await? {
            return Ok(Environment::Internal(self.main.clone()));
        }

        let python_version = deps.python.clone().unwrap_or_default().replace('=', "");
        validate_python_version(&python_version)?;
        let python_requirement = if python_version.is_empty() {
            DEFAULT_PYTHON.to_string()
        } else {
            python_version
        };

        let (path, commands) = {
            let settings = self.settings.read();
            let path = settings.environment_path(name);
            let mut commands = commands::activate_backend(&settings);
            match settings.backend() {
                Backend::Pixi => {
                    let binary = settings.binary_path();
                    if !path.exists() {
                        let platform_args = if Platform::current().is_windows() {
                            " --platform win-64"
                        } else {
                            ""
                        };
                        commands.push(format!(
                            "\"{}\" init --no-progress{platform_args} \"{}\"",
                            binary.display(),
                            path.parent().unwrap_or(&path).display()
                        ));
                    }
                    commands.push(format!(
                        "\"{}\" add --no-progress --manifest-path \"{}\" python={python_requirement}",
                        binary.display(),
                        path.display()
                    ));
                    commands.extend(commands::install_dependencies(
                        &settings,
                        EnvTarget::Manifest(&path),
                        &deps,
                    )?);
                }
                Backend::Micromamba => {
                    commands.push(format!(
                        "micromamba create -n {name} python={python_requirement} -y"
                    ));
                    commands.extend(commands::install_dependencies(
                        &settings,
                        EnvTarget::Name(name),
                        &deps,
                    )?);
                }
            }
            commands.extend(extra_install.for_current_platform());
            (path, commands)
        };

        let environment = Arc::new(ExternalEnvironment::new(name, path, self.clone()));
        self.registry
            .lock()
            .insert(name.to_string(), environment.clone());
        self.executor
            .run_to_completion(commands, RunOptions::default())
            .await?;
        Ok(Environment::External(environment))
    }

    pub(crate) fn load(self: &Arc<Self>, name: &str, path: &Path) -> Result<Environment> {
        let path = std::path::absolute(path)?;
        if !self.environment_exists(&path) {
            return Err(OxbowError::EnvironmentNotFound(path));
        }
        let mut registry = self.registry.lock();
        let environment = registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ExternalEnvironment::new(name, path, self.clone())));
        Ok(Environment::External(environment.clone()))
    }

    pub(crate) async fn dependencies_installed(&self, deps: &Dependencies) -> Result<bool> {
        if deps.is_empty() {
            return Ok(true);
        }

        let conda = format_dependencies(PackageKind::Conda, deps, false)?;
        let pip = format_dependencies(PackageKind::Pypi, deps, false)?;

        let Some(main_path) = self.main.path().map(Path::to_path_buf) else {
            // Without a prefix there is no package metadata to consult; only
            // the python constraint can be checked, against the configured
            // host version.
            if let Some(python) = deps.python.as_deref().filter(|p| !p.is_empty()) {
                let constraint = python.replace('=', "");
                match self.main.python_version() {
                    Some(version) if version.starts_with(&constraint) => {}
                    _ => return Ok(false),
                }
            }
            return Ok(conda.is_empty() && pip.is_empty());
        };

        let installed = self.installed_packages_at(&main_path).await?;
        dependencies_satisfied(deps, &installed, self.main.python_version())
    }

    pub(crate) async fn installed_packages_at(
        &self,
        path: &Path,
    ) -> Result<Vec<InstalledPackage>> {
        let backend = self.settings.read().backend();
        match backend {
            Backend::Pixi => {
                let commands = {
                    let settings = self.settings.read();
                    let mut commands = commands::activate_backend(&settings);
                    commands.push(format!(
                        "\"{}\" list --json --manifest-path \"{}\"",
                        settings.binary_path().display(),
                        path.display()
                    ));
                    commands
                };
                let lines = self
                    .executor
                    .run_to_completion(commands, RunOptions::quiet())
                    .await?;
                parse_installed_json(&json_document(&lines).unwrap_or_default())
            }
            Backend::Micromamba => {
                let (list_commands, freeze_commands) = {
                    let settings = self.settings.read();
                    let activate = commands::activate_environment(
                        &settings,
                        EnvTarget::Prefix(path),
                        &PlatformCommands::default(),
                    );
                    let mut list_commands = activate.clone();
                    list_commands.push("micromamba list --json".to_string());
                    let mut freeze_commands = activate;
                    freeze_commands.push("pip freeze --all".to_string());
                    (list_commands, freeze_commands)
                };
                let lines = self
                    .executor
                    .run_to_completion(list_commands, RunOptions::quiet())
                    .await?;
                let mut packages =
                    parse_installed_json(&json_document(&lines).unwrap_or_default())?;
                let lines = self
                    .executor
                    .run_to_completion(freeze_commands, RunOptions::quiet())
                    .await?;
                packages.extend(parse_pip_freeze(lines.iter()));
                Ok(packages)
            }
        }
    }
}

fn validate_python_version(version: &str) -> Result<()> {
    let mut parts = version.split('.');
    let major: Option<u32> = parts.next().and_then(|part| part.trim().parse().ok());
    let minor: Option<u32> = parts.next().and_then(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    });
    if let (Some(major), Some(minor)) = (major, minor) {
        if major < 3 || (major == 3 && minor < 9) {
            return Err(OxbowError::InvalidPythonVersion(version.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct RecordingRunner {
        calls: parking_lot::Mutex<Vec<Vec<String>>>,
        outputs: parking_lot::Mutex<VecDeque<Vec<String>>>,
    }

    impl RecordingRunner {
        fn queue_output(&self, lines: &[&str]) {
            self.outputs
                .lock()
                .push_back(lines.iter().map(|line| line.to_string()).collect());
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn joined_calls(&self) -> String {
            self.calls
                .lock()
                .iter()
                .map(|commands| commands.join("\n"))
                .collect::<Vec<_>>()
                .join("\n---\n")
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn spawn(&self, _commands: Vec<String>, _options: RunOptions) -> Result<ProcessHandle> {
            Err(OxbowError::Launch(
                "spawning is not available with the recording runner".to_string(),
            ))
        }

        async fn run_to_completion(
            &self,
            commands: Vec<String>,
            _options: RunOptions,
        ) -> Result<Vec<String>> {
            self.calls.lock().push(commands);
            Ok(self.outputs.lock().pop_front().unwrap_or_default())
        }
    }

    fn manager_with(
        dir: &tempfile::TempDir,
        mutate: impl FnOnce(&mut ManagerOptions),
    ) -> (Manager, Arc<RecordingRunner>) {
        let mut options = ManagerOptions {
            instance_dir: dir.path().join("instance"),
            backend_root: Some(dir.path().join("micromamba")),
            backend: Some(Backend::Micromamba),
            ..Default::default()
        };
        mutate(&mut options);
        let runner = Arc::new(RecordingRunner::default());
        let manager = Manager::with_runner(options, runner.clone()).unwrap();
        (manager, runner)
    }

    fn numpy_deps() -> Dependencies {
        Dependencies {
            conda: vec!["numpy".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runner) = manager_with(&dir, |_| {});

        let first = manager
            .create("cellpose", numpy_deps(), &PlatformCommands::default(), false)
            .await
            .unwrap();
        let second = manager
            .create("cellpose", numpy_deps(), &PlatformCommands::default(), false)
            .await
            .unwrap();

        assert_eq!(runner.call_count(), 1);
        let (first, second) = (first.as_external().unwrap(), second.as_external().unwrap());
        assert!(Arc::ptr_eq(first, second));
    }

    #[tokio::test]
    async fn create_pins_the_default_python_when_unconstrained() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runner) = manager_with(&dir, |_| {});
        manager
            .create("plain", numpy_deps(), &PlatformCommands::default(), true)
            .await
            .unwrap();
        assert!(
            runner
                .joined_calls()
                .contains(&format!("micromamba create -n plain python={DEFAULT_PYTHON} -y"))
        );
    }

    #[tokio::test]
    async fn create_refuses_python_older_than_3_9() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runner) = manager_with(&dir, |_| {});
        for version in ["3.8.0", "2.7", "3.8"] {
            let deps = Dependencies {
                python: Some(version.to_string()),
                ..Default::default()
            };
            let err = manager
                .create("old", deps, &PlatformCommands::default(), true)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("greater than 3.8"), "{version}");
        }
        assert_eq!(runner.call_count(), 0);

        let deps = Dependencies {
            python: Some("3.9".to_string()),
            ..Default::default()
        };
        manager
            .create("new", deps, &PlatformCommands::default(), true)
            .await
            .unwrap();
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn debug_mode_injects_debugpy_once() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runner) = manager_with(&dir, |options| options.debug = true);
        manager
            .create("dbg", numpy_deps(), &PlatformCommands::default(), true)
            .await
            .unwrap();
        assert!(runner.joined_calls().contains("\"debugpy\""));

        let deps = Dependencies {
            conda: vec!["debugpy==1.8".into()],
            ..Default::default()
        };
        manager
            .create("pinned", deps, &PlatformCommands::default(), true)
            .await
            .unwrap();
        let calls = runner.joined_calls();
        let last = calls.split("---").last().unwrap();
        assert!(last.contains("debugpy==1.8"));
        assert_eq!(last.matches("debugpy").count(), 1);
    }

    #[tokio::test]
    async fn create_reuses_the_internal_environment_when_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runner) = manager_with(&dir, |options| {
            options.main_python_version = Some("3.12.7".to_string());
        });
        let deps = Dependencies {
            python: Some("=3.12".to_string()),
            ..Default::default()
        };
        let environment = manager
            .create("host", deps.clone(), &PlatformCommands::default(), false)
            .await
            .unwrap();
        assert!(!environment.is_external());
        assert_eq!(runner.call_count(), 0);

        let environment = manager
            .create("forced", deps, &PlatformCommands::default(), true)
            .await
            .unwrap();
        assert!(environment.is_external());
        assert_eq!(runner.call_count(), 1);
    }

    #[tokio::test]
    async fn reconciliation_consults_the_main_environment_packages() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = dir.path().join("main-env");
        fs_err::create_dir_all(main_path.join("conda-meta")).unwrap();
        let (manager, runner) = manager_with(&dir, |options| {
            options.main_environment_path = Some(main_path.clone());
        });

        // One output for `micromamba list --json`, one for `pip freeze`.
        runner.queue_output(&["[", "  {\"name\": \"numpy\", \"version\": \"1.26.4\"}", "]"]);
        runner.queue_output(&[]);

        let environment = manager
            .create("host", numpy_deps(), &PlatformCommands::default(), false)
            .await
            .unwrap();
        assert!(!environment.is_external());
        // Both gathering commands ran, but no create command.
        assert_eq!(runner.call_count(), 2);
        assert!(!runner.joined_calls().contains("micromamba create"));
    }

    #[tokio::test]
    async fn unsatisfied_dependencies_force_an_external_environment() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = dir.path().join("main-env");
        fs_err::create_dir_all(main_path.join("conda-meta")).unwrap();
        let (manager, runner) = manager_with(&dir, |options| {
            options.main_environment_path = Some(main_path.clone());
        });

        runner.queue_output(&["[", "]"]);
        runner.queue_output(&[]);

        let environment = manager
            .create("iso", numpy_deps(), &PlatformCommands::default(), false)
            .await
            .unwrap();
        assert!(environment.is_external());
        assert!(runner.joined_calls().contains("micromamba create -n iso"));
    }

    #[tokio::test]
    async fn pip_channel_specs_fail_before_anything_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runner) = manager_with(&dir, |_| {});
        let deps = Dependencies {
            pip: vec!["conda-forge::requests".into()],
            ..Default::default()
        };
        let err = manager
            .create("bad", deps, &PlatformCommands::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, OxbowError::PipChannelSpec(_)));
        assert_eq!(runner.call_count(), 0);
        assert!(manager.environment("bad").is_none());
    }

    #[tokio::test]
    async fn extra_install_commands_run_for_the_current_platform() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runner) = manager_with(&dir, |_| {});
        let extra = PlatformCommands {
            all: vec!["echo shared".to_string()],
            windows: vec!["echo windows-only".to_string()],
            ..Default::default()
        };
        manager
            .create("extras", numpy_deps(), &extra, true)
            .await
            .unwrap();
        let calls = runner.joined_calls();
        assert!(calls.contains("echo shared"));
        if !Platform::current().is_windows() {
            assert!(!calls.contains("echo windows-only"));
        }
    }

    #[test]
    fn load_requires_an_existing_environment() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runner) = manager_with(&dir, |_| {});
        let missing = dir.path().join("nope");
        let err = manager.load("nope", &missing).unwrap_err();
        assert!(matches!(err, OxbowError::EnvironmentNotFound(_)));
    }

    #[test]
    fn load_registers_and_reuses_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runner) = manager_with(&dir, |_| {});
        let prefix = dir.path().join("existing");
        fs_err::create_dir_all(prefix.join("conda-meta")).unwrap();

        let first = manager.load("existing", &prefix).unwrap();
        let second = manager.load("existing", &prefix).unwrap();
        assert!(Arc::ptr_eq(
            first.as_external().unwrap(),
            second.as_external().unwrap()
        ));
        assert_eq!(manager.environment_names(), vec!["existing".to_string()]);
    }

    #[test]
    fn pixi_environments_exist_via_manifest_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runner) = manager_with(&dir, |options| {
            options.backend = Some(Backend::Pixi);
        });
        let workspace = dir.path().join("envs").join("e");
        let manifest = workspace.join("pixi.toml");
        assert!(!manager.environment_exists(&manifest));

        fs_err::create_dir_all(&workspace).unwrap();
        fs_err::write(&manifest, "[workspace]\n").unwrap();
        assert!(!manager.environment_exists(&manifest));

        fs_err::create_dir_all(
            workspace
                .join(".pixi")
                .join("envs")
                .join("default")
                .join("conda-meta"),
        )
        .unwrap();
        assert!(manager.environment_exists(&manifest));
    }

    #[tokio::test]
    async fn install_targets_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runner) = manager_with(&dir, |_| {});
        let environment = manager
            .create("target", Dependencies::default(), &PlatformCommands::default(), true)
            .await
            .unwrap();

        manager
            .install(&environment, &numpy_deps(), &PlatformCommands::default())
            .await
            .unwrap();
        let calls = runner.joined_calls();
        assert!(calls.contains("micromamba activate target"));
        assert!(calls.contains("micromamba install \"numpy\" -y"));
    }

    #[test]
    fn debug_ports_are_persisted_per_environment() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runner) = manager_with(&dir, |_| {});
        manager
            .shared
            .register_debug_port("imaging", 5678, Path::new("/usr/bin/oxbow-worker"))
            .unwrap();
        manager
            .shared
            .register_debug_port("other", 5679, Path::new("/usr/bin/oxbow-worker"))
            .unwrap();

        let contents =
            fs_err::read_to_string(manager.shared.instance_dir().join(DEBUG_PORTS_FILE)).unwrap();
        let ports: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(ports["imaging"]["debug_port"], 5678);
        assert_eq!(ports["other"]["debug_port"], 5679);
    }

    #[test]
    fn worker_program_resolution_prefers_the_explicit_option() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _runner) = manager_with(&dir, |options| {
            options.worker_program = Some(PathBuf::from("/opt/oxbow-worker"));
        });
        assert_eq!(
            manager.shared.worker_program().unwrap(),
            PathBuf::from("/opt/oxbow-worker")
        );

        let (manager, _runner) = manager_with(&dir, |_| {});
        temp_env::with_var("OXBOW_WORKER", Some("/var/oxbow-worker"), || {
            assert_eq!(
                manager.shared.worker_program().unwrap(),
                PathBuf::from("/var/oxbow-worker")
            );
        });
    }

    #[test]
    fn python_version_floor() {
        assert!(validate_python_version("").is_ok());
        assert!(validate_python_version("3.12.1").is_ok());
        assert!(validate_python_version("3.9").is_ok());
        assert!(validate_python_version("4.0").is_ok());
        assert!(validate_python_version("3.8.19").is_err());
        assert!(validate_python_version("2.7").is_err());
    }
}
