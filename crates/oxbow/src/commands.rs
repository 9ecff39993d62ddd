//! Shell-fragment generation for the Pixi and Micromamba backends.
//!
//! Every function emits a list of single-line commands; the executor
//! interleaves its error checks between them, so multi-line shell constructs
//! are off limits here.

use std::path::Path;

use itertools::Itertools;
use minijinja::Environment as TemplateEnvironment;
use rattler_conda_types::Platform;
use serde::{Deserialize, Serialize};

use crate::deps::{Dependencies, PackageKind, format_dependencies};
use crate::error::{OxbowError, Result};
use crate::settings::{Backend, Settings};

/// Extra commands keyed by platform; `all` is merged with the current one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformCommands {
    pub all: Vec<String>,
    pub linux: Vec<String>,
    pub mac: Vec<String>,
    pub windows: Vec<String>,
}

impl PlatformCommands {
    /// Merges the `all` entries with the ones for the current platform.
    pub fn for_current_platform(&self) -> Vec<String> {
        let platform = Platform::current();
        let current = if platform.is_windows() {
            &self.windows
        } else if platform.is_osx() {
            &self.mac
        } else {
            &self.linux
        };
        self.all.iter().chain(current.iter()).cloned().collect()
    }
}

impl From<Vec<String>> for PlatformCommands {
    fn from(all: Vec<String>) -> Self {
        PlatformCommands {
            all,
            ..Default::default()
        }
    }
}

/// How an environment is addressed in generated commands.
#[derive(Debug, Clone, Copy)]
pub enum EnvTarget<'a> {
    /// A Micromamba environment by name.
    Name(&'a str),
    /// A Micromamba environment by prefix path.
    Prefix(&'a Path),
    /// A Pixi workspace by manifest file.
    Manifest(&'a Path),
}

impl std::fmt::Display for EnvTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvTarget::Name(name) => write!(f, "{name}"),
            EnvTarget::Prefix(path) | EnvTarget::Manifest(path) => {
                write!(f, "{}", path.display())
            }
        }
    }
}

#[derive(Serialize)]
struct InstallScriptContext {
    is_bash: bool,
    use_pixi: bool,
    root: String,
    platform: String,
    proxy_url: Option<String>,
    proxy_user: Option<String>,
    proxy_pass: Option<String>,
    proxy_args: String,
}

impl InstallScriptContext {
    fn render(&self) -> Vec<String> {
        let env = TemplateEnvironment::new();
        let template = env
            .template_from_str(include_str!("install_script.j2"))
            .unwrap();
        let rendered = template.render(self).unwrap().to_string();
        rendered
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }
}

/// Commands that download and unpack the backend, or nothing when its binary
/// is already on disk.
pub fn install_backend(settings: &Settings) -> Vec<String> {
    if settings.binary_path().exists() {
        return Vec::new();
    }

    let is_bash = !Platform::current().is_windows();
    let (proxy_user, proxy_pass) = match settings.proxy_credentials() {
        Some((user, pass)) => (Some(user), Some(pass)),
        None => (None, None),
    };
    let proxy_args = match (settings.proxy_url(), &proxy_user) {
        (Some(url), Some(_)) => format!("-Proxy {url} -ProxyCredential $proxyCredentials "),
        (Some(url), None) => format!("-Proxy {url} "),
        (None, _) => String::new(),
    };

    let context = InstallScriptContext {
        is_bash,
        use_pixi: settings.backend() == Backend::Pixi,
        root: settings.root().display().to_string(),
        platform: Platform::current().to_string(),
        proxy_url: settings.proxy_url().map(str::to_string),
        proxy_user,
        proxy_pass,
        proxy_args,
    };
    context.render()
}

/// Commands that make the backend callable in the script: the Micromamba
/// shell hook plus `MAMBA_ROOT_PREFIX`. Pixi needs no hook of its own.
pub fn shell_hook(settings: &Settings) -> Vec<String> {
    if settings.backend() == Backend::Pixi {
        return Vec::new();
    }
    let root = settings.root().display();
    let binary = settings.binary_path();
    if Platform::current().is_windows() {
        vec![
            format!("$Env:MAMBA_ROOT_PREFIX=\"{root}\""),
            format!(
                "& \"{}\" shell hook -s powershell | Out-String | Invoke-Expression",
                binary.display()
            ),
        ]
    } else {
        vec![
            format!("export MAMBA_ROOT_PREFIX=\"{root}\""),
            format!("eval \"$(\"{}\" shell hook -s posix)\"", binary.display()),
        ]
    }
}

/// Install-if-missing plus the shell hook.
pub fn activate_backend(settings: &Settings) -> Vec<String> {
    let mut commands = install_backend(settings);
    commands.extend(shell_hook(settings));
    commands
}

/// Commands that activate the given environment, with the backend activated
/// first and the caller's extra activation commands appended.
pub fn activate_environment(
    settings: &Settings,
    target: EnvTarget<'_>,
    extra: &PlatformCommands,
) -> Vec<String> {
    let mut commands = activate_backend(settings);
    match (settings.backend(), target) {
        (Backend::Pixi, EnvTarget::Manifest(manifest)) => {
            let binary = settings.binary_path();
            if Platform::current().is_windows() {
                commands.push(format!(
                    "& \"{}\" shell-hook --manifest-path \"{}\" | Out-String | Invoke-Expression",
                    binary.display(),
                    manifest.display()
                ));
            } else {
                commands.push(format!(
                    "eval \"$(\"{}\" shell-hook --manifest-path \"{}\")\"",
                    binary.display(),
                    manifest.display()
                ));
            }
        }
        (_, target) => {
            commands.push(format!("micromamba activate {target}"));
        }
    }
    commands.extend(extra.for_current_platform());
    commands
}

/// Environment variable preamble carrying the proxy configuration into the
/// tools run by the script.
pub fn proxy_env_commands(settings: &Settings) -> Vec<String> {
    let windows = Platform::current().is_windows();
    settings
        .proxies()
        .iter()
        .map(|(scheme, url)| {
            let variable = format!("{}_PROXY", scheme.to_uppercase());
            if windows {
                format!("$Env:{variable}=\"{url}\"")
            } else {
                format!("export {variable}=\"{url}\"")
            }
        })
        .collect()
}

fn quoted(specs: &[String]) -> String {
    specs.iter().map(|spec| format!("\"{spec}\"")).join(" ")
}

/// Commands installing the dependency set into the target environment.
///
/// Entries are decomposed into four groups (conda/pip × with/without
/// transitive dependencies); each group becomes one install command preceded
/// by a progress echo. Fails when a pip entry carries conda channel syntax.
pub fn install_dependencies(
    settings: &Settings,
    target: EnvTarget<'_>,
    deps: &Dependencies,
) -> Result<Vec<String>> {
    let conda = format_dependencies(PackageKind::Conda, deps, true)?;
    let pip = format_dependencies(PackageKind::Pypi, deps, true)?;

    if let Some(spec) = pip.iter().find(|spec| spec.contains("::")) {
        return Err(OxbowError::PipChannelSpec(spec.to_string()));
    }

    let mut commands = proxy_env_commands(settings);
    if conda.is_empty() && pip.is_empty() {
        return Ok(commands);
    }

    let proxy_args = settings
        .proxy_url()
        .map(|url| format!("--proxy {url} "))
        .unwrap_or_default();

    match settings.backend() {
        Backend::Micromamba => {
            commands.push(format!("echo \"Activating environment {target}...\""));
            commands.push(format!("micromamba activate {target}"));
            if !conda.with_deps.is_empty() {
                commands.push("echo \"Installing conda dependencies...\"".to_string());
                commands.push(format!("micromamba install {} -y", quoted(&conda.with_deps)));
            }
            if !conda.no_deps.is_empty() {
                commands.push(
                    "echo \"Installing conda dependencies without their dependencies...\""
                        .to_string(),
                );
                commands.push(format!(
                    "micromamba install --no-deps {} -y",
                    quoted(&conda.no_deps)
                ));
            }
            if !pip.with_deps.is_empty() {
                commands.push("echo \"Installing pip dependencies...\"".to_string());
                commands.push(format!("pip install {proxy_args}{}", quoted(&pip.with_deps)));
            }
            if !pip.no_deps.is_empty() {
                commands.push(
                    "echo \"Installing pip dependencies without their dependencies...\""
                        .to_string(),
                );
                commands.push(format!(
                    "pip install {proxy_args}--no-dependencies {}",
                    quoted(&pip.no_deps)
                ));
            }
        }
        Backend::Pixi => {
            let binary = settings.binary_path();
            // pixi add has no --no-deps flag; both conda groups resolve
            // transitively.
            let conda_specs: Vec<String> = conda.iter().cloned().collect();
            if !conda_specs.is_empty() {
                commands.push("echo \"Installing conda dependencies...\"".to_string());
                commands.push(format!(
                    "\"{}\" add --no-progress --manifest-path \"{target}\" {}",
                    binary.display(),
                    quoted(&conda_specs)
                ));
            }
            let pip_specs: Vec<String> = pip.iter().cloned().collect();
            if !pip_specs.is_empty() {
                commands.push("echo \"Installing pip dependencies...\"".to_string());
                commands.push(format!(
                    "\"{}\" add --no-progress --pypi --manifest-path \"{target}\" {}",
                    binary.display(),
                    quoted(&pip_specs)
                ));
            }
        }
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use crate::deps::{DetailedRequirement, Requirement};
    use crate::settings::ProxyMap;

    use super::*;

    fn micromamba_settings(dir: &Path) -> Settings {
        Settings::new(dir, Backend::Micromamba)
    }

    fn pixi_settings(dir: &Path) -> Settings {
        Settings::new(dir, Backend::Pixi)
    }

    #[test]
    fn platform_commands_merge_all_with_the_current_platform() {
        let commands = PlatformCommands {
            all: vec!["echo shared".to_string()],
            linux: vec!["echo linux".to_string()],
            mac: vec!["echo mac".to_string()],
            windows: vec!["echo windows".to_string()],
        };
        let merged = commands.for_current_platform();
        assert_eq!(merged[0], "echo shared");
        assert_eq!(merged.len(), 2);
    }

    #[test]
    #[cfg(unix)]
    fn install_backend_downloads_micromamba_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = micromamba_settings(dir.path());
        let commands = install_backend(&settings);
        assert!(commands.iter().any(|c| c.contains("Installing micromamba")));
        assert!(
            commands
                .iter()
                .any(|c| c.contains("micro.mamba.pm") && c.contains("tar -xvj bin/micromamba"))
        );
    }

    #[test]
    #[cfg(unix)]
    fn install_backend_is_empty_once_the_binary_exists() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs_err::create_dir_all(&bin).unwrap();
        fs_err::write(bin.join("micromamba"), b"").unwrap();
        let settings = micromamba_settings(dir.path());
        assert!(install_backend(&settings).is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn install_backend_injects_the_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = pixi_settings(dir.path());
        settings
            .set_proxies(ProxyMap::from_iter([(
                "https".to_string(),
                "http://proxy:3128".to_string(),
            )]))
            .unwrap();
        let commands = install_backend(&settings);
        assert!(
            commands
                .iter()
                .any(|c| c.contains("--proxy \"http://proxy:3128\"") && c.contains("pixi.sh"))
        );
    }

    #[test]
    #[cfg(unix)]
    fn micromamba_activation_hooks_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let settings = micromamba_settings(dir.path());
        let commands = activate_environment(
            &settings,
            EnvTarget::Name("cellpose"),
            &PlatformCommands::default(),
        );
        assert!(
            commands
                .iter()
                .any(|c| c.starts_with("export MAMBA_ROOT_PREFIX="))
        );
        assert!(commands.iter().any(|c| c.contains("shell hook -s posix")));
        assert_eq!(commands.last().unwrap(), "micromamba activate cellpose");
    }

    #[test]
    #[cfg(unix)]
    fn pixi_activation_uses_the_manifest_shell_hook() {
        let dir = tempfile::tempdir().unwrap();
        let settings = pixi_settings(dir.path());
        let manifest = settings.environment_path("cellpose");
        let commands = activate_environment(
            &settings,
            EnvTarget::Manifest(&manifest),
            &PlatformCommands::default(),
        );
        let last = commands.last().unwrap();
        assert!(last.contains("shell-hook --manifest-path"));
        assert!(last.contains("pixi.toml"));
    }

    #[test]
    #[cfg(unix)]
    fn extra_activation_commands_come_last() {
        let dir = tempfile::tempdir().unwrap();
        let settings = micromamba_settings(dir.path());
        let extra = PlatformCommands::from(vec!["echo ready".to_string()]);
        let commands = activate_environment(&settings, EnvTarget::Name("cellpose"), &extra);
        assert_eq!(commands.last().unwrap(), "echo ready");
    }

    #[test]
    #[cfg(unix)]
    fn install_dependencies_groups_and_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = micromamba_settings(dir.path());
        let deps = Dependencies {
            conda: vec![
                "numpy==1.26.4".into(),
                Requirement::Detailed(DetailedRequirement {
                    name: "cellpose".to_string(),
                    platforms: vec![],
                    optional: false,
                    dependencies: false,
                }),
            ],
            pip: vec!["requests".into()],
            ..Default::default()
        };
        let commands =
            install_dependencies(&settings, EnvTarget::Name("cellpose"), &deps).unwrap();
        assert!(
            commands
                .iter()
                .any(|c| c == "micromamba install \"numpy==1.26.4\" -y")
        );
        assert!(
            commands
                .iter()
                .any(|c| c == "micromamba install --no-deps \"cellpose\" -y")
        );
        assert!(commands.iter().any(|c| c == "pip install \"requests\""));
    }

    #[test]
    fn pip_channel_syntax_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let settings = micromamba_settings(dir.path());
        let deps = Dependencies {
            pip: vec!["conda-forge::requests".into()],
            ..Default::default()
        };
        let err = install_dependencies(&settings, EnvTarget::Name("e"), &deps).unwrap_err();
        assert!(matches!(err, OxbowError::PipChannelSpec(_)));
    }

    #[test]
    #[cfg(unix)]
    fn pip_commands_carry_the_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = micromamba_settings(dir.path());
        settings
            .set_proxies(ProxyMap::from_iter([(
                "http".to_string(),
                "http://proxy:3128".to_string(),
            )]))
            .unwrap();
        let deps = Dependencies {
            pip: vec!["requests".into()],
            ..Default::default()
        };
        let commands = install_dependencies(&settings, EnvTarget::Name("e"), &deps).unwrap();
        assert!(commands.contains(&"export HTTP_PROXY=\"http://proxy:3128\"".to_string()));
        assert!(
            commands
                .iter()
                .any(|c| c.contains("pip install --proxy http://proxy:3128 "))
        );
    }

    #[test]
    #[cfg(unix)]
    fn pixi_installs_via_add_with_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let settings = pixi_settings(dir.path());
        let manifest = settings.environment_path("e");
        let deps = Dependencies {
            conda: vec!["numpy".into()],
            pip: vec!["requests".into()],
            ..Default::default()
        };
        let commands =
            install_dependencies(&settings, EnvTarget::Manifest(&manifest), &deps).unwrap();
        assert!(
            commands
                .iter()
                .any(|c| c.contains("add --no-progress --manifest-path") && c.contains("\"numpy\""))
        );
        assert!(
            commands
                .iter()
                .any(|c| c.contains("--pypi") && c.contains("\"requests\""))
        );
    }

    #[test]
    fn empty_dependency_set_emits_no_install_commands() {
        let dir = tempfile::tempdir().unwrap();
        let settings = micromamba_settings(dir.path());
        let commands =
            install_dependencies(&settings, EnvTarget::Name("e"), &Dependencies::default())
                .unwrap();
        assert!(commands.is_empty());
    }
}
