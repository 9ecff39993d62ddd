//! Parsing of dependency manifests into a [`Dependencies`] set.
//!
//! Supported formats: `pixi.toml`, `pyproject.toml` (PEP 621 dependencies,
//! optional-dependency groups and `[tool.pixi]` tables), conda
//! `environment.yml` files and plain `requirements.txt` lists.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use pyproject_toml::PyProjectToml;
use serde::Deserialize;
use thiserror::Error;
use toml_edit::DocumentMut;

use crate::deps::Dependencies;

#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    #[error("unsupported config file {}", .0.display())]
    Unsupported(PathBuf),

    #[error("an environment name is required to read {}", .0.display())]
    MissingEnvironmentName(PathBuf),

    #[error(
        "provide an environment name or optional dependency groups to read {}",
        .0.display()
    )]
    MissingSelection(PathBuf),

    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}", .path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml_edit::TomlError,
    },

    #[error("failed to parse {}", .path.display())]
    TomlValues {
        path: PathBuf,
        #[source]
        source: toml_edit::de::Error,
    },

    #[error("failed to parse {}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The manifest formats the parser recognizes, by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Pixi,
    Pyproject,
    CondaYaml,
    RequirementsTxt,
}

/// Selection parameters for formats that hold more than one dependency set.
#[derive(Debug, Clone, Default)]
pub struct ManifestOptions {
    /// Environment/feature name for pixi-style manifests.
    pub environment: Option<String>,
    /// Optional-dependency groups for `pyproject.toml`.
    pub optional_dependencies: Vec<String>,
}

/// Identifies the manifest format from the file name.
pub fn detect(path: &Path) -> Result<ManifestKind, ManifestError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name == "pixi.toml" {
        Ok(ManifestKind::Pixi)
    } else if name == "pyproject.toml" {
        Ok(ManifestKind::Pyproject)
    } else if name.ends_with(".yml") || name.ends_with(".yaml") {
        Ok(ManifestKind::CondaYaml)
    } else if name.ends_with(".txt") {
        Ok(ManifestKind::RequirementsTxt)
    } else {
        Err(ManifestError::Unsupported(path.to_path_buf()))
    }
}

/// Parses the manifest at `path` into a dependency set.
pub fn parse(path: &Path, options: &ManifestOptions) -> Result<Dependencies, ManifestError> {
    let kind = detect(path)?;
    let content = fs_err::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source: source.into(),
    })?;
    match kind {
        ManifestKind::Pixi => {
            if options.environment.is_none() {
                return Err(ManifestError::MissingEnvironmentName(path.to_path_buf()));
            }
            parse_pixi(path, &content, options.environment.as_deref())
        }
        ManifestKind::Pyproject => {
            if options.environment.is_none() && options.optional_dependencies.is_empty() {
                return Err(ManifestError::MissingSelection(path.to_path_buf()));
            }
            parse_pyproject(path, &content, options)
        }
        ManifestKind::CondaYaml => parse_conda_yaml(path, &content),
        ManifestKind::RequirementsTxt => Ok(parse_requirements_txt(&content)),
    }
}

/// Renders a pixi version requirement next to its package name
/// (`numpy` + `>=1.26` → `numpy>=1.26`, `numpy` + `1.26.*` → `numpy==1.26.*`).
fn joined_spec(name: &str, requirement: &str) -> String {
    let requirement = requirement.trim();
    if requirement.is_empty() || requirement == "*" {
        name.to_string()
    } else if requirement.starts_with(['=', '<', '>', '!', '~']) {
        format!("{name}{requirement}")
    } else {
        format!("{name}=={requirement}")
    }
}

fn collect_pixi_table(table: &toml_edit::Item, deps: &mut Dependencies, pypi: bool) {
    let Some(table) = table.as_table_like() else {
        return;
    };
    for (name, value) in table.iter() {
        let requirement = match value {
            toml_edit::Item::Value(toml_edit::Value::String(s)) => s.value().clone(),
            toml_edit::Item::Value(toml_edit::Value::InlineTable(t)) => t
                .get("version")
                .and_then(|v| v.as_str())
                .unwrap_or("*")
                .to_string(),
            _ => continue,
        };
        if !pypi && name == "python" {
            deps.python = Some(requirement.trim_start_matches('=').trim().to_string());
            continue;
        }
        let spec = joined_spec(name, &requirement);
        if pypi {
            deps.pip.push(spec.as_str().into());
        } else {
            deps.conda.push(spec.as_str().into());
        }
    }
}

fn parse_pixi(
    path: &Path,
    content: &str,
    environment: Option<&str>,
) -> Result<Dependencies, ManifestError> {
    let document: DocumentMut = content.parse().map_err(|source| ManifestError::Toml {
        path: path.to_path_buf(),
        source,
    })?;

    let mut deps = Dependencies::default();
    if let Some(table) = document.get("dependencies") {
        collect_pixi_table(table, &mut deps, false);
    }
    if let Some(table) = document.get("pypi-dependencies") {
        collect_pixi_table(table, &mut deps, true);
    }
    if let Some(environment) = environment {
        if let Some(feature) = document
            .get("feature")
            .and_then(|features| features.get(environment))
        {
            if let Some(table) = feature.get("dependencies") {
                collect_pixi_table(table, &mut deps, false);
            }
            if let Some(table) = feature.get("pypi-dependencies") {
                collect_pixi_table(table, &mut deps, true);
            }
        }
    }
    Ok(deps)
}

fn parse_pyproject(
    path: &Path,
    content: &str,
    options: &ManifestOptions,
) -> Result<Dependencies, ManifestError> {
    let pyproject: PyProjectToml =
        toml_edit::de::from_str(content).map_err(|source| ManifestError::TomlValues {
            path: path.to_path_buf(),
            source,
        })?;

    let mut deps = Dependencies::default();
    if let Some(project) = &pyproject.project {
        if let Some(requires_python) = &project.requires_python {
            deps.python = Some(requires_python.to_string());
        }
        for requirement in project.dependencies.iter().flatten() {
            deps.pip.push(requirement.to_string().as_str().into());
        }
        if let Some(groups) = &project.optional_dependencies {
            for group in &options.optional_dependencies {
                for requirement in groups.get(group).into_iter().flatten() {
                    deps.pip.push(requirement.to_string().as_str().into());
                }
            }
        }
    }

    // pixi embeds conda dependencies under [tool.pixi.*]; pick them up when
    // present so a pyproject-managed workspace round-trips.
    let document: DocumentMut = content.parse().map_err(|source| ManifestError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(pixi) = document.get("tool").and_then(|tool| tool.get("pixi")) {
        if let Some(table) = pixi.get("dependencies") {
            collect_pixi_table(table, &mut deps, false);
        }
        if let Some(environment) = &options.environment {
            if let Some(feature) = pixi
                .get("feature")
                .and_then(|features| features.get(environment))
            {
                if let Some(table) = feature.get("dependencies") {
                    collect_pixi_table(table, &mut deps, false);
                }
            }
        }
    }
    Ok(deps)
}

#[derive(Debug, Deserialize)]
struct CondaEnvironmentFile {
    #[serde(default)]
    dependencies: Vec<CondaEnvironmentEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CondaEnvironmentEntry {
    Spec(String),
    Pip { pip: Vec<String> },
}

fn parse_conda_yaml(path: &Path, content: &str) -> Result<Dependencies, ManifestError> {
    let file: CondaEnvironmentFile =
        serde_yaml::from_str(content).map_err(|source| ManifestError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

    let mut deps = Dependencies::default();
    for entry in file.dependencies {
        match entry {
            CondaEnvironmentEntry::Spec(spec) => {
                let spec = spec.trim().to_string();
                if let Some(rest) = spec.strip_prefix("python") {
                    if rest.is_empty() || rest.starts_with(['=', '<', '>', ' ']) {
                        let version = rest.trim().trim_start_matches('=').trim();
                        if !version.is_empty() {
                            deps.python = Some(version.to_string());
                        }
                        continue;
                    }
                }
                deps.conda.push(spec.as_str().into());
            }
            CondaEnvironmentEntry::Pip { pip } => {
                deps.pip
                    .extend(pip.into_iter().map(|spec| spec.as_str().into()));
            }
        }
    }
    Ok(deps)
}

fn parse_requirements_txt(content: &str) -> Dependencies {
    let mut deps = Dependencies::default();
    for line in content.lines() {
        let line = line.split(" #").next().unwrap_or(line).trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('-') {
            tracing::warn!("skipping unsupported requirements option: {line}");
            continue;
        }
        deps.pip.push(line.into());
    }
    deps
}
