//! Dependency sets, platform gating and the satisfaction check.
//!
//! A dependency set holds an optional Python constraint plus ordered conda
//! and pip requirement lists. Requirements are either plain spec strings
//! (`numpy`, `numpy==1.26`, `conda-forge::numpy`) or detailed records that
//! gate installation on platform tags.

use std::str::FromStr;

use rattler_conda_types::{MatchSpec, ParseStrictness, Platform, Version, VersionSpec};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{OxbowError, Result};

/// Which package manager owns a requirement or an installed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Conda,
    Pypi,
}

impl Default for PackageKind {
    fn default() -> Self {
        // `micromamba list --json` has no kind field; everything it reports
        // is a conda package.
        PackageKind::Conda
    }
}

/// One entry of a dependency list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Requirement {
    Spec(String),
    Detailed(DetailedRequirement),
}

impl From<&str> for Requirement {
    fn from(spec: &str) -> Self {
        Requirement::Spec(spec.to_string())
    }
}

/// A requirement gated on platform tags.
///
/// `dependencies: false` requests installation without transitive
/// dependencies; `optional: true` suppresses the failure when the current
/// platform is not listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedRequirement {
    pub name: String,
    /// Empty means every platform. The legacy literal `"all"` is accepted on
    /// input and normalized to the empty list.
    #[serde(default, deserialize_with = "deserialize_platforms")]
    pub platforms: Vec<Platform>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_true")]
    pub dependencies: bool,
}

fn default_true() -> bool {
    true
}

fn deserialize_platforms<'de, D>(deserializer: D) -> std::result::Result<Vec<Platform>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Wildcard(String),
        List(Vec<Platform>),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Wildcard(s) if s == "all" => Ok(Vec::new()),
        Raw::Wildcard(s) => Err(serde::de::Error::custom(format!(
            "expected a list of platform tags or \"all\", got \"{s}\""
        ))),
        Raw::List(platforms) => Ok(platforms),
    }
}

/// A set of dependencies to materialize in an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dependencies {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conda: Vec<Requirement>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pip: Vec<Requirement>,
}

impl Dependencies {
    pub fn is_empty(&self) -> bool {
        self.python.is_none() && self.conda.is_empty() && self.pip.is_empty()
    }

    pub fn requirements(&self, kind: PackageKind) -> &[Requirement] {
        match kind {
            PackageKind::Conda => &self.conda,
            PackageKind::Pypi => &self.pip,
        }
    }
}

/// One record reported by `list --json` or `pip freeze`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub kind: PackageKind,
}

/// The spec lists of one package manager, split by whether transitive
/// dependencies should be installed.
#[derive(Debug, Default, PartialEq)]
pub struct FormattedDependencies {
    pub with_deps: Vec<String>,
    pub no_deps: Vec<String>,
}

impl FormattedDependencies {
    pub fn is_empty(&self) -> bool {
        self.with_deps.is_empty() && self.no_deps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.with_deps.iter().chain(self.no_deps.iter())
    }
}

/// Flattens one side of a dependency set into installable spec strings.
///
/// With `check_platforms` set, a detailed requirement whose platform list
/// excludes the current platform fails unless it is optional; without it,
/// every entry is kept (the satisfaction check wants the full list).
pub fn format_dependencies(
    kind: PackageKind,
    deps: &Dependencies,
    check_platforms: bool,
) -> Result<FormattedDependencies> {
    let current = Platform::current();
    let mut formatted = FormattedDependencies::default();
    for requirement in deps.requirements(kind) {
        match requirement {
            Requirement::Spec(spec) => formatted.with_deps.push(spec.clone()),
            Requirement::Detailed(detailed) => {
                let compatible =
                    detailed.platforms.is_empty() || detailed.platforms.contains(&current);
                if compatible || !check_platforms {
                    if detailed.dependencies {
                        formatted.with_deps.push(detailed.name.clone());
                    } else {
                        formatted.no_deps.push(detailed.name.clone());
                    }
                } else if !detailed.optional {
                    return Err(OxbowError::Incompatibility {
                        name: detailed.name.clone(),
                        platforms: detailed.platforms.iter().map(|p| p.to_string()).collect(),
                        current: current.to_string(),
                    });
                }
            }
        }
    }
    Ok(formatted)
}

/// Removes a conda channel prefix (`channel::package` → `package`).
/// Idempotent.
pub fn strip_channel(spec: &str) -> &str {
    spec.rsplit_once("::").map_or(spec, |(_, rest)| rest)
}

/// Splits a spec string into its name and the raw constraint text with the
/// operator characters stripped (`numpy>=1.26` → `("numpy", Some("1.26"))`).
fn split_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.find(['=', '<', '>', '!', '~']) {
        Some(index) => (
            spec[..index].trim(),
            Some(spec[index..].trim_start_matches(['=', '<', '>', '!', '~']).trim()),
        ),
        None => (spec.trim(), None),
    }
}

fn normalize_name(kind: PackageKind, name: &str) -> String {
    let lower = name.to_lowercase();
    match kind {
        PackageKind::Conda => lower,
        // PyPI treats `-` and `_` as equivalent.
        PackageKind::Pypi => lower.replace('_', "-"),
    }
}

/// True when any requirement in the list names `name` (ignoring channel
/// prefixes and version constraints).
pub fn mentions_package(requirements: &[Requirement], name: &str) -> bool {
    requirements.iter().any(|requirement| match requirement {
        Requirement::Spec(spec) => split_spec(strip_channel(spec)).0 == name,
        Requirement::Detailed(detailed) => detailed.name == name,
    })
}

/// Tests a single spec string against the installed records.
///
/// The version constraint algebra (`==`, `!=`, `>=`, `<=`, `>`, `<`, `~=`,
/// comma conjunctions) follows the conda grammar; specs or versions the
/// grammar rejects degrade to a literal prefix match on the installed
/// version string.
pub fn requirement_satisfied(
    spec: &str,
    kind: PackageKind,
    installed: &[InstalledPackage],
) -> bool {
    let spec = strip_channel(spec.trim());
    if let Ok(match_spec) = MatchSpec::from_str(spec, ParseStrictness::Lenient) {
        if let Some(name) = &match_spec.name {
            let target = normalize_name(kind, name.as_normalized());
            return installed
                .iter()
                .filter(|package| {
                    package.kind == kind && normalize_name(kind, &package.name) == target
                })
                .any(|package| constraint_matches(match_spec.version.as_ref(), &package.version, spec));
        }
    }

    let (name, version) = split_spec(spec);
    let target = normalize_name(kind, name);
    installed.iter().any(|package| {
        package.kind == kind
            && normalize_name(kind, &package.name) == target
            && version.is_none_or(|v| package.version.starts_with(v))
    })
}

fn constraint_matches(constraint: Option<&VersionSpec>, installed: &str, raw_spec: &str) -> bool {
    let Some(constraint) = constraint else {
        return true;
    };
    match Version::from_str(installed) {
        Ok(version) => constraint.matches(&version),
        Err(_) => split_spec(raw_spec)
            .1
            .is_none_or(|v| installed.starts_with(v)),
    }
}

/// Whether every requirement of the set is present in `installed`.
///
/// The reported Python version of the target is either supplied by the
/// caller or taken from the installed `python` conda record.
pub fn dependencies_satisfied(
    deps: &Dependencies,
    installed: &[InstalledPackage],
    python_version: Option<&str>,
) -> Result<bool> {
    if let Some(python) = deps.python.as_deref().filter(|p| !p.is_empty()) {
        let constraint = python.replace('=', "");
        let reported = python_version.map(str::to_string).or_else(|| {
            installed
                .iter()
                .find(|p| p.kind == PackageKind::Conda && p.name == "python")
                .map(|p| p.version.clone())
        });
        match reported {
            Some(version) if version.starts_with(&constraint) => {}
            _ => return Ok(false),
        }
    }

    let conda = format_dependencies(PackageKind::Conda, deps, false)?;
    let pip = format_dependencies(PackageKind::Pypi, deps, false)?;
    Ok(conda
        .iter()
        .all(|spec| requirement_satisfied(spec, PackageKind::Conda, installed))
        && pip
            .iter()
            .all(|spec| requirement_satisfied(spec, PackageKind::Pypi, installed)))
}

/// Parses `pip freeze --all` output lines into installed records.
pub fn parse_pip_freeze<I, S>(lines: I) -> Vec<InstalledPackage>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| {
            let line = line.as_ref().trim();
            let (name, version) = line.split_once("==")?;
            Some(InstalledPackage {
                name: name.trim().to_string(),
                version: version.trim().to_string(),
                kind: PackageKind::Pypi,
            })
        })
        .collect()
}

/// Extracts the JSON document from a merged command output stream: the
/// activation preamble may print arbitrary lines before the payload.
pub fn json_document(lines: &[String]) -> Option<String> {
    let start = lines
        .iter()
        .position(|line| matches!(line.trim_start().chars().next(), Some('[') | Some('{')))?;
    Some(lines[start..].join("\n"))
}

/// Parses a `list --json` document into installed records, tolerating the
/// extra fields the backends emit.
pub fn parse_installed_json(document: &str) -> Result<Vec<InstalledPackage>> {
    let records: Vec<Value> = serde_json::from_str(document)?;
    Ok(records
        .into_iter()
        .filter_map(|record| serde_json::from_value(record).ok())
        .collect())
}
