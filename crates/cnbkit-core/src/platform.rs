//! Files exchanged with the CNB lifecycle: `buildpack.toml`, the detect
//! plan, layer descriptors, `launch.toml`, `build.toml` and the buildpack plan.

use crate::detect::BuildPlan;
use cnbkit_error::BuildError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("encoding {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
}

impl From<PlatformError> for BuildError {
    fn from(e: PlatformError) -> Self {
        BuildError::internal(e.to_string()).with_source(e)
    }
}

/// Identity of the running buildpack, from the `[buildpack]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackInfo {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct BuildpackDescriptor {
    buildpack: BuildpackInfo,
}

pub fn read_buildpack_info(buildpack_root: &Path) -> Result<BuildpackInfo, PlatformError> {
    let desc: BuildpackDescriptor = read_toml(&buildpack_root.join("buildpack.toml"))?;
    Ok(desc.buildpack)
}

#[derive(Debug, Serialize)]
struct PlanFile<'a> {
    #[serde(flatten)]
    first: &'a BuildPlan,
    #[serde(rename = "or", skip_serializing_if = "<[BuildPlan]>::is_empty")]
    alternatives: &'a [BuildPlan],
}

/// Write the detect plan: the first plan at top level, the rest as `[[or]]`.
pub fn write_detect_plan(path: &Path, plans: &[BuildPlan]) -> Result<(), PlatformError> {
    let Some((first, rest)) = plans.split_first() else {
        return Ok(());
    };
    write_toml(
        path,
        &PlanFile {
            first,
            alternatives: rest,
        },
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerTypes {
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub launch: bool,
}

/// `<layers>/<name>.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    #[serde(default)]
    pub types: LayerTypes,
    #[serde(default)]
    pub metadata: toml::Table,
}

pub fn layer_descriptor_path(layers_dir: &Path, name: &str) -> PathBuf {
    layers_dir.join(format!("{name}.toml"))
}

/// Descriptor left by a previous build, if any.
pub fn read_layer_descriptor(
    layers_dir: &Path,
    name: &str,
) -> Result<Option<LayerDescriptor>, PlatformError> {
    let path = layer_descriptor_path(layers_dir, name);
    if !path.exists() {
        return Ok(None);
    }
    read_toml(&path).map(Some)
}

pub fn write_layer_descriptor(
    layers_dir: &Path,
    name: &str,
    desc: &LayerDescriptor,
) -> Result<(), PlatformError> {
    write_toml(&layer_descriptor_path(layers_dir, name), desc)
}

/// A start command for the launch image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub direct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchToml {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<Process>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unmet {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildToml {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmet: Vec<Unmet>,
}

/// One entry of the buildpack plan handed to the build phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub name: String,
    #[serde(default)]
    pub metadata: toml::Table,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackPlan {
    #[serde(default)]
    pub entries: Vec<PlanEntry>,
}

/// Read the buildpack plan; a missing file is an empty plan.
pub fn read_buildpack_plan(path: &Path) -> Result<BuildpackPlan, PlatformError> {
    if !path.exists() {
        return Ok(BuildpackPlan::default());
    }
    read_toml(path)
}

pub fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, PlatformError> {
    let content = fs::read_to_string(path).map_err(|e| PlatformError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&content).map_err(|e| PlatformError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Serialize `value` and replace `path` atomically.
pub fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), PlatformError> {
    let content = toml::to_string(value).map_err(|e| PlatformError::Encode {
        path: path.to_path_buf(),
        source: e,
    })?;
    let write_err = |e: std::io::Error| PlatformError::Write {
        path: path.to_path_buf(),
        source: e,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(write_err)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(content.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
