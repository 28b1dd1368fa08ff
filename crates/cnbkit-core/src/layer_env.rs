use crate::context::Context;
use crate::fsutil;
use crate::layers::Layer;
use cnbkit_error::{internal_error, BuildError};
use std::path::PathBuf;

/// Which phase of later buildpacks (or the launched image) sees a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvScope {
    Build,
    Launch,
    Shared,
}

impl EnvScope {
    fn dir_name(self) -> &'static str {
        match self {
            EnvScope::Build => "env.build",
            EnvScope::Launch => "env.launch",
            EnvScope::Shared => "env",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            EnvScope::Build => "build",
            EnvScope::Launch => "launch",
            EnvScope::Shared => "shared",
        }
    }
}

/// How the lifecycle combines a layer's value with what is already set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvAction {
    /// Concatenate after the existing value, using the delimiter if one is set.
    Append,
    /// Set only when nothing else sets the variable.
    Default,
    Override,
    Prepend,
    /// Separator used by `Append` and `Prepend`.
    Delimiter,
}

impl EnvAction {
    fn suffix(self) -> &'static str {
        match self {
            EnvAction::Append => "append",
            EnvAction::Default => "default",
            EnvAction::Override => "override",
            EnvAction::Prepend => "prepend",
            EnvAction::Delimiter => "delim",
        }
    }

    fn verb(self) -> &'static str {
        match self {
            EnvAction::Append => "appending",
            EnvAction::Default => "setting default",
            EnvAction::Override => "overriding",
            EnvAction::Prepend => "prepending",
            EnvAction::Delimiter => "setting delimiter for",
        }
    }
}

/// `<layer>/env[.build|.launch]/<NAME>.<action>`
pub fn env_file_path(layer: &Layer, scope: EnvScope, action: EnvAction, name: &str) -> PathBuf {
    layer
        .path
        .join(scope.dir_name())
        .join(format!("{name}.{}", action.suffix()))
}

impl Context {
    /// Write one layer environment file for the lifecycle to apply.
    pub fn layer_env(
        &self,
        layer: &Layer,
        scope: EnvScope,
        action: EnvAction,
        name: &str,
        value: &str,
    ) -> Result<(), BuildError> {
        write_env_file(layer, scope, action, name, value)?;
        tracing::debug!(
            layer = %layer.name,
            "{} {} env var {name}",
            action.verb(),
            scope.as_str()
        );
        Ok(())
    }

    /// Prepend `value` to a `:`-separated path list such as `PATH`.
    pub fn prepend_path(
        &self,
        layer: &Layer,
        scope: EnvScope,
        name: &str,
        value: &str,
    ) -> Result<(), BuildError> {
        self.layer_env(layer, scope, EnvAction::Prepend, name, value)?;
        self.layer_env(layer, scope, EnvAction::Delimiter, name, ":")
    }
}

fn write_env_file(
    layer: &Layer,
    scope: EnvScope,
    action: EnvAction,
    name: &str,
    value: &str,
) -> Result<(), BuildError> {
    if name.is_empty() || name.contains(['/', '=']) {
        return Err(internal_error!(
            "{} {} env var {name:?}: invalid variable name",
            action.verb(),
            scope.as_str()
        ));
    }
    let path = env_file_path(layer, scope, action, name);
    let wrap = |e: BuildError| {
        internal_error!("{} {} env var {name}: {}", action.verb(), scope.as_str(), e.message)
            .with_source(e)
    };
    if let Some(dir) = path.parent() {
        fsutil::mkdir_all(dir).map_err(wrap)?;
    }
    fsutil::write_file(&path, value).map_err(wrap)
}
