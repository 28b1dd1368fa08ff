use crate::context::Context;
use crate::fsutil;
use crate::platform::{read_layer_descriptor, write_layer_descriptor, LayerDescriptor, LayerTypes};
use cnbkit_error::BuildError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const TEMP_LAYER: &str = "cnbkit-tmp";

/// Names whose `<name>.toml` would clash with a platform file in the layers root.
const RESERVED_LAYER_NAMES: [&str; 3] = ["build", "launch", "store"];

/// A named directory under the layers root plus the flags and metadata the
/// platform reads back from `<layers>/<name>.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub name: String,
    pub path: PathBuf,
    pub build: bool,
    pub cache: bool,
    pub launch: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Layer {
    /// Metadata value for `key`, or `""` when absent.
    pub fn metadata_value(&self, key: &str) -> &str {
        self.metadata.get(key).map_or("", String::as_str)
    }

    fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor {
            types: LayerTypes {
                build: self.build,
                cache: self.cache,
                launch: self.launch,
            },
            metadata: self
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), toml::Value::String(v.clone())))
                .collect(),
        }
    }
}

/// Flags applied when a layer is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOption {
    /// Visible to later buildpacks during build.
    Build,
    /// Restored on the next build.
    Cache,
    /// Included in the launch image.
    Launch,
    /// Launch only when dev mode is on. A malformed dev mode flag only warns.
    LaunchIfDevMode,
    /// Launch unless `X_GOOGLE_SKIP_RUNTIME_LAUNCH` is true. A malformed flag is an error.
    LaunchUnlessSkipRuntimeLaunch,
}

impl Context {
    /// Get or create the layer `name`, with its directory in place.
    ///
    /// Metadata comes from this build if the layer was already requested,
    /// otherwise from the descriptor a previous build left behind, so a
    /// caller can compare it before reinstalling anything.
    pub fn layer(&mut self, name: &str, opts: &[LayerOption]) -> Result<Layer, BuildError> {
        validate_layer_name(name)?;
        let layers_dir = self.layers_dir()?.to_path_buf();
        let path = layers_dir.join(name);
        fsutil::mkdir_all(&path)?;

        let metadata = match self.layers.get(name) {
            Some(existing) => existing.metadata.clone(),
            None => self.load_metadata(&layers_dir, name)?,
        };
        let mut layer = Layer {
            name: name.to_owned(),
            path,
            build: false,
            cache: false,
            launch: false,
            metadata,
        };
        for opt in opts {
            self.apply_layer_option(&mut layer, *opt)?;
        }

        self.layers.insert(name.to_owned(), layer.clone());
        Ok(layer)
    }

    fn apply_layer_option(&mut self, layer: &mut Layer, opt: LayerOption) -> Result<(), BuildError> {
        match opt {
            LayerOption::Build => layer.build = true,
            LayerOption::Cache => layer.cache = true,
            LayerOption::Launch => layer.launch = true,
            LayerOption::LaunchIfDevMode => match self.config().dev_mode() {
                Ok(dev) => layer.launch |= dev,
                Err(e) => self.warn(format!("Dev mode not enabled: {}", e.message)),
            },
            LayerOption::LaunchUnlessSkipRuntimeLaunch => {
                if !self.config().skip_runtime_launch()? {
                    layer.launch = true;
                }
            }
        }
        Ok(())
    }

    fn load_metadata(
        &mut self,
        layers_dir: &Path,
        name: &str,
    ) -> Result<BTreeMap<String, String>, BuildError> {
        let Some(desc) = read_layer_descriptor(layers_dir, name)? else {
            return Ok(BTreeMap::new());
        };
        let mut metadata = BTreeMap::new();
        for (key, value) in desc.metadata {
            match value {
                toml::Value::String(s) => {
                    metadata.insert(key, s);
                }
                other => self.warn(format!(
                    "Ignoring non-string metadata {key} = {other} in layer {name}"
                )),
            }
        }
        Ok(metadata)
    }

    /// Remove everything in the layer and recreate its empty directory.
    pub fn clear_layer(&self, layer: &Layer) -> Result<(), BuildError> {
        fsutil::remove_all(&layer.path)?;
        fsutil::mkdir_all(&layer.path)
    }

    /// Set a metadata entry that will be written to the layer descriptor.
    pub fn set_metadata(&mut self, layer: &mut Layer, key: &str, value: impl Into<String>) {
        let value = value.into();
        layer.metadata.insert(key.to_owned(), value.clone());
        if let Some(registered) = self.layers.get_mut(&layer.name) {
            registered.metadata.insert(key.to_owned(), value);
        }
    }

    /// Metadata value for `key`, or `""` when absent.
    pub fn get_metadata<'a>(&self, layer: &'a Layer, key: &str) -> &'a str {
        layer.metadata_value(key)
    }

    /// Layers requested so far, by name.
    pub fn contributed_layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    /// Create `<layers>/cnbkit-tmp/<name>` and return its path.
    pub fn temp_dir(&mut self, name: &str) -> Result<PathBuf, BuildError> {
        let tmp = self.layer(TEMP_LAYER, &[])?;
        let dir = tmp.path.join(name);
        fsutil::mkdir_all(&dir)?;
        Ok(dir)
    }

    pub(crate) fn write_layer_descriptors(&self) -> Result<(), BuildError> {
        let layers_dir = self.layers_dir()?;
        for layer in self.layers.values() {
            write_layer_descriptor(layers_dir, &layer.name, &layer.descriptor())?;
        }
        Ok(())
    }
}

fn validate_layer_name(name: &str) -> Result<(), BuildError> {
    let problem = if name.is_empty() {
        "name is empty"
    } else if name == "." || name == ".." || name.contains(['/', '\\']) {
        "name must be a single path component"
    } else if RESERVED_LAYER_NAMES.contains(&name) {
        "name is reserved for a platform file"
    } else {
        return Ok(());
    };
    Err(BuildError::internal(format!(
        "invalid layer name {name:?}: {problem}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log::BuildLog;
    use cnbkit_error::Status;
    use std::fs;

    fn build_ctx(layers: &Path, vars: &[(&str, &str)]) -> Context {
        Context::builder()
            .layers_dir(layers)
            .config(Config::from_vars(vars.iter().copied()).unwrap())
            .log(BuildLog::capture())
            .build()
    }

    #[test]
    fn layer_directory_exists_after_creation() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = build_ctx(dir.path(), &[]);
        let layer = ctx.layer("node", &[LayerOption::Build, LayerOption::Cache]).unwrap();
        assert!(layer.path.is_dir());
        assert_eq!(layer.path, dir.path().join("node"));
        assert!(layer.build && layer.cache && !layer.launch);
    }

    #[test]
    fn bad_layer_names_are_internal_errors() {
        let dir = tempfile::tempdir().unwrap();
        let layers = dir.path().join("layers");
        let mut ctx = build_ctx(&layers, &[]);
        for name in ["", ".", "..", "../escape", "a/b", "launch", "build", "store"] {
            let err = ctx.layer(name, &[]).unwrap_err();
            assert!(err.is_internal(), "{name:?}");
            assert!(err.message.starts_with("invalid layer name"), "{}", err.message);
        }
        assert!(!dir.path().join("escape").exists());
        assert!(!layers.exists());
        assert_eq!(ctx.contributed_layers().count(), 0);
    }

    #[test]
    fn clear_layer_leaves_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = build_ctx(dir.path(), &[]);
        let layer = ctx.layer("deps", &[]).unwrap();
        fs::create_dir_all(layer.path.join("lib/nested")).unwrap();
        fs::write(layer.path.join("lib/nested/file"), "x").unwrap();

        ctx.clear_layer(&layer).unwrap();
        assert!(layer.path.is_dir());
        assert_eq!(fs::read_dir(&layer.path).unwrap().count(), 0);
    }

    #[test]
    fn layers_need_a_build_context() {
        let mut ctx = Context::builder().log(BuildLog::capture()).build();
        let err = ctx.layer("x", &[]).unwrap_err();
        assert_eq!(err.status, Status::Internal);
    }

    #[test]
    fn dev_mode_controls_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = build_ctx(dir.path(), &[("GOOGLE_DEVMODE", "true")]);
        assert!(ctx.layer("a", &[LayerOption::LaunchIfDevMode]).unwrap().launch);

        let mut ctx = build_ctx(dir.path(), &[]);
        assert!(!ctx.layer("b", &[LayerOption::LaunchIfDevMode]).unwrap().launch);
    }

    #[test]
    fn malformed_dev_mode_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = build_ctx(dir.path(), &[("GOOGLE_DEVMODE", "sometimes")]);
        let layer = ctx.layer("a", &[LayerOption::LaunchIfDevMode]).unwrap();
        assert!(!layer.launch);
        assert_eq!(ctx.warnings().len(), 1);
        assert!(ctx.warnings()[0].starts_with("Dev mode not enabled"));
    }

    #[test]
    fn skip_runtime_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = build_ctx(dir.path(), &[]);
        let opts = [LayerOption::LaunchUnlessSkipRuntimeLaunch];
        assert!(ctx.layer("a", &opts).unwrap().launch);

        let mut ctx = build_ctx(dir.path(), &[("X_GOOGLE_SKIP_RUNTIME_LAUNCH", "true")]);
        assert!(!ctx.layer("a", &opts).unwrap().launch);

        let mut ctx = build_ctx(dir.path(), &[("X_GOOGLE_SKIP_RUNTIME_LAUNCH", "nah")]);
        assert!(ctx.layer("a", &opts).unwrap_err().is_internal());
    }

    #[test]
    fn metadata_defaults_to_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = build_ctx(dir.path(), &[]);
        let mut layer = ctx.layer("rt", &[]).unwrap();
        assert_eq!(ctx.get_metadata(&layer, "version"), "");
        ctx.set_metadata(&mut layer, "version", "1.22.0");
        assert_eq!(ctx.get_metadata(&layer, "version"), "1.22.0");
        assert_eq!(ctx.layer("rt", &[]).unwrap().metadata_value("version"), "1.22.0");
    }

    #[test]
    fn metadata_survives_into_next_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = build_ctx(dir.path(), &[]);
        let mut layer = first.layer("rt", &[LayerOption::Cache]).unwrap();
        first.set_metadata(&mut layer, "version", "3.12.1");
        first.write_layer_descriptors().unwrap();

        let desc = read_layer_descriptor(dir.path(), "rt").unwrap().unwrap();
        assert!(desc.types.cache);
        assert!(!desc.types.launch);

        let mut second = build_ctx(dir.path(), &[]);
        let layer = second.layer("rt", &[LayerOption::Cache]).unwrap();
        assert_eq!(second.get_metadata(&layer, "version"), "3.12.1");
    }

    #[test]
    fn non_string_metadata_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("rt.toml"),
            "[types]\ncache = true\n\n[metadata]\nversion = \"1.0\"\nsize = 42\n",
        )
        .unwrap();
        let mut ctx = build_ctx(dir.path(), &[]);
        let layer = ctx.layer("rt", &[]).unwrap();
        assert_eq!(layer.metadata_value("version"), "1.0");
        assert!(!layer.metadata.contains_key("size"));
        assert_eq!(ctx.warnings().len(), 1);
    }

    #[test]
    fn temp_dir_lives_in_its_own_layer() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = build_ctx(dir.path(), &[]);
        let tmp = ctx.temp_dir("download").unwrap();
        assert_eq!(tmp, dir.path().join("cnbkit-tmp/download"));
        assert!(tmp.is_dir());
        assert_eq!(ctx.contributed_layers().count(), 1);
    }
}
