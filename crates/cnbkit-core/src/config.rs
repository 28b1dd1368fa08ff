use cnbkit_error::BuildError;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

pub const DEBUG_ENV: &str = "GOOGLE_DEBUG";
pub const DEVMODE_ENV: &str = "GOOGLE_DEVMODE";
pub const SKIP_RUNTIME_LAUNCH_ENV: &str = "X_GOOGLE_SKIP_RUNTIME_LAUNCH";
pub const BUILDER_OUTPUT_ENV: &str = "BUILDER_OUTPUT";
pub const EXPECTED_BUILDER_OUTPUT_ENV: &str = "EXPECTED_BUILDER_OUTPUT";
pub const ENTRYPOINT_ENV: &str = "GOOGLE_ENTRYPOINT";

/// Settings resolved once per invocation from a snapshot of the environment.
///
/// Nothing here reads the process environment after construction, so tests
/// can build contexts with different settings side by side.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub debug: bool,
    pub builder_output: Option<PathBuf>,
    pub expected_builder_output: Option<String>,
    vars: BTreeMap<String, String>,
}

impl Config {
    pub fn from_env() -> Result<Self, BuildError> {
        Self::from_os_vars(std::env::vars_os())
    }

    /// Like [`from_vars`](Self::from_vars) for raw OS strings. Names and
    /// values that are not valid UTF-8 are converted lossily.
    pub fn from_os_vars<I>(vars: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        Self::from_vars(vars.into_iter().map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                v.to_string_lossy().into_owned(),
            )
        }))
    }

    /// Resolve settings from explicit `(name, value)` pairs.
    ///
    /// Fails only when the debug toggle is set to something that is not a boolean.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut config = Self {
            vars,
            ..Self::default()
        };
        config.debug = config
            .present_and_true(DEBUG_ENV)
            .map_err(|e| BuildError::internal(format!("Failed to parse debug mode: {}", e.message)))?;
        config.builder_output = config
            .var(BUILDER_OUTPUT_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        config.expected_builder_output = config
            .var(EXPECTED_BUILDER_OUTPUT_ENV)
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        Ok(config)
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// `false` when `name` is unset, otherwise its value parsed as a boolean.
    pub fn present_and_true(&self, name: &str) -> Result<bool, BuildError> {
        match self.var(name) {
            None => Ok(false),
            Some(val) => parse_bool(val)
                .ok_or_else(|| BuildError::internal(format!("parsing {name}: invalid boolean {val:?}"))),
        }
    }

    pub fn dev_mode(&self) -> Result<bool, BuildError> {
        self.present_and_true(DEVMODE_ENV)
    }

    pub fn skip_runtime_launch(&self) -> Result<bool, BuildError> {
        self.present_and_true(SKIP_RUNTIME_LAUNCH_ENV)
    }
}

/// Accepts `1 t T TRUE true True` and `0 f F FALSE false False`.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_classic_spellings() {
        for s in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_bool(s), Some(true), "{s}");
        }
        for s in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool(s), Some(false), "{s}");
        }
        for s in ["", "yes", "tRUE", "2", " true"] {
            assert_eq!(parse_bool(s), None, "{s}");
        }
    }

    #[test]
    fn empty_config_is_quiet() {
        let config = Config::from_vars(Vec::<(String, String)>::new()).unwrap();
        assert!(!config.debug);
        assert!(config.builder_output.is_none());
        assert!(!config.dev_mode().unwrap());
        assert!(!config.skip_runtime_launch().unwrap());
    }

    #[test]
    fn reads_known_variables() {
        let config = Config::from_vars([
            (DEBUG_ENV, "true"),
            (BUILDER_OUTPUT_ENV, "/builder/output"),
            (EXPECTED_BUILDER_OUTPUT_ENV, "exit code \\d+"),
            (DEVMODE_ENV, "1"),
        ])
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.builder_output, Some(PathBuf::from("/builder/output")));
        assert_eq!(config.expected_builder_output.as_deref(), Some("exit code \\d+"));
        assert!(config.dev_mode().unwrap());
    }

    #[test]
    fn bad_debug_value_fails_construction() {
        let err = Config::from_vars([(DEBUG_ENV, "loud")]).unwrap_err();
        assert!(err.is_internal());
        assert!(err.message.contains("Failed to parse debug mode"));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_values_are_read_lossily() {
        use std::os::unix::ffi::OsStringExt;

        let config = Config::from_os_vars([
            (OsString::from("LANG_HINT"), OsString::from_vec(b"caf\xe9".to_vec())),
            (OsString::from(DEBUG_ENV), OsString::from("1")),
        ])
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.var("LANG_HINT"), Some("caf\u{fffd}"));
    }

    #[test]
    fn bad_flag_is_reported_lazily() {
        let config = Config::from_vars([(SKIP_RUNTIME_LAUNCH_ENV, "maybe")]).unwrap();
        let err = config.skip_runtime_launch().unwrap_err();
        assert!(err.message.contains(SKIP_RUNTIME_LAUNCH_ENV));
    }
}
