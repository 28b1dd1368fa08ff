//! Detect outcomes and the build plan entries they declare.

use serde::{Deserialize, Serialize};

/// A capability this buildpack offers to later buildpacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provide {
    pub name: String,
}

/// A capability this buildpack needs, with optional free-form metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Require {
    pub name: String,
    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub metadata: toml::Table,
}

/// One alternative of provides/requires offered to the platform's resolver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<Provide>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<Require>,
}

impl BuildPlan {
    #[must_use]
    pub fn provide(mut self, name: impl Into<String>) -> Self {
        self.provides.push(Provide { name: name.into() });
        self
    }

    #[must_use]
    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.requires.push(Require {
            name: name.into(),
            metadata: toml::Table::new(),
        });
        self
    }

    #[must_use]
    pub fn require_with(mut self, name: impl Into<String>, metadata: toml::Table) -> Self {
        self.requires.push(Require {
            name: name.into(),
            metadata,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectResult {
    pub pass: bool,
    pub reason: String,
    pub plans: Vec<BuildPlan>,
}

impl DetectResult {
    pub fn opt_in(reason: impl AsRef<str>) -> Self {
        Self::new(true, format!("Opting in: {}", reason.as_ref()))
    }

    pub fn opt_in_always() -> Self {
        Self::opt_in("always enabled")
    }

    pub fn opt_in_file_found(file: &str) -> Self {
        Self::opt_in(format!("found {file}"))
    }

    /// Opt in because `name` is set; `value` is echoed into the reason.
    pub fn opt_in_env_set(name: &str, value: &str) -> Self {
        Self::opt_in(format!("{name} set to {value:?}"))
    }

    pub fn opt_out(reason: impl AsRef<str>) -> Self {
        Self::new(false, format!("Opting out: {}", reason.as_ref()))
    }

    pub fn opt_out_file_not_found(file: &str) -> Self {
        Self::opt_out(format!("{file} not found"))
    }

    pub fn opt_out_env_not_set(name: &str) -> Self {
        Self::opt_out(format!("{name} not set"))
    }

    #[must_use]
    pub fn with_plans(mut self, plans: impl IntoIterator<Item = BuildPlan>) -> Self {
        self.plans = plans.into_iter().collect();
        self
    }

    fn new(pass: bool, reason: String) -> Self {
        Self {
            pass,
            reason,
            plans: Vec::new(),
        }
    }
}
