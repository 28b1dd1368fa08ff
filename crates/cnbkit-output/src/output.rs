use crate::OutputError;
use cnbkit_error::{BuildError, Status};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Accumulated outcome of every buildpack invocation in one build.
///
/// Field names are load-bearing: downstream tooling reads them, so new
/// fields may be added but existing ones never renamed. Unknown fields are
/// ignored on read and `null` lists read as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuilderOutput {
    #[serde(default)]
    pub error: BuildError,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stats: Vec<BuilderStat>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub warnings: Vec<String>,
    #[serde(rename = "customImage", default)]
    pub custom_image: bool,
    #[serde(rename = "rtVersions", default, deserialize_with = "null_as_default")]
    pub installed_runtime_versions: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metrics: BuilderMetrics,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: BuilderMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderStat {
    #[serde(rename = "buildpackId")]
    pub buildpack_id: String,
    #[serde(rename = "buildpackVersion")]
    pub buildpack_version: String,
    #[serde(rename = "totalDurationMs")]
    pub duration_ms: i64,
    #[serde(rename = "userDurationMs")]
    pub user_duration_ms: i64,
}

/// Numeric build metrics keyed by metric ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuilderMetrics {
    #[serde(
        rename = "c",
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub counters: BTreeMap<String, i64>,
    #[serde(
        rename = "f",
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub floats: BTreeMap<String, f64>,
}

/// Free-form string facts about the build (framework name, adapter, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderMetadata {
    #[serde(
        rename = "m",
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub values: BTreeMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl BuilderOutput {
    pub fn from_json(bytes: &[u8]) -> Result<Self, OutputError> {
        serde_json::from_slice(bytes).map_err(OutputError::Unmarshal)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, OutputError> {
        serde_json::to_vec(self).map_err(OutputError::Marshal)
    }

    /// An output holding only `error`, as written by a failing invocation.
    pub fn from_error(error: BuildError) -> Self {
        Self {
            error,
            ..Self::default()
        }
    }

    /// `true` when the recorded error blames the platform.
    pub fn is_system_error(&self) -> bool {
        self.error.error_type == Status::Internal
    }

    /// Fold a successful invocation's record into this one.
    ///
    /// Lists are appended, counters summed, float metrics and metadata
    /// overwritten by key. The recorded error is left alone.
    pub fn merge(&mut self, other: BuilderOutput) {
        self.stats.extend(other.stats);
        self.warnings.extend(other.warnings);
        self.installed_runtime_versions
            .extend(other.installed_runtime_versions);
        self.custom_image |= other.custom_image;
        self.metrics.merge(other.metrics);
        self.metadata.values.extend(other.metadata.values);
    }
}

impl BuilderMetrics {
    pub fn increment(&mut self, id: &str, by: i64) {
        *self.counters.entry(id.to_owned()).or_insert(0) += by;
    }

    pub fn set_float(&mut self, id: &str, value: f64) {
        self.floats.insert(id.to_owned(), value);
    }

    pub fn counter(&self, id: &str) -> i64 {
        self.counters.get(id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.floats.is_empty()
    }

    pub fn merge(&mut self, other: BuilderMetrics) {
        for (id, n) in other.counters {
            self.increment(&id, n);
        }
        self.floats.extend(other.floats);
    }
}

impl BuilderMetadata {
    pub fn set(&mut self, id: &str, value: impl Into<String>) {
        self.values.insert(id.to_owned(), value.into());
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.values.get(id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_full_document() {
        let json = br#"{
            "error": {
                "buildpackId": "bad-buildpack",
                "buildpackVersion": "vbad",
                "errorType": "FAILED_PRECONDITION",
                "canonicalCode": "FAILED_PRECONDITION",
                "errorId": "abc123",
                "errorMessage": "error-message"
            },
            "stats": [
                {"buildpackId": "bp1", "buildpackVersion": "v1", "totalDurationMs": 100, "userDurationMs": 40},
                {"buildpackId": "bp2", "buildpackVersion": "v2", "totalDurationMs": 200, "userDurationMs": 0}
            ],
            "warnings": ["Some warning"],
            "customImage": true,
            "rtVersions": ["nodejs 20.1.0"],
            "metrics": {"c": {"1": 3}, "f": {"2": 1.5}},
            "metadata": {"m": {"3": "nextjs"}},
            "somethingNew": {"ignored": true}
        }"#;
        let out = BuilderOutput::from_json(json).unwrap();
        assert_eq!(out.error.status, Status::FailedPrecondition);
        assert_eq!(out.stats.len(), 2);
        assert_eq!(out.stats[0].user_duration_ms, 40);
        assert_eq!(out.warnings, vec!["Some warning"]);
        assert!(out.custom_image);
        assert_eq!(out.installed_runtime_versions, vec!["nodejs 20.1.0"]);
        assert_eq!(out.metrics.counter("1"), 3);
        assert_eq!(out.metrics.floats.get("2"), Some(&1.5));
        assert_eq!(out.metadata.get("3"), Some("nextjs"));
        assert!(!out.is_system_error());
    }

    #[test]
    fn null_lists_decode_as_empty() {
        let json = br#"{"error": {}, "stats": null, "warnings": null, "rtVersions": null, "metrics": null}"#;
        let out = BuilderOutput::from_json(json).unwrap();
        assert!(out.stats.is_empty());
        assert!(out.warnings.is_empty());
        assert!(out.metrics.is_empty());
    }

    #[test]
    fn bad_json_is_an_unmarshal_error() {
        let err = BuilderOutput::from_json(b"{not json").unwrap_err();
        assert!(err.to_string().starts_with("unmarshalling json"));
    }

    #[test]
    fn unknown_status_name_is_rejected() {
        let json = br#"{"error": {"errorType": "SOMETIMES", "canonicalCode": "SOMETIMES"}}"#;
        assert!(BuilderOutput::from_json(json).is_err());
    }

    #[test]
    fn system_error_is_internal_type() {
        let out = BuilderOutput::from_error(BuildError::internal("disk full"));
        assert!(out.is_system_error());
        let out = BuilderOutput::from_error(BuildError::user("bad Procfile"));
        assert!(!out.is_system_error());
    }

    #[test]
    fn empty_metric_maps_are_omitted() {
        let json = String::from_utf8(BuilderOutput::default().to_json().unwrap()).unwrap();
        assert!(json.contains(r#""metrics":{}"#));
        assert!(json.contains(r#""metadata":{}"#));
        assert!(json.contains(r#""customImage":false"#));
    }

    #[test]
    fn merge_appends_and_sums() {
        let mut base = BuilderOutput {
            stats: vec![BuilderStat {
                buildpack_id: "a".to_owned(),
                ..BuilderStat::default()
            }],
            warnings: vec!["w1".to_owned()],
            ..BuilderOutput::default()
        };
        base.metrics.increment("1", 2);
        base.metadata.set("3", "old");

        let mut update = BuilderOutput {
            stats: vec![BuilderStat {
                buildpack_id: "b".to_owned(),
                ..BuilderStat::default()
            }],
            warnings: vec!["w2".to_owned()],
            installed_runtime_versions: vec!["go 1.22".to_owned()],
            custom_image: true,
            ..BuilderOutput::default()
        };
        update.metrics.increment("1", 5);
        update.metrics.set_float("2", 0.25);
        update.metadata.set("3", "new");

        base.merge(update);
        let ids: Vec<_> = base.stats.iter().map(|s| s.buildpack_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(base.warnings, ["w1", "w2"]);
        assert_eq!(base.installed_runtime_versions, ["go 1.22"]);
        assert!(base.custom_image);
        assert_eq!(base.metrics.counter("1"), 7);
        assert_eq!(base.metrics.floats["2"], 0.25);
        assert_eq!(base.metadata.get("3"), Some("new"));
    }
}
