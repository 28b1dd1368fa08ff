use chrono::{DateTime, Utc};
use cnbkit_error::Status;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpanError {
    #[error("span name required")]
    EmptyName,
    #[error("start is after end")]
    StartAfterEnd,
}

/// A named, timed, status-tagged record of one phase or subprocess.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanInfo {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
    pub status: Status,
}

impl SpanInfo {
    pub fn new(
        name: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        attributes: BTreeMap<String, String>,
        status: Status,
    ) -> Result<Self, SpanError> {
        let name = name.into();
        if name.is_empty() {
            return Err(SpanError::EmptyName);
        }
        if start > end {
            return Err(SpanError::StartAfterEnd);
        }
        Ok(Self {
            name,
            start,
            end,
            attributes,
            status,
        })
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }

    /// Hand the span to the tracing subscriber.
    pub fn emit(&self) {
        tracing::info!(
            target: "cnbkit::span",
            name = %self.name,
            start = %self.start.to_rfc3339(),
            end = %self.end.to_rfc3339(),
            duration_ms = self.duration_ms(),
            status = %self.status,
            attributes = ?self.attributes,
            "span"
        );
    }
}

/// Span label for a subprocess: the trimmed, non-empty tokens joined by spaces.
pub fn exec_span_name<S: AsRef<str>>(cmd: &[S]) -> String {
    let joined = cmd
        .iter()
        .map(|c| c.as_ref().trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!("Exec {joined:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn rejects_empty_name() {
        let now = Utc::now();
        assert_eq!(
            SpanInfo::new("", now, now, BTreeMap::new(), Status::Ok),
            Err(SpanError::EmptyName)
        );
    }

    #[test]
    fn rejects_inverted_interval() {
        let now = Utc::now();
        let err = SpanInfo::new("x", now, now - Duration::seconds(1), BTreeMap::new(), Status::Ok)
            .unwrap_err();
        assert_eq!(err, SpanError::StartAfterEnd);
    }

    #[test]
    fn zero_length_span_is_valid() {
        let now = Utc::now();
        let span = SpanInfo::new("x", now, now, BTreeMap::new(), Status::Internal).unwrap();
        assert_eq!(span.duration_ms(), 0);
    }

    #[test]
    fn exec_names_trim_and_skip_blank_tokens() {
        assert_eq!(exec_span_name(&["echo", "Hello"]), r#"Exec "echo Hello""#);
        assert_eq!(exec_span_name(&[" npm ", "", "ci\n"]), r#"Exec "npm ci""#);
    }
}
