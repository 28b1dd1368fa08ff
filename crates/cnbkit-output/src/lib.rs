//! The builder output record consumed by CI and support tooling.
//!
//! Every buildpack invocation reports into one JSON file, `<dir>/output`.
//! Successful invocations append a [`BuilderStat`] and merge their
//! warnings, runtime versions, metrics and metadata into whatever is already
//! there. A failing invocation replaces the file with its error through an
//! atomic temp-file rename, so concurrent detect runs never leave a torn
//! file behind; the last failure to land wins.

pub mod message;
pub mod output;
pub mod writer;

pub use message::{keep_head, keep_tail, MAX_MESSAGE_BYTES};
pub use output::{BuilderMetadata, BuilderMetrics, BuilderOutput, BuilderStat};
pub use writer::{OutputFile, OUTPUT_FILE_NAME};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unmarshalling json: {0}")]
    Unmarshal(#[source] serde_json::Error),
    #[error("marshalling json: {0}")]
    Marshal(#[source] serde_json::Error),
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
