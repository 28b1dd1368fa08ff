use crate::{keep_tail, BuilderOutput, OutputError, MAX_MESSAGE_BYTES};
use cnbkit_error::BuildError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub const OUTPUT_FILE_NAME: &str = "output";

/// The `output` file inside a builder output directory.
#[derive(Debug, Clone)]
pub struct OutputFile {
    dir: PathBuf,
}

impl OutputFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE_NAME)
    }

    /// Read the current record. A missing file reads as an empty record.
    pub fn read(&self) -> Result<BuilderOutput, OutputError> {
        let path = self.path();
        match fs::read(&path) {
            Ok(bytes) => BuilderOutput::from_json(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BuilderOutput::default()),
            Err(e) => Err(OutputError::Read {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    /// Replace the file with a record holding only `error`.
    ///
    /// Over-long messages keep their tail. The write goes through a temp
    /// file in the same directory and a rename, so a concurrent reader sees
    /// either the old file or the new one and the last writer wins.
    pub fn write_error(&self, error: &BuildError) -> Result<BuilderOutput, OutputError> {
        let mut error = error.clone();
        if error.message.len() > MAX_MESSAGE_BYTES {
            error.message = keep_tail(&error.message);
        }
        let out = BuilderOutput::from_error(error);
        let content = out.to_json()?;

        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path()).map_err(|e| OutputError::Io(e.error))?;
        debug!("wrote error output to {}", self.path().display());
        Ok(out)
    }

    /// Merge a successful invocation's record into the file.
    ///
    /// This is a plain read-merge-write with no lock; two invocations
    /// finishing at the same moment can lose one stat entry.
    pub fn append_success(&self, update: BuilderOutput) -> Result<BuilderOutput, OutputError> {
        let mut out = self.read()?;
        out.merge(update);
        let content = out.to_json()?;

        fs::create_dir_all(&self.dir)?;
        let path = self.path();
        fs::write(&path, content).map_err(|e| OutputError::Write {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!(stats = out.stats.len(), "wrote success output to {}", path.display());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuilderStat;
    use cnbkit_error::Status;

    fn stat(id: &str) -> BuilderStat {
        BuilderStat {
            buildpack_id: id.to_owned(),
            buildpack_version: "0.0.1".to_owned(),
            duration_ms: 10,
            user_duration_ms: 5,
        }
    }

    #[test]
    fn read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputFile::new(dir.path()).read().unwrap();
        assert_eq!(out, BuilderOutput::default());
    }

    #[test]
    fn append_creates_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = OutputFile::new(dir.path().join("nested"));
        file.append_success(BuilderOutput {
            stats: vec![stat("a")],
            ..BuilderOutput::default()
        })
        .unwrap();
        assert!(file.path().exists());
        assert_eq!(file.read().unwrap().stats, vec![stat("a")]);
    }

    #[test]
    fn error_message_is_truncated_to_tail() {
        let dir = tempfile::tempdir().unwrap();
        let file = OutputFile::new(dir.path());
        let long = format!("{}the real problem", "x".repeat(4000));
        file.write_error(&BuildError::user(long)).unwrap();
        let out = file.read().unwrap();
        assert!(out.error.message.len() <= MAX_MESSAGE_BYTES);
        assert!(out.error.message.starts_with("..."));
        assert!(out.error.message.ends_with("the real problem"));
        assert_eq!(out.error.status, Status::Unknown);
    }

    #[test]
    fn write_error_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = OutputFile::new(dir.path());
        file.write_error(&BuildError::internal("one")).unwrap();
        file.write_error(&BuildError::internal("two")).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(OUTPUT_FILE_NAME)]);
        assert_eq!(file.read().unwrap().error.message, "two");
    }

    #[test]
    fn corrupt_file_fails_append() {
        let dir = tempfile::tempdir().unwrap();
        let file = OutputFile::new(dir.path());
        fs::write(file.path(), b"][").unwrap();
        assert!(matches!(
            file.append_success(BuilderOutput::default()),
            Err(OutputError::Unmarshal(_))
        ));
    }
}
