//! Filesystem wrappers that report failures as platform-attributed [`BuildError`]s.
//!
//! Every error names the operation and the path involved so a failing
//! build log reads without a stack trace.

use crate::context::Context;
use cnbkit_error::{internal_error, BuildError};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Permission bits for directories created here.
pub const DIR_MODE: u32 = 0o755;

const DEPENDENCY_DIRS: &[&str] = &["node_modules"];

pub fn glob(pattern: &str) -> Result<Vec<PathBuf>, BuildError> {
    let paths = glob::glob(pattern).map_err(|e| internal_error!("globbing {pattern}: {e}"))?;
    // Entries that cannot be read are skipped, matching a plain directory listing.
    Ok(paths.filter_map(Result::ok).collect())
}

pub fn read_file(path: &Path) -> Result<Vec<u8>, BuildError> {
    fs::read(path).map_err(|e| internal_error!("reading file {:?}: {e}", path.display().to_string()))
}

pub fn read_to_string(path: &Path) -> Result<String, BuildError> {
    fs::read_to_string(path)
        .map_err(|e| internal_error!("reading file {:?}: {e}", path.display().to_string()))
}

pub fn write_file(path: &Path, data: impl AsRef<[u8]>) -> Result<(), BuildError> {
    fs::write(path, data)
        .map_err(|e| internal_error!("writing file {:?}: {e}", path.display().to_string()))
}

/// Directory entries sorted by file name.
pub fn read_dir(path: &Path) -> Result<Vec<fs::DirEntry>, BuildError> {
    let err = |e: std::io::Error| {
        internal_error!("reading directory {:?}: {e}", path.display().to_string())
    };
    let mut entries = fs::read_dir(path)
        .map_err(err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(err)?;
    entries.sort_by_key(fs::DirEntry::file_name);
    Ok(entries)
}

/// Create `path` and its parents with [`DIR_MODE`].
pub fn mkdir_all(path: &Path) -> Result<(), BuildError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    std::os::unix::fs::DirBuilderExt::mode(&mut builder, DIR_MODE);
    builder
        .create(path)
        .map_err(|e| internal_error!("creating {}: {e}", path.display()))
}

/// Remove a file or directory tree. A missing path is not an error.
pub fn remove_all(path: &Path) -> Result<(), BuildError> {
    let res = match fs::symlink_metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    };
    res.map_err(|e| internal_error!("removing {}: {e}", path.display()))
}

pub fn rename(from: &Path, to: &Path) -> Result<(), BuildError> {
    tracing::debug!("renaming {} to {}", from.display(), to.display());
    fs::rename(from, to)
        .map_err(|e| internal_error!("renaming {} to {}: {e}", from.display(), to.display()))
}

#[cfg(unix)]
pub fn symlink(target: &Path, link: &Path) -> Result<(), BuildError> {
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        internal_error!(
            "symlinking from {:?} to {:?}: {e}",
            target.display().to_string(),
            link.display().to_string()
        )
    })
}

pub fn create_file(path: &Path) -> Result<fs::File, BuildError> {
    fs::File::create(path).map_err(|e| internal_error!("creating {}: {e}", path.display()))
}

/// `Ok(false)` only when nothing exists at `path`; other stat failures are errors.
pub fn file_exists(path: &Path) -> Result<bool, BuildError> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(internal_error!("stat {:?}: {e}", path.display().to_string())),
    }
}

/// Whether the owner write bit is set.
#[cfg(unix)]
pub fn is_writable(path: &Path) -> Result<bool, BuildError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)
        .map_err(|e| internal_error!("stat {:?}: {e}", path.display().to_string()))?;
    Ok(meta.permissions().mode() & 0o200 != 0)
}

/// `true` if `root/pattern` globs to anything, or any file name under `root`
/// matches `pattern`.
///
/// The walk stops at the first match and never descends into a directory
/// for which `keep_dir` returns `false`.
pub fn has_at_least_one_filtered<F>(
    root: &Path,
    pattern: &str,
    keep_dir: F,
) -> Result<bool, BuildError>
where
    F: Fn(&Path) -> bool,
{
    let rooted = root.join(pattern);
    if !glob(&rooted.to_string_lossy())?.is_empty() {
        return Ok(true);
    }

    let matcher = glob::Pattern::new(pattern)
        .map_err(|e| internal_error!("matching pattern {pattern}: {e}"))?;
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !e.file_type().is_dir() || e.depth() == 0 || keep_dir(e.path()));
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).display().to_string();
            internal_error!("walking through {path} within {}: {e}", root.display())
        })?;
        if entry.depth() == 0 {
            continue;
        }
        if matcher.matches(&entry.file_name().to_string_lossy()) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn has_at_least_one(root: &Path, pattern: &str) -> Result<bool, BuildError> {
    has_at_least_one_filtered(root, pattern, |_| true)
}

/// Like [`has_at_least_one`], skipping vendored dependency trees such as `node_modules`.
pub fn has_at_least_one_outside_dependency_directories(
    root: &Path,
    pattern: &str,
) -> Result<bool, BuildError> {
    has_at_least_one_filtered(root, pattern, |dir| {
        !dir.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| DEPENDENCY_DIRS.contains(&n))
    })
}

impl Context {
    /// Whether `rel` exists under the application root.
    pub fn app_file_exists(&self, rel: impl AsRef<Path>) -> Result<bool, BuildError> {
        file_exists(&self.app_path(rel))
    }

    pub fn has_at_least_one(&self, pattern: &str) -> Result<bool, BuildError> {
        has_at_least_one(self.application_root(), pattern)
    }

    pub fn has_at_least_one_outside_dependency_directories(
        &self,
        pattern: &str,
    ) -> Result<bool, BuildError> {
        has_at_least_one_outside_dependency_directories(self.application_root(), pattern)
    }

    pub fn has_at_least_one_filtered<F>(
        &self,
        pattern: &str,
        keep_dir: F,
    ) -> Result<bool, BuildError>
    where
        F: Fn(&Path) -> bool,
    {
        has_at_least_one_filtered(self.application_root(), pattern, keep_dir)
    }
}
