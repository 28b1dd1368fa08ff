//! Cache keys for layers.
//!
//! A key is a SHA-256 over the buildpack identity followed by the caller's
//! inputs. Storing it as layer metadata lets the next build compare keys and
//! reuse the layer when nothing changed.

use crate::context::Context;
use crate::layers::Layer;
use cnbkit_error::{internal_error, BuildError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Values folded into a cache key, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheInput {
    Strings(Vec<String>),
    /// Contents of each file. A missing file fails the hash, and the
    /// `io::Error` stays reachable through the error source.
    Files(Vec<PathBuf>),
}

impl CacheInput {
    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Strings(values.into_iter().map(Into::into).collect())
    }

    pub fn files<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::Files(paths.into_iter().map(Into::into).collect())
    }
}

/// One typed component of a dependency fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashComponent {
    /// Hashed as `true` or `false`.
    Bool(bool),
    /// Hashed as its decimal text.
    Int(i64),
    Str(String),
    /// Hashed as the raw bytes of the file.
    FileContents(PathBuf),
}

fn identity_hasher(ctx: &Context) -> Sha256 {
    let mut h = Sha256::new();
    h.update(ctx.buildpack_id().as_bytes());
    h.update(ctx.buildpack_version().as_bytes());
    h
}

fn hash_file(h: &mut Sha256, path: &Path) -> Result<(), BuildError> {
    let name = path.display().to_string();
    let mut f =
        File::open(path).map_err(|e| internal_error!("opening {name:?}: {e}").with_source(e))?;
    io::copy(&mut f, h).map_err(|e| internal_error!("reading {name:?}: {e}").with_source(e))?;
    Ok(())
}

/// Hex SHA-256 of the buildpack id and version followed by every input.
pub fn hash(ctx: &Context, inputs: &[CacheInput]) -> Result<String, BuildError> {
    let mut h = identity_hasher(ctx);
    for input in inputs {
        match input {
            CacheInput::Strings(values) => {
                for v in values {
                    h.update(v.as_bytes());
                }
            }
            CacheInput::Files(paths) => {
                for p in paths {
                    hash_file(&mut h, p)?;
                }
            }
        }
    }
    Ok(hex::encode(h.finalize()))
}

/// Compute the key for `inputs` and compare it with the one stored under
/// `key` in the layer's metadata.
///
/// Returns the new key and whether it matched. A match logs a cache hit
/// and a mismatch a cache miss; callers persist the new key with [`add`].
pub fn hash_and_check(
    ctx: &Context,
    layer: &Layer,
    key: &str,
    inputs: &[CacheInput],
) -> Result<(String, bool), BuildError> {
    let current = hash(ctx, inputs).map_err(|e| {
        internal_error!("computing dependency hash: {}", e.message).with_source(e)
    })?;

    let previous = ctx.get_metadata(layer, key);
    ctx.log_debug(format!("Current dependency hash: {current:?}"));
    ctx.log_debug(format!("  Cache dependency hash: {previous:?}"));
    if previous.is_empty() {
        ctx.log_debug(format!(
            "No cache metadata found from a previous build for key: {key:?}, skipping cache."
        ));
    }

    let cached = current == previous;
    if cached {
        ctx.cache_hit(&layer.name);
    } else {
        ctx.cache_miss(&layer.name);
    }
    Ok((current, cached))
}

/// Store `value` under `key` for the next build.
pub fn add(ctx: &mut Context, layer: &mut Layer, key: &str, value: impl Into<String>) {
    ctx.set_metadata(layer, key, value);
}

/// Hex SHA-256 of the buildpack id and version followed by each component.
pub fn compute_sha256(ctx: &Context, components: &[HashComponent]) -> Result<String, BuildError> {
    let mut h = identity_hasher(ctx);
    for c in components {
        match c {
            HashComponent::Bool(b) => h.update(if *b { "true" } else { "false" }),
            HashComponent::Int(n) => h.update(n.to_string()),
            HashComponent::Str(s) => h.update(s.as_bytes()),
            HashComponent::FileContents(path) => hash_file(&mut h, path)?,
        }
    }
    Ok(hex::encode(h.finalize()))
}

/// Fingerprint of a language version and the contents of `files`.
pub fn dependency_hash<P: AsRef<Path>>(
    ctx: &Context,
    lang_version: &str,
    files: &[P],
) -> Result<String, BuildError> {
    let mut components = Vec::with_capacity(files.len() + 1);
    components.push(HashComponent::Str(lang_version.to_owned()));
    components.extend(
        files
            .iter()
            .map(|f| HashComponent::FileContents(f.as_ref().to_path_buf())),
    );
    compute_sha256(ctx, &components)
}
