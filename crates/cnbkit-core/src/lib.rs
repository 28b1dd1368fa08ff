//! cnbkit-core: the host side of a Cloud Native Buildpack.
//!
//! Buildpack authors write a detect function and a build function against a
//! [`Context`] and hand them to [`main`] (one buildpack per executable) or
//! [`main_runner`] (several buildpacks behind one binary). The driver reads
//! the lifecycle's inputs, runs the function, writes the platform files
//! (`plan.toml`, `<layer>.toml`, `launch.toml`, `build.toml`) and records
//! the outcome in the builder output file.
//!
//! Everything a build does goes through the context: subprocesses
//! ([`Context::exec`]), layers ([`Context::layer`]), cache keys
//! ([`cache`]), layer environment files ([`Context::layer_env`]), launch
//! processes and labels, warnings and spans. Failures are [`BuildError`]s
//! carrying a [`Status`] that says whether the user or the platform is to
//! blame.

pub mod cache;
pub mod config;
pub mod context;
pub mod detect;
pub mod driver;
pub mod exec;
pub mod fsutil;
pub mod layer_env;
pub mod layers;
pub mod log;
pub mod platform;
pub mod span;

pub use config::Config;
pub use context::{Context, ContextBuilder, ProcessOptions, WEB_PROCESS};
pub use detect::{BuildPlan, DetectResult, Provide, Require};
pub use driver::{
    main, main_runner, resolve_registered, BuildFn, Buildpack, DetectFn, Driver, Phase,
    PlatformDirs, Registry, ERROR_STATUS_CODE, FAIL_STATUS_CODE, PASS_STATUS_CODE,
};
pub use exec::{ExecFailure, ExecOptions, ExecResult, MessageProducer};
pub use layer_env::{EnvAction, EnvScope};
pub use layers::{Layer, LayerOption};
pub use log::BuildLog;
pub use platform::{BuildpackInfo, Label, PlanEntry, Process};
pub use span::SpanInfo;

pub use cnbkit_error::{build_error, internal_error, user_error, BuildError, ErrorId, Status};
