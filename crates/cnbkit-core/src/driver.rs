//! The detect and build phases: running author functions, translating their
//! outcome into platform files, builder output and an exit code.

use crate::config::{Config, EXPECTED_BUILDER_OUTPUT_ENV};
use crate::context::Context;
use crate::detect::DetectResult;
use crate::log::BuildLog;
use crate::platform::{
    read_buildpack_info, read_buildpack_plan, write_detect_plan, write_toml, BuildToml,
    BuildpackPlan, LaunchToml, Unmet,
};
use chrono::Utc;
use cnbkit_error::{BuildError, Status};
use cnbkit_output::{BuilderOutput, BuilderStat, OutputFile};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::{Duration, Instant};

pub const PASS_STATUS_CODE: u8 = 0;
pub const FAIL_STATUS_CODE: u8 = 100;
pub const ERROR_STATUS_CODE: u8 = 1;

pub const BUILDPACK_DIR_ENV: &str = "CNB_BUILDPACK_DIR";
pub const PLATFORM_DIR_ENV: &str = "CNB_PLATFORM_DIR";
pub const BUILD_PLAN_PATH_ENV: &str = "CNB_BUILD_PLAN_PATH";
pub const LAYERS_DIR_ENV: &str = "CNB_LAYERS_DIR";
pub const BP_PLAN_PATH_ENV: &str = "CNB_BP_PLAN_PATH";

/// Decide whether the buildpack applies. Return `Ok(None)` only after
/// calling [`Context::opt_in`] or [`Context::opt_out`].
pub type DetectFn = fn(&mut Context) -> anyhow::Result<Option<DetectResult>>;
pub type BuildFn = fn(&mut Context) -> anyhow::Result<()>;

/// The two entry points of one buildpack.
#[derive(Debug, Clone, Copy)]
pub struct Buildpack {
    pub detect: DetectFn,
    pub build: BuildFn,
}

/// Buildpacks served by one runner binary, by ID.
pub type Registry = BTreeMap<String, Buildpack>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detect,
    Build,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Detect => "detect",
            Phase::Build => "build",
        })
    }
}

impl FromStr for Phase {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detect" => Ok(Phase::Detect),
            "build" => Ok(Phase::Build),
            _ => Err(BuildError::internal(format!(
                "Invalid phase {s:?}, expected 'detect' or 'build'"
            ))),
        }
    }
}

/// Locations handed over by the lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformDirs {
    pub buildpack_dir: PathBuf,
    pub platform_dir: Option<PathBuf>,
    /// Plan written by detect, or the buildpack plan read by build.
    pub plan_path: Option<PathBuf>,
    /// Build only.
    pub layers_dir: Option<PathBuf>,
}

impl PlatformDirs {
    /// Resolve from `CNB_*` variables, falling back to positional arguments:
    /// `detect <platform> <plan>` and `build <layers> <platform> <plan>`.
    ///
    /// Without `CNB_BUILDPACK_DIR` the buildpack root is the parent of the
    /// executable's `bin/` directory.
    pub fn resolve(phase: Phase, argv0: &Path, args: &[String], config: &Config) -> Self {
        let pick = |env: &str, pos: usize| {
            config
                .var(env)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| args.get(pos).map(PathBuf::from))
        };
        let buildpack_dir = config
            .var(BUILDPACK_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| argv0.parent().and_then(Path::parent).map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        match phase {
            Phase::Detect => Self {
                buildpack_dir,
                platform_dir: pick(PLATFORM_DIR_ENV, 0),
                plan_path: pick(BUILD_PLAN_PATH_ENV, 1),
                layers_dir: None,
            },
            Phase::Build => Self {
                buildpack_dir,
                layers_dir: pick(LAYERS_DIR_ENV, 0),
                platform_dir: pick(PLATFORM_DIR_ENV, 1),
                plan_path: pick(BP_PLAN_PATH_ENV, 2),
            },
        }
    }
}

/// Runs one phase of one buildpack and reports the outcome.
#[derive(Debug, Clone)]
pub struct Driver {
    app_root: PathBuf,
    dirs: PlatformDirs,
    config: Config,
    log: BuildLog,
}

impl Driver {
    pub fn new(app_root: impl Into<PathBuf>, dirs: PlatformDirs, config: Config) -> Self {
        Self {
            app_root: app_root.into(),
            dirs,
            config,
            log: BuildLog::stderr(),
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: BuildLog) -> Self {
        self.log = log;
        self
    }

    /// Driver for the current process: environment, working directory and arguments.
    pub fn from_env(phase: Phase, argv0: &Path, args: &[String]) -> Result<Self, BuildError> {
        let config = Config::from_env()?;
        let app_root = std::env::current_dir()
            .map_err(|e| BuildError::wrap(Status::Internal, "getting working directory", e))?;
        let dirs = PlatformDirs::resolve(phase, argv0, args, &config);
        tracing::debug!(?dirs, app = %app_root.display(), "resolved {phase} inputs");
        Ok(Self::new(app_root, dirs, config))
    }

    #[inline]
    pub fn build_log(&self) -> &BuildLog {
        &self.log
    }

    pub fn run(&self, phase: Phase, buildpack: Buildpack) -> u8 {
        match phase {
            Phase::Detect => self.detect(buildpack.detect),
            Phase::Build => self.build(buildpack.build),
        }
    }

    fn bare_context(&self) -> Context {
        Context::builder()
            .application_root(&self.app_root)
            .buildpack_root(&self.dirs.buildpack_dir)
            .config(self.config.clone())
            .log(self.log.clone())
            .build()
    }

    fn context(&self, phase: Phase) -> Result<Context, BuildError> {
        let info = read_buildpack_info(&self.dirs.buildpack_dir)?;
        let mut builder = Context::builder()
            .info(info)
            .application_root(&self.app_root)
            .buildpack_root(&self.dirs.buildpack_dir)
            .config(self.config.clone())
            .log(self.log.clone());
        if phase == Phase::Build {
            let layers = self.dirs.layers_dir.as_ref().ok_or_else(|| {
                BuildError::internal(format!(
                    "layers directory not provided: set {LAYERS_DIR_ENV} or pass it as the first argument"
                ))
            })?;
            let plan = match &self.dirs.plan_path {
                Some(p) => read_buildpack_plan(p)?,
                None => BuildpackPlan::default(),
            };
            builder = builder.layers_dir(layers).plan(plan);
        }
        Ok(builder.build())
    }

    /// Run detect. Exit code 0 passes, 100 opts out, 1 is an error.
    pub fn detect(&self, detect_fn: DetectFn) -> u8 {
        let mut ctx = match self.context(Phase::Detect) {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(&mut self.bare_context(), &e, ERROR_STATUS_CODE),
        };

        let start = Utc::now();
        let outcome = match detect_fn(&mut ctx) {
            Err(e) => Err(normalize(&e, "failed to run /bin/detect")),
            Ok(Some(result)) => Ok(result),
            Ok(None) => ctx.take_decision().ok_or_else(|| {
                BuildError::internal("detect did not return a result or an error")
            }),
        };
        let status = outcome.as_ref().map_or_else(|e| e.status, |_| Status::Ok);
        ctx.span(format!("Buildpack Detect {:?}", ctx.buildpack_id()), start, status);
        emit_spans(&ctx);

        let result = match outcome {
            Ok(result) => result,
            Err(e) => return self.fail(&mut ctx, &e, ERROR_STATUS_CODE),
        };
        ctx.log(&result.reason);
        if !result.pass {
            return FAIL_STATUS_CODE;
        }
        if let Err(e) = self.write_plan(&result) {
            return self.fail(&mut ctx, &e, ERROR_STATUS_CODE);
        }
        PASS_STATUS_CODE
    }

    fn write_plan(&self, result: &DetectResult) -> Result<(), BuildError> {
        if result.plans.is_empty() {
            return Ok(());
        }
        let path = self.dirs.plan_path.as_ref().ok_or_else(|| {
            BuildError::internal(format!(
                "build plan path not provided: set {BUILD_PLAN_PATH_ENV} or pass it as the second argument"
            ))
        })?;
        write_detect_plan(path, &result.plans)?;
        Ok(())
    }

    /// Run build. Exit code 0 on success, 1 on any error.
    pub fn build(&self, build_fn: BuildFn) -> u8 {
        let started = Instant::now();
        let mut ctx = match self.context(Phase::Build) {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(&mut self.bare_context(), &e, ERROR_STATUS_CODE),
        };
        ctx.log(format!(
            "=== {} ({}@{}) ===",
            ctx.buildpack_name(),
            ctx.buildpack_id(),
            ctx.buildpack_version()
        ));

        let start = Utc::now();
        let outcome = build_fn(&mut ctx)
            .map_err(|e| normalize(&e, "failed to build"))
            .and_then(|()| write_build_files(&ctx));
        let status = outcome.as_ref().map_or_else(|e| e.status, |()| Status::Ok);
        ctx.span(format!("Buildpack Build {:?}", ctx.buildpack_id()), start, status);
        emit_spans(&ctx);

        if let Err(e) = outcome {
            return self.fail(&mut ctx, &e, ERROR_STATUS_CODE);
        }
        self.save_success_output(&mut ctx, started.elapsed());
        PASS_STATUS_CODE
    }

    fn fail(&self, ctx: &mut Context, err: &BuildError, code: u8) -> u8 {
        ctx.log(format!("Failure: {err}"));
        self.save_error_output(ctx, err);
        code
    }

    fn save_error_output(&self, ctx: &mut Context, err: &BuildError) {
        let Some(dir) = &self.config.builder_output else {
            return;
        };
        let file = OutputFile::new(dir);
        let err = err
            .clone()
            .with_buildpack(ctx.buildpack_id(), ctx.buildpack_version());
        let written = match file.write_error(&err) {
            Ok(out) => out,
            Err(e) => {
                ctx.warn(format!(
                    "Failed to write {}, skipping structured error output: {e}",
                    file.path().display()
                ));
                return;
            }
        };

        // Lets end-to-end tests assert on the stored message without reading the file.
        if let Some(expected) = &self.config.expected_builder_output {
            match Regex::new(expected) {
                Ok(re) => ctx.log(format!(
                    "Expected pattern included in error output: {}",
                    re.is_match(&written.error.message)
                )),
                Err(e) => ctx.warn(format!("Bad regexp {EXPECTED_BUILDER_OUTPUT_ENV:?}: {e}")),
            }
        }
    }

    fn save_success_output(&self, ctx: &mut Context, elapsed: Duration) {
        let Some(dir) = &self.config.builder_output else {
            return;
        };
        let (metrics, metadata) = ctx.take_builder_records();
        let update = BuilderOutput {
            stats: vec![BuilderStat {
                buildpack_id: ctx.buildpack_id().to_owned(),
                buildpack_version: ctx.buildpack_version().to_owned(),
                duration_ms: millis(elapsed),
                user_duration_ms: millis(ctx.user_duration()),
            }],
            warnings: ctx.warnings().to_vec(),
            custom_image: ctx.custom_image(),
            installed_runtime_versions: ctx.installed_runtime_versions().to_vec(),
            metrics,
            metadata,
            ..BuilderOutput::default()
        };
        let file = OutputFile::new(dir);
        if let Err(e) = file.append_success(update) {
            ctx.warn(format!(
                "Failed to write {}, skipping statistics: {e}",
                file.path().display()
            ));
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// A [`BuildError`] anywhere in the chain wins; anything else is the platform's fault.
fn normalize(err: &anyhow::Error, context: &str) -> BuildError {
    if let Some(be) = err.chain().find_map(|e| e.downcast_ref::<BuildError>()) {
        return be.clone();
    }
    BuildError::internal(format!("{context}: {err:#}"))
}

fn emit_spans(ctx: &Context) {
    for span in ctx.spans() {
        span.emit();
    }
}

fn write_build_files(ctx: &Context) -> Result<(), BuildError> {
    ctx.write_layer_descriptors()?;
    let layers = ctx.layers_dir()?;
    if !ctx.processes().is_empty() || !ctx.labels().is_empty() {
        let launch = LaunchToml {
            processes: ctx.processes().to_vec(),
            labels: ctx.labels().to_vec(),
        };
        write_toml(&layers.join("launch.toml"), &launch)?;
    }
    if !ctx.unmet().is_empty() {
        let build = BuildToml {
            unmet: ctx
                .unmet()
                .iter()
                .map(|name| Unmet { name: name.clone() })
                .collect(),
        };
        write_toml(&layers.join("build.toml"), &build)?;
    }
    Ok(())
}

/// Entry point for a buildpack whose `bin/detect` and `bin/build` are the
/// same executable, told apart by the name it was invoked as.
pub fn main(detect: DetectFn, build: BuildFn) -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let argv0 = PathBuf::from(args.first().map_or("", String::as_str));
    let phase = match argv0.file_name().and_then(|n| n.to_str()) {
        Some("detect") => Phase::Detect,
        Some("build") => Phase::Build,
        _ => {
            BuildLog::stderr().line("Unknown command, expected 'detect' or 'build'.");
            return ExitCode::from(ERROR_STATUS_CODE);
        }
    };
    let rest = args.get(1..).unwrap_or_default();
    ExitCode::from(run_phase(phase, Buildpack { detect, build }, &argv0, rest))
}

fn run_phase(phase: Phase, buildpack: Buildpack, argv0: &Path, args: &[String]) -> u8 {
    match Driver::from_env(phase, argv0, args) {
        Ok(driver) => driver.run(phase, buildpack),
        Err(e) => {
            BuildLog::stderr().line(&format!("Failure: {e}"));
            ERROR_STATUS_CODE
        }
    }
}

/// Look up `id` and `phase` for a multi-buildpack runner.
///
/// Every failure is an internal error; the runner exits 100 on them.
pub fn resolve_registered<'a>(
    registry: &'a Registry,
    id: &str,
    phase: &str,
) -> Result<(&'a Buildpack, Phase), BuildError> {
    if id.is_empty() {
        return Err(BuildError::internal(
            "Usage: runner -buildpack <id> [args...]",
        ));
    }
    let Some(buildpack) = registry.get(id) else {
        let ids: Vec<&str> = registry.keys().map(String::as_str).collect();
        return Err(BuildError::internal(format!(
            "Unknown buildpack ID: {id}\nRegistered buildpacks are:\n  {}",
            ids.join("\n  ")
        )));
    };
    Ok((buildpack, phase.parse()?))
}

/// Entry point for a binary that serves several buildpacks.
pub fn main_runner(registry: &Registry, id: &str, phase: &str, args: &[String]) -> ExitCode {
    let (buildpack, phase) = match resolve_registered(registry, id, phase) {
        Ok(found) => found,
        Err(e) => return ExitCode::from(runner_failure(&e)),
    };
    let argv0 = std::env::args().next().map(PathBuf::from).unwrap_or_default();
    ExitCode::from(run_phase(phase, *buildpack, &argv0, args))
}

fn runner_failure(err: &BuildError) -> u8 {
    let log = BuildLog::stderr();
    match Config::from_env() {
        Ok(config) => {
            let driver = Driver::new(".", PlatformDirs::default(), config).with_log(log);
            driver.fail(&mut driver.bare_context(), err, FAIL_STATUS_CODE)
        }
        Err(config_err) => {
            log.line(&format!("Failure: {err}"));
            log.line(&format!("Failure: {config_err}"));
            FAIL_STATUS_CODE
        }
    }
}
