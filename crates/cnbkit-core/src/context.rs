use crate::config::Config;
use crate::detect::DetectResult;
use crate::layers::Layer;
use crate::log::BuildLog;
use crate::platform::{BuildpackInfo, BuildpackPlan, Label, PlanEntry, Process};
use crate::span::SpanInfo;
use chrono::{DateTime, Utc};
use cnbkit_error::{BuildError, Status};
use cnbkit_output::{BuilderMetadata, BuilderMetrics};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub const WEB_PROCESS: &str = "web";

const CACHE_HIT_MESSAGE: &str = "***** CACHE HIT:";
const CACHE_MISS_MESSAGE: &str = "***** CACHE MISS:";
const LABEL_KEY_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9_-]*$";

static LABEL_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(LABEL_KEY_PATTERN).expect("Invalid label key regex"));

/// How [`Context::add_process`] launches a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Run the command without wrapping it in `bash -c`.
    pub direct: bool,
    /// Start this process when the image runs without arguments.
    pub default: bool,
}

/// Per-invocation state handed to detect and build functions.
///
/// A context is created once per phase and dropped at exit. Everything it
/// accumulates (warnings, spans, processes, layers) is turned into platform
/// files and builder output by the driver.
#[derive(Debug)]
pub struct Context {
    info: BuildpackInfo,
    app_root: PathBuf,
    buildpack_root: PathBuf,
    layers_dir: Option<PathBuf>,
    config: Config,
    log: BuildLog,
    env: BTreeMap<String, String>,
    user_time: Duration,
    spans: Vec<SpanInfo>,
    warnings: Vec<String>,
    runtime_versions: Vec<String>,
    pub(crate) layers: BTreeMap<String, Layer>,
    processes: Vec<Process>,
    labels: Vec<Label>,
    plan: BuildpackPlan,
    unmet: Vec<String>,
    metrics: BuilderMetrics,
    metadata: BuilderMetadata,
    custom_image: bool,
    decision: Option<DetectResult>,
}

#[derive(Debug, Default)]
pub struct ContextBuilder {
    info: BuildpackInfo,
    app_root: Option<PathBuf>,
    buildpack_root: Option<PathBuf>,
    layers_dir: Option<PathBuf>,
    config: Config,
    log: Option<BuildLog>,
    plan: BuildpackPlan,
}

impl ContextBuilder {
    #[must_use]
    pub fn info(mut self, info: BuildpackInfo) -> Self {
        self.info = info;
        self
    }

    #[must_use]
    pub fn application_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.app_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn buildpack_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.buildpack_root = Some(root.into());
        self
    }

    /// Only build contexts have a layers directory.
    #[must_use]
    pub fn layers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.layers_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn log(mut self, log: BuildLog) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub fn plan(mut self, plan: BuildpackPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn build(self) -> Context {
        Context {
            info: self.info,
            app_root: self.app_root.unwrap_or_else(|| PathBuf::from(".")),
            buildpack_root: self.buildpack_root.unwrap_or_else(|| PathBuf::from(".")),
            layers_dir: self.layers_dir,
            config: self.config,
            log: self.log.unwrap_or_default(),
            env: BTreeMap::new(),
            user_time: Duration::ZERO,
            spans: Vec::new(),
            warnings: Vec::new(),
            runtime_versions: Vec::new(),
            layers: BTreeMap::new(),
            processes: Vec::new(),
            labels: Vec::new(),
            plan: self.plan,
            unmet: Vec::new(),
            metrics: BuilderMetrics::default(),
            metadata: BuilderMetadata::default(),
            custom_image: false,
            decision: None,
        }
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    #[inline]
    pub fn info(&self) -> &BuildpackInfo {
        &self.info
    }

    #[inline]
    pub fn buildpack_id(&self) -> &str {
        &self.info.id
    }

    #[inline]
    pub fn buildpack_version(&self) -> &str {
        &self.info.version
    }

    #[inline]
    pub fn buildpack_name(&self) -> &str {
        &self.info.name
    }

    #[inline]
    pub fn application_root(&self) -> &Path {
        &self.app_root
    }

    #[inline]
    pub fn buildpack_root(&self) -> &Path {
        &self.buildpack_root
    }

    /// `rel` resolved against the application root.
    pub fn app_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.app_root.join(rel)
    }

    pub fn layers_dir(&self) -> Result<&Path, BuildError> {
        self.layers_dir
            .as_deref()
            .ok_or_else(|| BuildError::internal("layers are only available during build"))
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn is_debug(&self) -> bool {
        self.config.debug
    }

    #[inline]
    pub fn build_log(&self) -> &BuildLog {
        &self.log
    }

    pub fn log(&self, msg: impl AsRef<str>) {
        self.log.line(msg.as_ref());
    }

    /// Log only in debug mode.
    pub fn log_debug(&self, msg: impl AsRef<str>) {
        if self.config.debug {
            self.log.line(&format!("DEBUG: {}", msg.as_ref()));
        }
    }

    /// Log a warning and keep it for the builder output.
    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        self.log.line(&format!("WARNING: {msg}"));
        self.warnings.push(msg);
    }

    pub fn cache_hit(&self, tag: &str) {
        self.log(format!("{CACHE_HIT_MESSAGE} {tag:?}"));
    }

    pub fn cache_miss(&self, tag: &str) {
        self.log(format!("{CACHE_MISS_MESSAGE} {tag:?}"));
    }

    #[inline]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Record a span from `start` until now, tagged with the buildpack identity.
    pub fn span(&mut self, label: impl Into<String>, start: DateTime<Utc>, status: Status) {
        let attributes = BTreeMap::from([
            ("/buildpack_id".to_owned(), self.info.id.clone()),
            ("/buildpack_name".to_owned(), self.info.name.clone()),
            ("/buildpack_version".to_owned(), self.info.version.clone()),
        ]);
        match SpanInfo::new(label, start, Utc::now(), attributes, status) {
            Ok(span) => self.spans.push(span),
            Err(e) => self.warn(format!("Invalid span dropped: {e}")),
        }
    }

    #[inline]
    pub fn spans(&self) -> &[SpanInfo] {
        &self.spans
    }

    /// Total wall time of user-timed subprocesses so far.
    #[inline]
    pub fn user_duration(&self) -> Duration {
        self.user_time
    }

    pub(crate) fn add_user_time(&mut self, elapsed: Duration) {
        self.user_time += elapsed;
    }

    pub fn add_installed_runtime_version(&mut self, version: impl Into<String>) {
        self.runtime_versions.push(version.into());
    }

    #[inline]
    pub fn installed_runtime_versions(&self) -> &[String] {
        &self.runtime_versions
    }

    pub fn set_custom_image(&mut self, custom: bool) {
        self.custom_image = custom;
    }

    #[inline]
    pub fn custom_image(&self) -> bool {
        self.custom_image
    }

    pub fn metrics_mut(&mut self) -> &mut BuilderMetrics {
        &mut self.metrics
    }

    pub fn metadata_mut(&mut self) -> &mut BuilderMetadata {
        &mut self.metadata
    }

    pub(crate) fn take_builder_records(&mut self) -> (BuilderMetrics, BuilderMetadata) {
        (
            std::mem::take(&mut self.metrics),
            std::mem::take(&mut self.metadata),
        )
    }

    /// Declare the web process: direct and default.
    pub fn add_web_process<S: AsRef<str>>(&mut self, cmd: &[S]) {
        self.add_process(
            WEB_PROCESS,
            cmd,
            ProcessOptions {
                direct: true,
                default: true,
            },
        );
    }

    /// Declare a launch process, replacing any earlier one with the same name.
    ///
    /// Non-direct commands are joined with spaces and run through `bash -c`.
    pub fn add_process<S: AsRef<str>>(&mut self, name: &str, cmd: &[S], opts: ProcessOptions) {
        if let Some(pos) = self.processes.iter().position(|p| p.kind == name) {
            let old = self.processes.remove(pos);
            self.log(format!(
                "Overwriting existing {name} process {:?}.",
                old.command
            ));
        }
        let tokens: Vec<String> = cmd.iter().map(|c| c.as_ref().to_owned()).collect();
        let command = if opts.direct {
            tokens
        } else {
            vec!["bash".to_owned(), "-c".to_owned(), tokens.join(" ")]
        };
        self.processes.push(Process {
            kind: name.to_owned(),
            command,
            args: Vec::new(),
            default: opts.default,
            direct: opts.direct,
        });
    }

    #[inline]
    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    /// Add an image label as `google.<key>`, lower-cased with `_` turned into `-`.
    ///
    /// Keys that are not env-var-like, or that contain `__`, are skipped with a warning.
    pub fn add_label(&mut self, key: &str, value: &str) {
        if !LABEL_KEY_REGEX.is_match(key) {
            self.warn(format!(
                "Label {key:?} does not match {LABEL_KEY_PATTERN}, skipping."
            ));
            return;
        }
        if key.contains("__") {
            self.warn(format!(
                "Label {key:?} must not contain consecutive underscores, skipping."
            ));
            return;
        }
        let key = format!("google.{}", key.replace('_', "-").to_lowercase());
        self.log(format!("Adding image label {key}: {value}"));
        self.labels.push(Label {
            key,
            value: value.to_owned(),
        });
    }

    #[inline]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Entries of the buildpack plan this build was given.
    #[inline]
    pub fn plan_entries(&self) -> &[PlanEntry] {
        &self.plan.entries
    }

    /// Report a plan entry this buildpack could not satisfy.
    pub fn mark_unmet(&mut self, name: impl Into<String>) {
        self.unmet.push(name.into());
    }

    #[inline]
    pub fn unmet(&self) -> &[String] {
        &self.unmet
    }

    /// Opt in without returning a result from detect.
    pub fn opt_in(&mut self, reason: impl AsRef<str>) {
        self.decision = Some(DetectResult::opt_in(reason));
    }

    /// Opt out without returning a result from detect.
    pub fn opt_out(&mut self, reason: impl AsRef<str>) {
        self.decision = Some(DetectResult::opt_out(reason));
    }

    pub(crate) fn take_decision(&mut self) -> Option<DetectResult> {
        self.decision.take()
    }

    /// Set a variable for this invocation's subprocesses.
    ///
    /// It does not reach the build or launch environment of later
    /// buildpacks; use a layer environment for that.
    pub fn setenv(&mut self, key: &str, value: &str) {
        self.log(format!("Setting environment variable {key}={value}"));
        self.env.insert(key.to_owned(), value.to_owned());
    }

    /// A variable set with [`setenv`](Self::setenv), else from the environment snapshot.
    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(String::as_str)
            .or_else(|| self.config.var(key))
    }

    pub(crate) fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn home_dir(&self) -> PathBuf {
        PathBuf::from(self.getenv("HOME").unwrap_or_default())
    }

    /// Status code of a HEAD request. Error statuses are returned, not raised.
    pub fn http_status(&self, url: &str) -> Result<u16, BuildError> {
        tracing::debug!("HEAD {url}");
        match ureq::head(url).call() {
            Ok(resp) => Ok(resp.status().into()),
            Err(ureq::Error::StatusCode(code)) => Ok(code),
            Err(e) => Err(BuildError::internal(format!(
                "getting status code for {url}: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::builder()
            .info(BuildpackInfo {
                id: "test.bp".to_owned(),
                version: "1.2.3".to_owned(),
                name: "Test".to_owned(),
            })
            .log(BuildLog::capture())
            .build()
    }

    #[test]
    fn identity_accessors() {
        let ctx = ctx();
        assert_eq!(ctx.buildpack_id(), "test.bp");
        assert_eq!(ctx.buildpack_version(), "1.2.3");
        assert_eq!(ctx.buildpack_name(), "Test");
        assert!(ctx.layers_dir().is_err());
    }

    #[test]
    fn warn_records_and_logs() {
        let mut ctx = ctx();
        ctx.warn("disk almost full");
        assert_eq!(ctx.warnings(), ["disk almost full"]);
        assert!(ctx.build_log().captured().contains("WARNING: disk almost full"));
    }

    #[test]
    fn debug_lines_need_debug_mode() {
        let quiet = ctx();
        quiet.log_debug("hidden");
        assert!(quiet.build_log().captured().is_empty());

        let loud = Context::builder()
            .config(Config::from_vars([("GOOGLE_DEBUG", "true")]).unwrap())
            .log(BuildLog::capture())
            .build();
        loud.log_debug("shown");
        assert_eq!(loud.build_log().captured(), "DEBUG: shown\n");
    }

    #[test]
    fn cache_messages() {
        let ctx = ctx();
        ctx.cache_hit("node");
        ctx.cache_miss("npm");
        assert_eq!(
            ctx.build_log().captured(),
            "***** CACHE HIT: \"node\"\n***** CACHE MISS: \"npm\"\n"
        );
    }

    #[test]
    fn spans_carry_buildpack_attributes() {
        let mut ctx = ctx();
        ctx.span("Buildpack Build \"test.bp\"", Utc::now(), Status::Ok);
        let span = &ctx.spans()[0];
        assert_eq!(span.attributes["/buildpack_id"], "test.bp");
        assert_eq!(span.attributes["/buildpack_name"], "Test");
        assert_eq!(span.attributes["/buildpack_version"], "1.2.3");
    }

    #[test]
    fn invalid_span_is_dropped_with_warning() {
        let mut ctx = ctx();
        ctx.span("", Utc::now(), Status::Ok);
        assert!(ctx.spans().is_empty());
        assert_eq!(ctx.warnings(), ["Invalid span dropped: span name required"]);
    }

    #[test]
    fn shell_processes_are_wrapped() {
        let mut ctx = ctx();
        ctx.add_process("worker", &["python", "worker.py"], ProcessOptions::default());
        let p = &ctx.processes()[0];
        assert_eq!(p.command, ["bash", "-c", "python worker.py"]);
        assert!(!p.direct);
        assert!(!p.default);
    }

    #[test]
    fn web_process_is_direct_and_default() {
        let mut ctx = ctx();
        ctx.add_web_process(&["gunicorn", "main:app"]);
        let p = &ctx.processes()[0];
        assert_eq!(p.kind, WEB_PROCESS);
        assert_eq!(p.command, ["gunicorn", "main:app"]);
        assert!(p.direct && p.default);
    }

    #[test]
    fn same_name_process_is_replaced() {
        let mut ctx = ctx();
        ctx.add_process("web", &["old"], ProcessOptions::default());
        ctx.add_process("worker", &["w"], ProcessOptions::default());
        ctx.add_web_process(&["new"]);
        let kinds: Vec<_> = ctx.processes().iter().map(|p| p.kind.as_str()).collect();
        assert_eq!(kinds, ["worker", "web"]);
        assert_eq!(ctx.processes()[1].command, ["new"]);
        assert!(ctx
            .build_log()
            .captured()
            .contains("Overwriting existing web process"));
    }

    #[test]
    fn labels_are_normalized() {
        let mut ctx = ctx();
        ctx.add_label("Runtime_Version", "3.12");
        assert_eq!(
            ctx.labels(),
            [Label {
                key: "google.runtime-version".to_owned(),
                value: "3.12".to_owned()
            }]
        );
        assert!(ctx
            .build_log()
            .captured()
            .contains("Adding image label google.runtime-version: 3.12"));
    }

    #[test]
    fn invalid_labels_are_skipped() {
        let mut ctx = ctx();
        for key in ["", "1abc", "has.dot", "a b", "double__underscore"] {
            ctx.add_label(key, "v");
        }
        assert!(ctx.labels().is_empty());
        assert_eq!(ctx.warnings().len(), 5);
        assert!(ctx.warnings()[4].contains("consecutive underscores"));
    }

    #[test]
    fn explicit_decisions_are_taken_once() {
        let mut ctx = ctx();
        ctx.opt_out("nothing to do");
        let d = ctx.take_decision().unwrap();
        assert!(!d.pass);
        assert_eq!(d.reason, "Opting out: nothing to do");
        assert!(ctx.take_decision().is_none());
    }

    #[test]
    fn setenv_shadows_snapshot() {
        let mut ctx = Context::builder()
            .config(Config::from_vars([("HOME", "/home/cnb"), ("LANG", "C")]).unwrap())
            .log(BuildLog::capture())
            .build();
        assert_eq!(ctx.home_dir(), PathBuf::from("/home/cnb"));
        ctx.setenv("LANG", "C.UTF-8");
        assert_eq!(ctx.getenv("LANG"), Some("C.UTF-8"));
        assert_eq!(ctx.getenv("MISSING"), None);
        assert!(ctx
            .build_log()
            .captured()
            .contains("Setting environment variable LANG=C.UTF-8"));
    }

    #[test]
    fn unmet_and_runtime_versions_accumulate() {
        let mut ctx = ctx();
        ctx.mark_unmet("python");
        ctx.add_installed_runtime_version("3.12.1");
        ctx.metrics_mut().increment("1", 1);
        ctx.metadata_mut().set("3", "flask");
        assert_eq!(ctx.unmet(), ["python"]);
        assert_eq!(ctx.installed_runtime_versions(), ["3.12.1"]);
        let (metrics, metadata) = ctx.take_builder_records();
        assert_eq!(metrics.counter("1"), 1);
        assert_eq!(metadata.get("3"), Some("flask"));
    }

    #[test]
    fn label_key_pattern() {
        for key in ["a", "A-b_9", "GOOGLE_LABEL"] {
            assert!(LABEL_KEY_REGEX.is_match(key), "{key}");
        }
        for key in ["", "-a", "9a", "é", "a.b", "a\nb", "a b"] {
            assert!(!LABEL_KEY_REGEX.is_match(key), "{key:?}");
        }
    }
}
