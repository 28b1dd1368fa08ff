//! Two consecutive builds of the same app through the driver: the second
//! one must find the first one's cache key and skip the install.

use cnbkit_core::cache::{self, CacheInput};
use cnbkit_core::config::BUILDER_OUTPUT_ENV;
use cnbkit_core::{
    BuildLog, BuildPlan, Config, Context, DetectResult, Driver, EnvScope, ExecOptions,
    LayerOption, Phase, PlatformDirs, PASS_STATUS_CODE,
};
use cnbkit_output::OutputFile;
use std::fs;
use std::path::{Path, PathBuf};

const LOCKFILE: &str = "deps.lock";

fn detect(ctx: &mut Context) -> anyhow::Result<Option<DetectResult>> {
    if !ctx.app_file_exists(LOCKFILE)? {
        return Ok(Some(DetectResult::opt_out_file_not_found(LOCKFILE)));
    }
    Ok(Some(
        DetectResult::opt_in_file_found(LOCKFILE)
            .with_plans([BuildPlan::default().provide("deps").require("deps")]),
    ))
}

fn build(ctx: &mut Context) -> anyhow::Result<()> {
    let mut layer = ctx.layer("deps", &[LayerOption::Cache, LayerOption::Build])?;
    let lockfile = ctx.app_path(LOCKFILE);
    let (key, hit) = cache::hash_and_check(
        ctx,
        &layer,
        "lock-hash",
        &[CacheInput::files([&lockfile])],
    )?;
    if !hit {
        ctx.clear_layer(&layer)?;
        let marker = layer.path.join("installed");
        let script = format!("cat {} > {}", lockfile.display(), marker.display());
        ctx.exec(
            &["/bin/sh", "-c", script.as_str()],
            ExecOptions::new().user_attribution(),
        )?;
        cache::add(ctx, &mut layer, "lock-hash", key);
    }
    ctx.prepend_path(&layer, EnvScope::Build, "PATH", &layer.path.join("bin").to_string_lossy())?;
    ctx.add_web_process(&["./serve"]);
    Ok(())
}

struct Workspace {
    _root: tempfile::TempDir,
    app: PathBuf,
    bp: PathBuf,
    layers: PathBuf,
    plan: PathBuf,
    output: PathBuf,
}

fn workspace() -> Workspace {
    let root = tempfile::tempdir().unwrap();
    let p = |n: &str| root.path().join(n);
    let ws = Workspace {
        app: p("app"),
        bp: p("bp"),
        layers: p("layers"),
        plan: p("plan.toml"),
        output: p("output"),
        _root: root,
    };
    fs::create_dir_all(&ws.app).unwrap();
    fs::create_dir_all(&ws.bp).unwrap();
    fs::write(
        ws.bp.join("buildpack.toml"),
        "[buildpack]\nid = \"acme/deps\"\nversion = \"1.0.0\"\nname = \"Deps\"\n",
    )
    .unwrap();
    ws
}

fn driver(ws: &Workspace, phase: Phase) -> Driver {
    let dirs = PlatformDirs {
        buildpack_dir: ws.bp.clone(),
        platform_dir: None,
        plan_path: (phase == Phase::Detect).then(|| ws.plan.clone()),
        layers_dir: (phase == Phase::Build).then(|| ws.layers.clone()),
    };
    let config = Config::from_vars([(BUILDER_OUTPUT_ENV, ws.output.to_string_lossy())]).unwrap();
    Driver::new(&ws.app, dirs, config).with_log(BuildLog::capture())
}

fn installed(layers: &Path) -> Option<String> {
    fs::read_to_string(layers.join("deps/installed")).ok()
}

#[cfg(unix)]
#[test]
fn second_build_hits_the_cache() {
    let ws = workspace();
    fs::write(ws.app.join(LOCKFILE), "left-pad 1.3.0\n").unwrap();

    assert_eq!(driver(&ws, Phase::Detect).detect(detect), PASS_STATUS_CODE);
    assert!(fs::read_to_string(&ws.plan).unwrap().contains("deps"));

    let first = driver(&ws, Phase::Build);
    assert_eq!(first.build(build), PASS_STATUS_CODE);
    let log = first.build_log().captured();
    assert!(log.contains("***** CACHE MISS: \"deps\""));
    assert!(log.contains("Running \"/bin/sh -c cat "));
    assert_eq!(installed(&ws.layers).as_deref(), Some("left-pad 1.3.0\n"));
    assert!(ws.layers.join("deps.toml").exists());
    assert!(ws.layers.join("deps/env.build/PATH.prepend").exists());

    let second = driver(&ws, Phase::Build);
    assert_eq!(second.build(build), PASS_STATUS_CODE);
    let log = second.build_log().captured();
    assert!(log.contains("***** CACHE HIT: \"deps\""));
    assert!(!log.contains("Running "));

    let out = OutputFile::new(&ws.output).read().unwrap();
    assert_eq!(out.stats.len(), 2);
    assert!(out.stats.iter().all(|s| s.buildpack_id == "acme/deps"));
}

#[cfg(unix)]
#[test]
fn changed_lockfile_reinstalls() {
    let ws = workspace();
    fs::write(ws.app.join(LOCKFILE), "a 1\n").unwrap();
    assert_eq!(driver(&ws, Phase::Build).build(build), PASS_STATUS_CODE);

    fs::write(ws.app.join(LOCKFILE), "a 2\n").unwrap();
    let again = driver(&ws, Phase::Build);
    assert_eq!(again.build(build), PASS_STATUS_CODE);
    assert!(again.build_log().captured().contains("***** CACHE MISS: \"deps\""));
    assert_eq!(installed(&ws.layers).as_deref(), Some("a 2\n"));
}

#[test]
fn detect_opts_out_without_lockfile() {
    let ws = workspace();
    let d = driver(&ws, Phase::Detect);
    assert_eq!(d.detect(detect), cnbkit_core::FAIL_STATUS_CODE);
    assert!(!ws.plan.exists());
}
