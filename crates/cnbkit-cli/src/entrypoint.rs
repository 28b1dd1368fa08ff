//! `google.config.entrypoint`: the launch entrypoint from `GOOGLE_ENTRYPOINT`
//! or a `Procfile`.

use cnbkit_core::config::ENTRYPOINT_ENV;
use cnbkit_core::{fsutil, Buildpack, Context, DetectResult, ProcessOptions, WEB_PROCESS};
use cnbkit_error::{internal_error, user_error, BuildError};
use regex::Regex;
use std::collections::BTreeSet;

pub const ID: &str = "google.config.entrypoint";

pub const BUILDPACK: Buildpack = Buildpack { detect, build };

const PROCFILE: &str = "Procfile";
const PROCESS_PATTERN: &str = r"(?m)^(\w+):\s*(.+)$";

const WEB_OPTIONS: ProcessOptions = ProcessOptions {
    direct: false,
    default: true,
};

fn entrypoint(ctx: &Context) -> Option<String> {
    ctx.getenv(ENTRYPOINT_ENV)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn detect(ctx: &mut Context) -> anyhow::Result<Option<DetectResult>> {
    if let Some(ep) = entrypoint(ctx) {
        return Ok(Some(DetectResult::opt_in_env_set(ENTRYPOINT_ENV, &ep)));
    }
    if ctx.app_file_exists(PROCFILE)? {
        return Ok(Some(DetectResult::opt_in_file_found(PROCFILE)));
    }
    Ok(Some(DetectResult::opt_out(format!(
        "{ENTRYPOINT_ENV} not set and {PROCFILE} not found"
    ))))
}

fn build(ctx: &mut Context) -> anyhow::Result<()> {
    if let Some(ep) = entrypoint(ctx) {
        ctx.log(format!("Using entrypoint from {ENTRYPOINT_ENV}: {ep}"));
        ctx.add_process(WEB_PROCESS, &[ep], WEB_OPTIONS);
        return Ok(());
    }
    let content = fsutil::read_to_string(&ctx.app_path(PROCFILE))?;
    add_procfile_processes(ctx, &content)?;
    Ok(())
}

/// Declare one process per `name: command` line; the first of each name wins.
fn add_procfile_processes(ctx: &mut Context, content: &str) -> Result<(), BuildError> {
    let re = Regex::new(PROCESS_PATTERN)
        .map_err(|e| internal_error!("compiling Procfile pattern: {e}"))?;

    let mut found = BTreeSet::new();
    for caps in re.captures_iter(content) {
        let (_, [name, command]) = caps.extract();
        let command = command.trim();
        if !found.insert(name) {
            ctx.warn(format!("Skipping duplicate {WEB_PROCESS} process: {command}"));
            continue;
        }
        if name == WEB_PROCESS {
            ctx.log(format!("Using entrypoint from Procfile: {command}"));
            ctx.add_process(name, &[command], WEB_OPTIONS);
        } else {
            ctx.add_process(name, &[command], ProcessOptions::default());
        }
    }

    if found.is_empty() {
        return Err(user_error!("did not find any processes in Procfile"));
    }
    if !found.contains(WEB_PROCESS) {
        return Err(user_error!("web process not found in Procfile"));
    }
    Ok(())
}
