mod entrypoint;

use clap::Parser;
use cnbkit_core::config::{parse_bool, DEBUG_ENV};
use cnbkit_core::Registry;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cnbkit-runner",
    version,
    about = "Run the detect or build phase of a registered buildpack"
)]
struct Cli {
    /// ID of the buildpack to run (e.g. google.config.entrypoint).
    #[arg(long, default_value = "")]
    buildpack: String,

    /// Phase to run: 'detect' or 'build'.
    #[arg(long, default_value = "")]
    phase: String,

    /// Platform arguments, passed through to the phase.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn registry() -> Registry {
    Registry::from([(entrypoint::ID.to_owned(), entrypoint::BUILDPACK)])
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let debug = std::env::var(DEBUG_ENV)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(false);
    let default_level = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CNBKIT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(buildpack = %cli.buildpack, phase = %cli.phase, "runner starting");
    cnbkit_core::main_runner(&registry(), &cli.buildpack, &cli.phase, &cli.args)
}
