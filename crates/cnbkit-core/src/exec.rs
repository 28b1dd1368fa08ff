//! Subprocess execution with output capture, attribution and spans.

use crate::context::Context;
use crate::log::BuildLog;
use crate::span::exec_span_name;
use chrono::Utc;
use cnbkit_error::{generate_error_id, BuildError, Status};
use cnbkit_output::{keep_head, keep_tail};
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

const DIVIDER_WIDTH: usize = 80;
const DONE_CMD_LIMIT: usize = 60;

/// Output of a finished command. Every stream is whitespace-trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// `-1` when the child was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Both streams interleaved in arrival order.
    pub combined: String,
}

/// Turns a failed command's output into the error message.
#[derive(Clone, Default)]
pub enum MessageProducer {
    #[default]
    CombinedTail,
    CombinedHead,
    StderrTail,
    StderrHead,
    StdoutTail,
    StdoutHead,
    Custom(Arc<dyn Fn(&ExecResult) -> String + Send + Sync>),
}

impl MessageProducer {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ExecResult) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn produce(&self, result: &ExecResult) -> String {
        match self {
            Self::CombinedTail => keep_tail(&result.combined),
            Self::CombinedHead => keep_head(&result.combined),
            Self::StderrTail => keep_tail(&result.stderr),
            Self::StderrHead => keep_head(&result.stderr),
            Self::StdoutTail => keep_tail(&result.stdout),
            Self::StdoutHead => keep_head(&result.stdout),
            Self::Custom(f) => f(result),
        }
    }
}

impl fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CombinedTail => "CombinedTail",
            Self::CombinedHead => "CombinedHead",
            Self::StderrTail => "StderrTail",
            Self::StderrHead => "StderrHead",
            Self::StdoutTail => "StdoutTail",
            Self::StdoutHead => "StdoutHead",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

/// Per-call settings for [`Context::exec`] and [`Context::exec_with_err`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    env: Vec<String>,
    work_dir: Option<PathBuf>,
    user_failure: bool,
    user_timing: bool,
    producer: MessageProducer,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `KEY=value` variable on top of the inherited environment.
    #[must_use]
    pub fn env(mut self, kv: impl Into<String>) -> Self {
        self.env.push(kv.into());
        self
    }

    #[must_use]
    pub fn envs<I, S>(mut self, kvs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env.extend(kvs.into_iter().map(Into::into));
        self
    }

    /// Defaults to the application root.
    #[must_use]
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Failure and time both count against the user.
    #[must_use]
    pub fn user_attribution(mut self) -> Self {
        self.user_failure = true;
        self.user_timing = true;
        self
    }

    #[must_use]
    pub fn user_timing(mut self) -> Self {
        self.user_timing = true;
        self
    }

    #[must_use]
    pub fn user_failure(mut self) -> Self {
        self.user_failure = true;
        self
    }

    #[must_use]
    pub fn message_producer(mut self, producer: MessageProducer) -> Self {
        self.producer = producer;
        self
    }
}

/// A command that did not succeed.
///
/// `result` is present when the command ran and exited non-zero, and absent
/// when it never started.
#[derive(Debug, thiserror::Error)]
#[error("{}", .error.message)]
pub struct ExecFailure {
    pub result: Option<ExecResult>,
    #[source]
    pub error: BuildError,
}

impl From<ExecFailure> for BuildError {
    fn from(f: ExecFailure) -> Self {
        f.error
    }
}

/// Shared sink for interleaved output. Each write lands whole.
struct CombinedSink {
    buf: Mutex<Vec<u8>>,
    mirror: Option<BuildLog>,
}

impl CombinedSink {
    fn write(&self, chunk: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = &self.mirror {
            log.raw(chunk);
        }
        buf.extend_from_slice(chunk);
    }

    fn into_string(self) -> String {
        let buf = self.buf.into_inner().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).trim().to_owned()
    }
}

fn pump<R: Read>(mut reader: R, own: &mut Vec<u8>, combined: &CombinedSink) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        own.extend_from_slice(&chunk[..n]);
        combined.write(&chunk[..n]);
    }
}

fn trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_owned()
}

fn truncate_for_log(s: &str) -> String {
    if s.len() <= DONE_CMD_LIMIT {
        return s.to_owned();
    }
    let mut end = DONE_CMD_LIMIT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

impl Context {
    /// Run `cmd` and return its result, or the error a failing build should report.
    ///
    /// The partial result of a failed command is dropped. Use
    /// [`exec_with_err`](Self::exec_with_err) to inspect it.
    pub fn exec<S: AsRef<str>>(
        &mut self,
        cmd: &[S],
        opts: ExecOptions,
    ) -> Result<ExecResult, BuildError> {
        self.exec_with_err(cmd, opts).map_err(BuildError::from)
    }

    /// Run `cmd`, keeping the result of a non-zero exit alongside the error.
    ///
    /// The error ID is derived from the command tokens so the same failing
    /// command correlates across builds.
    pub fn exec_with_err<S: AsRef<str>>(
        &mut self,
        cmd: &[S],
        opts: ExecOptions,
    ) -> Result<ExecResult, ExecFailure> {
        let tokens: Vec<&str> = cmd.iter().map(AsRef::as_ref).collect();
        let start = Instant::now();
        let outcome = self.run_command(&tokens, &opts);
        if opts.user_timing {
            self.add_user_time(start.elapsed());
        }

        let (result, cause) = match outcome {
            Ok(result) => return Ok(result),
            Err(failure) => failure,
        };
        let error = match &result {
            None => BuildError::internal(cause),
            Some(r) => {
                let message = opts.producer.produce(r);
                let status = if opts.user_failure {
                    Status::Unknown
                } else {
                    Status::Internal
                };
                BuildError::new(status, message)
            }
        }
        .with_id(generate_error_id(tokens.iter().copied()));
        Err(ExecFailure { result, error })
    }

    fn run_command(
        &mut self,
        tokens: &[&str],
        opts: &ExecOptions,
    ) -> Result<ExecResult, (Option<ExecResult>, String)> {
        let Some((program, args)) = tokens.split_first() else {
            return Err((None, "no command provided".to_owned()));
        };
        if program.is_empty() {
            return Err((None, "empty command provided".to_owned()));
        }

        // System commands stay quiet unless debugging.
        let logging = opts.user_failure || self.is_debug();
        let mut readable = tokens.join(" ");
        if !opts.env.is_empty() {
            readable = format!("{readable} ({})", opts.env.join(" "));
        }
        if logging {
            self.log("-".repeat(DIVIDER_WIDTH));
            self.log(format!("Running {readable:?}"));
        }
        tracing::debug!(cmd = %readable, "exec");

        let span_start = Utc::now();
        let started = Instant::now();
        let outcome = self.spawn_and_wait(program, args, opts, logging, &readable);

        if logging {
            let elapsed = started.elapsed();
            self.log(format!("Done {:?} ({elapsed:?})", truncate_for_log(&readable)));
        }
        let status = match &outcome {
            Ok(r) if r.exit_code == 0 => Status::Ok,
            _ => Status::Internal,
        };
        self.span(exec_span_name(tokens), span_start, status);

        let result = outcome.map_err(|msg| (None, msg))?;
        if result.exit_code != 0 {
            let msg = format!(
                "executing command {readable:?}: exit code {}",
                result.exit_code
            );
            return Err((Some(result), msg));
        }
        Ok(result)
    }

    fn spawn_and_wait(
        &self,
        program: &str,
        args: &[&str],
        opts: &ExecOptions,
        logging: bool,
        readable: &str,
    ) -> Result<ExecResult, String> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(opts.work_dir.as_deref().unwrap_or(self.application_root()))
            .envs(self.env_overrides())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for kv in &opts.env {
            let (k, v) = kv.split_once('=').unwrap_or((kv.as_str(), ""));
            command.env(k, v);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                format!(
                    "executing command {readable:?}: {e}: ensure script does not have CR-LF line endings"
                )
            } else {
                format!("executing command {readable:?}: {e}")
            }
        })?;

        let combined = CombinedSink {
            buf: Mutex::new(Vec::new()),
            mirror: logging.then(|| self.build_log().clone()),
        };
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let out_pipe = child.stdout.take();
        let err_pipe = child.stderr.take();
        let pumped = std::thread::scope(|s| {
            let out = s.spawn(|| match out_pipe {
                Some(p) => pump(p, &mut stdout, &combined),
                None => Ok(()),
            });
            let err = s.spawn(|| match err_pipe {
                Some(p) => pump(p, &mut stderr, &combined),
                None => Ok(()),
            });
            let out = out.join().unwrap_or(Ok(()));
            let err = err.join().unwrap_or(Ok(()));
            out.and(err)
        });

        let status = child
            .wait()
            .map_err(|e| format!("executing command {readable:?}: {e}"))?;
        pumped.map_err(|e| format!("reading output of {readable:?}: {e}"))?;

        Ok(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: trimmed(&stdout),
            stderr: trimmed(&stderr),
            combined: combined.into_string(),
        })
    }
}
