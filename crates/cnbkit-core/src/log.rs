use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

/// Destination for the human-readable build log.
///
/// Lines written here are part of the buildpack's user-facing contract
/// (`Failure: ...`, `***** CACHE HIT: ...`, subprocess output), unlike
/// `tracing` diagnostics. Clones share one sink, which lets the exec reader
/// threads mirror child output while the context keeps logging.
#[derive(Debug, Clone)]
pub struct BuildLog {
    sink: Arc<Mutex<Sink>>,
}

#[derive(Debug)]
enum Sink {
    Stderr,
    Capture(Vec<u8>),
}

impl Default for BuildLog {
    fn default() -> Self {
        Self::stderr()
    }
}

impl BuildLog {
    pub fn stderr() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Stderr)),
        }
    }

    /// An in-memory log, read back with [`captured`](Self::captured).
    pub fn capture() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Capture(Vec::new()))),
        }
    }

    pub fn line(&self, msg: &str) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *sink {
            Sink::Stderr => {
                let _ = writeln!(std::io::stderr().lock(), "{msg}");
            }
            Sink::Capture(buf) => {
                buf.extend_from_slice(msg.as_bytes());
                buf.push(b'\n');
            }
        }
    }

    /// Write bytes as-is, without adding a newline.
    pub fn raw(&self, bytes: &[u8]) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *sink {
            Sink::Stderr => {
                let _ = std::io::stderr().lock().write_all(bytes);
            }
            Sink::Capture(buf) => buf.extend_from_slice(bytes),
        }
    }

    /// Everything written so far; empty for the stderr sink.
    pub fn captured(&self) -> String {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match &*sink {
            Sink::Stderr => String::new(),
            Sink::Capture(buf) => String::from_utf8_lossy(buf).into_owned(),
        }
    }
}
