//! The user-visible job log.
//!
//! Everything a job prints flows through the redactor mux; the logger
//! is the runtime's own voice on that same stream: phase headers,
//! warnings, and errors. Errors are preceded by the `^^^ +++` expand
//! marker so CI UIs unfold the failing section by default.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Sink for runtime-generated log lines.
pub trait JobLogger: Send {
    /// A phase header, rendered as a `--- name` group line.
    fn header(&mut self, msg: &str);
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    /// An error surfaced to the user; emits the expand marker first.
    fn error(&mut self, msg: &str);
}

/// Logger writing group-formatted lines to any writer, typically a
/// redacted stream.
pub struct WriterLogger<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> WriterLogger<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> JobLogger for WriterLogger<W> {
    fn header(&mut self, msg: &str) {
        let _ = writeln!(self.out, "--- {msg}");
    }

    fn info(&mut self, msg: &str) {
        let _ = writeln!(self.out, "{msg}");
    }

    fn warn(&mut self, msg: &str) {
        let _ = writeln!(self.out, "⚠️ {msg}");
    }

    fn error(&mut self, msg: &str) {
        let _ = writeln!(self.out, "^^^ +++");
        let _ = writeln!(self.out, "🚨 {msg}");
    }
}

/// In-memory logger for tests and embedders that inspect the log.
#[derive(Clone, Default)]
pub struct MemoryLogger {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("logger poisoned").clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl JobLogger for MemoryLogger {
    fn header(&mut self, msg: &str) {
        self.lines
            .lock()
            .expect("logger poisoned")
            .push(format!("--- {msg}"));
    }

    fn info(&mut self, msg: &str) {
        self.lines
            .lock()
            .expect("logger poisoned")
            .push(msg.to_string());
    }

    fn warn(&mut self, msg: &str) {
        self.lines
            .lock()
            .expect("logger poisoned")
            .push(format!("warn: {msg}"));
    }

    fn error(&mut self, msg: &str) {
        let mut lines = self.lines.lock().expect("logger poisoned");
        lines.push("^^^ +++".to_string());
        lines.push(format!("error: {msg}"));
    }
}
