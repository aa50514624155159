// projectbackup/src/reporter.rs
//! Progress and failure reporting for a backup run.
//!
//! Stages never print directly; they talk to whatever `Reporter` the caller
//! handed to the orchestrator.

/// Receives human-readable progress from the backup stages.
pub trait Reporter: Send + Sync {
    fn info(&self, stage: &str, message: &str);
    fn warn(&self, stage: &str, message: &str);
    fn error(&self, stage: &str, message: &str);
}

/// Forwards everything to `tracing` with the stage as a structured field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn info(&self, stage: &str, message: &str) {
        tracing::info!(stage, "{message}");
    }

    fn warn(&self, stage: &str, message: &str) {
        tracing::warn!(stage, "{message}");
    }

    fn error(&self, stage: &str, message: &str) {
        tracing::error!(stage, "{message}");
    }
}

/// Discards all output.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

#[cfg(test)]
impl Reporter for NullReporter {
    fn info(&self, _stage: &str, _message: &str) {}
    fn warn(&self, _stage: &str, _message: &str) {}
    fn error(&self, _stage: &str, _message: &str) {}
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Keeps every message in memory, mainly for assertions in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CapturingReporter {
    entries: std::sync::Mutex<Vec<(Level, String, String)>>,
}

#[cfg(test)]
impl CapturingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, level: Level, stage: &str, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((level, stage.to_string(), message.to_string()));
        }
    }

    /// Messages logged at `level`, in order.
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(l, _, _)| *l == level)
                    .map(|(_, _, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stages that reported at least one error.
    pub fn error_stages(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(l, _, _)| *l == Level::Error)
                    .map(|(_, s, _)| s.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl Reporter for CapturingReporter {
    fn info(&self, stage: &str, message: &str) {
        self.push(Level::Info, stage, message);
    }

    fn warn(&self, stage: &str, message: &str) {
        self.push(Level::Warn, stage, message);
    }

    fn error(&self, stage: &str, message: &str) {
        self.push(Level::Error, stage, message);
    }
}
