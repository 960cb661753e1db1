//! Suppression of repeated error messages.
//!
//! A store that is down fails every poll with the same error. Background
//! loops report failures through an [`ErrorLogGate`], which logs the first
//! occurrence of a message and only counts identical repeats. The count is
//! flushed when the message changes or the loop recovers.
//!
//! Transient failures (a dropped connection, a server still loading) are
//! logged at `warn`; anything else at `error`.

use tracing::{error, info, warn};

/// What the gate decided for a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// First occurrence (or a new message): logged.
    Logged,
    /// Same message as the previous report: counted, not logged.
    Suppressed,
}

/// Per-loop de-duplicating error logger.
#[derive(Debug)]
pub struct ErrorLogGate {
    component: &'static str,
    last_message: Option<String>,
    suppressed: u64,
}

impl ErrorLogGate {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            last_message: None,
            suppressed: 0,
        }
    }

    /// Report an error, logging it unless it repeats the previous one.
    pub fn report(&mut self, message: impl Into<String>) -> GateDecision {
        self.report_with(message.into(), false)
    }

    /// Report an error expected to clear on its own.
    pub fn report_transient(&mut self, message: impl Into<String>) -> GateDecision {
        self.report_with(message.into(), true)
    }

    fn report_with(&mut self, message: String, transient: bool) -> GateDecision {
        if self.last_message.as_deref() == Some(message.as_str()) {
            self.suppressed += 1;
            return GateDecision::Suppressed;
        }

        self.flush_suppressed();
        if transient {
            warn!(component = self.component, error = %message, "Background loop error, retrying");
        } else {
            error!(component = self.component, error = %message, "Background loop error");
        }
        self.last_message = Some(message);
        GateDecision::Logged
    }

    /// Mark the loop healthy again. Logs recovery if an error was active.
    pub fn recovered(&mut self) {
        if self.last_message.is_some() {
            self.flush_suppressed();
            info!(component = self.component, "Background loop recovered");
            self.last_message = None;
        }
    }

    /// Number of repeats swallowed since the last logged message.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    fn flush_suppressed(&mut self) {
        if self.suppressed > 0 {
            error!(
                component = self.component,
                repeats = self.suppressed,
                error = self.last_message.as_deref().unwrap_or_default(),
                "Previous error repeated"
            );
            self.suppressed = 0;
        }
    }
}
