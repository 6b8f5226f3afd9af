//! Diagnostics sink.
//!
//! The controller reports every privilege-relevant decision as a
//! `(Severity, message)` pair. Hosts that have their own error channel
//! implement [`Diagnostics`]; everyone else gets [`LogDiagnostics`].

use std::cell::RefCell;
use std::fmt;

/// How serious a reported event is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Warning,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Debug => "debug",
            Severity::Warning => "warning",
            Severity::Fatal => "fatal",
        })
    }
}

/// Receives `(severity, message)` pairs from the controller
pub trait Diagnostics {
    fn report(&self, severity: Severity, message: &str);
}

/// Forwards diagnostics to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl Diagnostics for LogDiagnostics {
    fn report(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => log::debug!("{}", message),
            Severity::Warning => log::warn!("{}", message),
            Severity::Fatal => log::error!("{}", message),
        }
    }
}

/// Keeps every diagnostic in memory, in order, and also forwards it to `log`.
#[derive(Debug, Default)]
pub struct Recorder {
    entries: RefCell<Vec<(Severity, String)>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Severity, String)> {
        self.entries.borrow().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .borrow()
            .iter()
            .filter(|(s, _)| *s == severity)
            .count()
    }

    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.entries
            .borrow()
            .iter()
            .any(|(s, m)| *s == severity && m.contains(needle))
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

impl Diagnostics for Recorder {
    fn report(&self, severity: Severity, message: &str) {
        LogDiagnostics.report(severity, message);
        self.entries
            .borrow_mut()
            .push((severity, message.to_owned()));
    }
}

impl<D: Diagnostics + ?Sized> Diagnostics for &D {
    fn report(&self, severity: Severity, message: &str) {
        (**self).report(severity, message)
    }
}

impl<D: Diagnostics + ?Sized> Diagnostics for std::rc::Rc<D> {
    fn report(&self, severity: Severity, message: &str) {
        (**self).report(severity, message)
    }
}
