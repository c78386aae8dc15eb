//! Error and diagnostic types for the middle-end.
//!
//! Three error kinds exist: `User` rejects the input program, `Internal`
//! reports a broken compiler invariant, and `Temporary` reports a reachable
//! but unimplemented path. All three abort the pipeline; warnings are
//! accumulated in a [`DiagnosticSink`] and never abort.

use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    User,
    Internal,
    Temporary,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::User => write!(f, "error"),
            Severity::Internal => write!(f, "internal error"),
            Severity::Temporary => write!(f, "temporary assumption broken"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompilerError {
    /// The input program is rejected.
    #[error("error in {origin}: {message}")]
    User { message: String, origin: String },

    /// A compiler invariant does not hold.
    #[error("internal error at {file}:{line}: {message}")]
    Internal {
        message: String,
        file: &'static str,
        line: u32,
    },

    /// A reachable path that is not implemented yet.
    #[error("temporary assumption broken at {file}:{line}: {message}")]
    Temporary {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl CompilerError {
    pub fn severity(&self) -> Severity {
        match self {
            CompilerError::User { .. } => Severity::User,
            CompilerError::Internal { .. } => Severity::Internal,
            CompilerError::Temporary { .. } => Severity::Temporary,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;

/// Build a `CompilerError::User` for the given origin (usually the function
/// being lowered).
#[macro_export]
macro_rules! user_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::User {
            message: format!($($arg)*),
            origin: $origin.to_string(),
        }
    };
}

/// Build a `CompilerError::Internal` carrying the detection site.
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Internal {
            message: format!($($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// Build a `CompilerError::Temporary` carrying the detection site.
#[macro_export]
macro_rules! temporary_error {
    ($($arg:tt)*) => {
        $crate::error::CompilerError::Temporary {
            message: format!($($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// One diagnostic record: severity, origin, message, plus the warning bit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    pub severity: Severity,
    pub origin: String,
    pub message: String,
    pub warning: bool,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.warning {
            write!(f, "warning in {}: {}", self.origin, self.message)
        } else {
            write!(f, "{} in {}: {}", self.severity, self.origin, self.message)
        }
    }
}

/// Ordered, deduplicated diagnostic accumulator.
///
/// Owned by the pipeline driver and threaded into passes explicitly;
/// append-only until drained at a pass boundary.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    records: Vec<Diagnostic>,
    seen: HashSet<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, diagnostic: Diagnostic) {
        if self.seen.insert(diagnostic.clone()) {
            self.records.push(diagnostic);
        }
    }

    pub fn warn(&mut self, origin: impl Into<String>, message: impl Into<String>) {
        self.report(Diagnostic {
            severity: Severity::User,
            origin: origin.into(),
            message: message.into(),
            warning: true,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records.iter()
    }

    /// Take the accumulated records, leaving the sink empty.
    pub fn drain(&mut self) -> Vec<Diagnostic> {
        self.seen.clear();
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_deduplicates_and_preserves_order() {
        let mut sink = DiagnosticSink::new();
        sink.warn("f", "first");
        sink.warn("f", "second");
        sink.warn("f", "first");

        let records = sink.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "first");
        assert_eq!(records[1].message, "second");
        assert!(sink.is_empty());
    }

    #[test]
    fn error_macros_carry_site() {
        let err = internal_error!("bad {}", "invariant");
        match err {
            CompilerError::Internal { message, file, .. } => {
                assert_eq!(message, "bad invariant");
                assert!(file.ends_with("error.rs"));
            }
            _ => panic!("expected internal error"),
        }
        assert_eq!(temporary_error!("x").severity(), Severity::Temporary);
        assert_eq!(user_error!("main", "x").severity(), Severity::User);
    }
}
