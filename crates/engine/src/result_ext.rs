//! Logging helpers for fallible engine operations.
//!
//! Background work (driver tasks, timers, the interrupt consumer) has no
//! caller to return errors to, so failures are logged where they happen.

use std::fmt::Display;
use std::panic::Location;

use tracing::Level;

/// Logs an `Err` with context and the caller's source location.
pub trait ResultExt<T, E> {
    /// Log at error level and hand the result back unchanged.
    ///
    /// ```ignore
    /// use pipeline_engine::result_ext::ResultExt;
    ///
    /// let outcome: Result<(), &str> = Err("store unavailable");
    /// let _ = outcome.log("advancing node");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;

    /// Same as [`ResultExt::log`] at warn level, for failures the caller
    /// falls back from.
    fn warn<S: ToString>(self, context: S) -> Result<T, E>;

    fn log_and_discard<S: ToString>(self, context: S);
}

fn report(level: Level, error: &dyn Display, context: &str, caller: &Location<'_>) {
    let at = format!("{}:{}", caller.file(), caller.line());
    if level == Level::WARN {
        tracing::warn!(target: "pipeline_engine", error = %error, file = %at, context, "Operation failed, continuing");
    } else {
        tracing::error!(target: "pipeline_engine", error = %error, file = %at, context, "Operation failed");
    }
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(e) = &self {
            report(Level::ERROR, e, &context.to_string(), Location::caller());
        }
        self
    }

    #[track_caller]
    fn warn<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(e) = &self {
            report(Level::WARN, e, &context.to_string(), Location::caller());
        }
        self
    }

    #[track_caller]
    fn log_and_discard<S: ToString>(self, context: S) {
        if let Err(e) = &self {
            report(Level::ERROR, e, &context.to_string(), Location::caller());
        }
    }
}
