//! Logging sink used by the server runtime.
//!
//! The runtime logs through [`Logger`] so embedders can route its output
//! anywhere. [`NoopLogger`] is the default; [`TracingLogger`] forwards to
//! `tracing`.

use std::fmt::{self, Display};

/// Key/value pairs attached to a log record.
pub type Fields<'a> = &'a [(&'a str, &'a dyn Display)];

/// Four-level structured logging sink.
pub trait Logger: Send + Sync {
    fn debug(&self, msg: &str, fields: Fields<'_>);
    fn info(&self, msg: &str, fields: Fields<'_>);
    fn warn(&self, msg: &str, fields: Fields<'_>);
    fn error(&self, msg: &str, fields: Fields<'_>);
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn debug(&self, _: &str, _: Fields<'_>) {}
    fn info(&self, _: &str, _: Fields<'_>) {}
    fn warn(&self, _: &str, _: Fields<'_>) {}
    fn error(&self, _: &str, _: Fields<'_>) {}
}

/// Forwards records to `tracing`, rendering fields as `key=value` pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, msg: &str, fields: Fields<'_>) {
        tracing::debug!(fields = %DisplayFields(fields), "{}", msg);
    }

    fn info(&self, msg: &str, fields: Fields<'_>) {
        tracing::info!(fields = %DisplayFields(fields), "{}", msg);
    }

    fn warn(&self, msg: &str, fields: Fields<'_>) {
        tracing::warn!(fields = %DisplayFields(fields), "{}", msg);
    }

    fn error(&self, msg: &str, fields: Fields<'_>) {
        tracing::error!(fields = %DisplayFields(fields), "{}", msg);
    }
}

/// Renders fields as space-separated `key=value` pairs.
pub struct DisplayFields<'a>(pub Fields<'a>);

impl Display for DisplayFields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}
