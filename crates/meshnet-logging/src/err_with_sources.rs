use std::error::Error;
use std::fmt;

/// Wraps an [`Error`] so its `Display` impl prints the full causal chain,
/// `error: source1: source2: ...`, instead of just the top-level message.
///
/// Used at task boundaries so a single `tracing::warn!` / `error!` call
/// captures the whole chain (spec.md §10: log once, with full context, at
/// the boundary where the error stops propagating).
pub struct ErrorWithSources<'a>(&'a dyn Error);

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub fn err_with_src(err: &dyn Error) -> ErrorWithSources<'_> {
    ErrorWithSources(err)
}
