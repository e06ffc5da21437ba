use thiserror::Error;

/// An invariant of the agent has been broken
///
/// This is never retried by any of the loops and is expected to make it to
/// the process boundary.
#[derive(Debug, Error)]
#[error("internal inconsistency: {0}")]
pub struct InternalInconsistency(String);

impl InternalInconsistency {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        self.0.as_str()
    }
}
