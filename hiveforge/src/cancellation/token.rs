//! Build interruption flag.

use crate::errors::{BuildError, BuildResult};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Asks a running build to stop before its next stage.
///
/// A stage that is already running finishes first. Only the first reason is
/// kept; later requests are ignored.
#[derive(Debug, Default)]
pub struct CancellationToken {
    reason: Mutex<Option<String>>,
}

impl CancellationToken {
    /// Creates a token that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an interrupt. Returns false if one was already requested.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if let Some(existing) = slot.as_deref() {
            debug!(existing, "Interrupt already requested");
            return false;
        }
        let reason = reason.into();
        warn!(reason = %reason, "Build interrupt requested");
        *slot = Some(reason);
        true
    }

    /// Returns whether an interrupt was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.lock().is_some()
    }

    /// The first interrupt reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Fails with [`BuildError::Cancelled`] once an interrupt was requested.
    pub fn check(&self) -> BuildResult<()> {
        match self.reason() {
            Some(reason) => Err(BuildError::Cancelled(reason)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_untriggered_token_passes_check() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.cancel("SIGINT"));
        assert!(!token.cancel("shutdown"));

        assert_eq!(token.reason(), Some("SIGINT".to_string()));
        let err = token.check().unwrap_err();
        assert!(matches!(err, BuildError::Cancelled(ref r) if r == "SIGINT"));
    }

    #[tokio::test]
    async fn test_cancel_from_another_task() {
        let token = Arc::new(CancellationToken::new());
        let remote = Arc::clone(&token);
        tokio::spawn(async move {
            remote.cancel("ctrl-c");
        })
        .await
        .unwrap();
        assert!(token.is_cancelled());
    }
}
