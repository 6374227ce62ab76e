//! Failure classification
//!
//! Maps a classified [`ErrorKind`] to the recovery the store manager should
//! run. Priority order matters: a corrupt local store fails every cloud
//! attach, so it is rebuilt before any cloud-specific fallback is tried.

use tracing::{debug, warn};

use crate::failure::ErrorKind;

/// What to do about a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Discard the local store and rebuild it empty
    RecreateStore,
    /// Reopen the same local data with cloud options stripped
    RecreateStoreWithoutCloud,
    /// Keep going, show the message
    SurfaceToUser(String),
    /// Benign or duplicate; log only
    Ignore,
}

/// Chooses a [`RecoveryAction`] for an [`ErrorKind`]
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureClassifier;

impl FailureClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure
    pub fn classify(&self, kind: &ErrorKind) -> RecoveryAction {
        let action = match kind {
            ErrorKind::SchemaMigrationFailure => RecoveryAction::RecreateStore,
            ErrorKind::CloudIntegrationUnavailable(_) => RecoveryAction::RecreateStoreWithoutCloud,
            ErrorKind::CloudAccountUnavailable
            | ErrorKind::NetworkFailure
            | ErrorKind::QuotaExceeded => RecoveryAction::SurfaceToUser(kind.user_message()),
            ErrorKind::Unknown(message) => {
                warn!(error = %message, "Ignoring unclassified failure");
                RecoveryAction::Ignore
            }
        };

        debug!(kind = %kind, action = ?action, "Classified failure");
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let classifier = FailureClassifier::new();

        assert_eq!(
            classifier.classify(&ErrorKind::SchemaMigrationFailure),
            RecoveryAction::RecreateStore
        );
        assert_eq!(
            classifier.classify(&ErrorKind::CloudIntegrationUnavailable(
                "requires schema 3".to_string()
            )),
            RecoveryAction::RecreateStoreWithoutCloud
        );
        assert_eq!(
            classifier.classify(&ErrorKind::Unknown("odd".to_string())),
            RecoveryAction::Ignore
        );
    }

    #[test]
    fn test_user_facing_failures_carry_message() {
        let classifier = FailureClassifier::new();

        for kind in [
            ErrorKind::CloudAccountUnavailable,
            ErrorKind::NetworkFailure,
            ErrorKind::QuotaExceeded,
        ] {
            match classifier.classify(&kind) {
                RecoveryAction::SurfaceToUser(message) => {
                    assert_eq!(message, kind.user_message())
                }
                other => panic!("expected SurfaceToUser for {kind}, got {other:?}"),
            }
        }
    }
}
