//! The reconcile seam between the dispatcher and business logic
//!
//! Business logic lives behind [`Reconciler`]; the dispatcher only interprets
//! its outcome.

use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::key::EntityKey;
use crate::Error;

/// What to do with a key after a successful reconcile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing to do until the next relevant change event
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Look at the key again after `duration`, even without events
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Requested recheck delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Reconciles one entity
///
/// Errors for which [`Error::is_retryable`] is true are retried with backoff;
/// every other error is terminal for this round.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Converge the entity named by `key` towards its desired state
    async fn reconcile(&self, key: &EntityKey) -> Result<Action, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn await_change_has_no_requeue() {
        assert_eq!(Action::await_change().requeue_after(), None);
        assert_eq!(Action::default(), Action::await_change());
    }

    #[test]
    fn requeue_keeps_duration() {
        let action = Action::requeue(Duration::from_secs(60));
        assert_eq!(action.requeue_after(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn mock_reconciler_returns_configured_outcome() {
        let mut mock = MockReconciler::new();
        mock.expect_reconcile()
            .withf(|key| key.name == "east-1")
            .returning(|_| Ok(Action::await_change()));

        let action = mock
            .reconcile(&EntityKey::cluster_scoped("east-1"))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }
}
