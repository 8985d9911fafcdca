/// Run error taxonomy
///
/// Every way an attempt can end badly is a [`RunError`] variant, and
/// [`classify`] maps each one onto the branch the execution unit takes.

use crate::store::StoreError;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run {run_id} exceeded the maximum number of attempts ({max})")]
    AttemptsExceeded { run_id: Uuid, max: u32 },

    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    #[error("rollback requested: {0}")]
    UserRollback(String),

    #[error("interrupted: {0}")]
    UserInterrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure reported by the sidecar graph server, which already logged detail
    #[error("remote pipeline error: {0}")]
    Remote(String),

    #[error("no pipeline registered for assistant '{0}'")]
    UnknownAssistant(String),

    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),

    #[error(transparent)]
    Pipeline(#[from] anyhow::Error),
}

/// Branch taken by the execution unit for an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Requeue the run as `pending` and propagate the error
    Retriable,
    Fatal,
    Timeout,
    Rollback,
    Interrupt,
}

pub fn classify(err: &RunError) -> ErrorClass {
    match err {
        RunError::Timeout(_) => ErrorClass::Timeout,
        RunError::UserRollback(_) => ErrorClass::Rollback,
        RunError::UserInterrupt(_) => ErrorClass::Interrupt,
        RunError::Store(store_err) if store_err.is_transient() => ErrorClass::Retriable,
        RunError::Http(http_err) if http_err.is_connect() || http_err.is_timeout() => {
            ErrorClass::Retriable
        }
        RunError::AttemptsExceeded { .. }
        | RunError::Store(_)
        | RunError::Remote(_)
        | RunError::UnknownAssistant(_)
        | RunError::Http(_)
        | RunError::Pipeline(_) => ErrorClass::Fatal,
    }
}

impl RunError {
    pub fn class(&self) -> ErrorClass {
        classify(self)
    }

    /// Errors raised on the far side of the remote boundary get a short log line
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_signals_map_to_their_branches() {
        assert_eq!(classify(&RunError::Timeout(Duration::from_secs(1))), ErrorClass::Timeout);
        assert_eq!(classify(&RunError::UserRollback("undo".into())), ErrorClass::Rollback);
        assert_eq!(classify(&RunError::UserInterrupt("wait".into())), ErrorClass::Interrupt);
    }

    #[test]
    fn only_transient_store_errors_are_retriable() {
        let transient = RunError::from(StoreError::Transient("database is locked".into()));
        let corrupt = RunError::from(StoreError::Corrupt("bad row".into()));
        let aborted = RunError::from(StoreError::FailedTransaction("aborted".into()));

        assert_eq!(classify(&transient), ErrorClass::Retriable);
        assert_eq!(classify(&corrupt), ErrorClass::Fatal);
        assert_eq!(classify(&aborted), ErrorClass::Fatal);
    }

    #[test]
    fn unclassified_errors_are_fatal() {
        let ceiling = RunError::AttemptsExceeded {
            run_id: Uuid::new_v4(),
            max: 3,
        };

        assert_eq!(classify(&ceiling), ErrorClass::Fatal);
        assert_eq!(classify(&RunError::UnknownAssistant("nope".into())), ErrorClass::Fatal);
        assert_eq!(classify(&RunError::from(anyhow::anyhow!("boom"))), ErrorClass::Fatal);

        let remote = RunError::Remote("graph failed".into());
        assert_eq!(remote.class(), ErrorClass::Fatal);
        assert!(remote.is_remote());
    }
}
