use thiserror::Error;

use crate::coordinator::CoordinatorState;

/// Usage and contract failures reported by [`crate::coordinator::Coordinator`].
///
/// None of these leave the coordinator half-mutated: when one is returned the
/// state, progress and job set are exactly what they were before the call.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("can't start download, current state is {0:?} (expected Idle)")]
    NotIdle(CoordinatorState),

    #[error("can't start download, url list is empty")]
    EmptyBatch,

    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("transport refused batch: {0}")]
    Transport(#[from] TransportError),

    /// The adapter broke its one-handle-per-request promise.
    #[error("transport returned {actual} handles for {expected} requests")]
    AdapterContract { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no tokio runtime available to run transfers")]
    NoRuntime,

    #[error("malformed transfer request for {url:?}: {reason}")]
    InvalidRequest { url: String, reason: String },

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}
