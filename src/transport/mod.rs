//! The transport adapter contract.
//!
//! A [`Transport`] performs the actual network and file I/O for a batch. The
//! coordinator only ever talks to it through handles: it starts every transfer
//! with [`Transport::begin`], samples them with [`Transport::poll`] and releases
//! them with [`Transport::dispose`]. None of these calls may block.

pub mod http;
pub mod scripted;

use std::fmt;
use std::path::PathBuf;

use crate::error::TransportError;

pub use http::HttpTransport;
pub use scripted::ScriptedTransport;

/// Opaque identifier of one transfer inside a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(pub u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TransferStatus {
    /// Done and Failed never change again within a batch.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Done | TransferStatus::Failed)
    }
}

/// What the coordinator asks the transport to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub dest_path: PathBuf,
    /// Expected SHA-256 of the finished file, hex encoded.
    pub sha256: Option<String>,
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub status: TransferStatus,
    pub progress: f32,
    pub error: Option<String>,
}

impl TransferSnapshot {
    pub fn pending() -> Self {
        Self {
            status: TransferStatus::Pending,
            progress: 0.0,
            error: None,
        }
    }

    pub fn in_progress(progress: f32) -> Self {
        Self {
            status: TransferStatus::InProgress,
            progress,
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            status: TransferStatus::Done,
            progress: 1.0,
            error: None,
        }
    }

    pub fn failed(progress: f32, error: impl Into<String>) -> Self {
        Self {
            status: TransferStatus::Failed,
            progress,
            error: Some(error.into()),
        }
    }

    pub(crate) fn unknown_handle(handle: JobHandle) -> Self {
        Self::failed(0.0, format!("unknown transfer handle {}", handle))
    }
}

pub trait Transport: Send + Sync {
    /// Starts every request and returns one handle per request, in order.
    /// An empty slice yields an empty vector.
    fn begin(&self, requests: &[TransferRequest]) -> Result<Vec<JobHandle>, TransportError>;

    /// Non-blocking snapshot. Unknown or disposed handles report `Failed`.
    fn poll(&self, handle: JobHandle) -> TransferSnapshot;

    /// Releases the transfer, cancelling it if still running. Idempotent.
    fn dispose(&self, handle: JobHandle);
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn begin(&self, requests: &[TransferRequest]) -> Result<Vec<JobHandle>, TransportError> {
        (**self).begin(requests)
    }

    fn poll(&self, handle: JobHandle) -> TransferSnapshot {
        (**self).poll(handle)
    }

    fn dispose(&self, handle: JobHandle) {
        (**self).dispose(handle)
    }
}
