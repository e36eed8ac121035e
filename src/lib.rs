pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hashing;
pub mod logging;
pub mod transport;
pub mod utils;

pub use coordinator::{
    BatchSummary, Coordinator, CoordinatorConfig, CoordinatorState, DownloadItem, DownloadJob,
};
pub use error::{CoordinatorError, TransportError};
pub use transport::{JobHandle, TransferRequest, TransferSnapshot, TransferStatus, Transport};
