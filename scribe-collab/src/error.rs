//! Top-level error for starting and running a server.

use crate::bus::BusError;
use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
