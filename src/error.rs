//! Error kinds shared by the whole sweep pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad window/detrend name or out-of-range numeric argument.
    /// Raised before any hardware interaction.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Tune, read or stream start/stop failure
    #[error("device error: {0}")]
    Device(String),
    /// A hop was finalized without a single accumulated segment
    #[error("PSD finalized before any segment was accumulated")]
    IncompletePsd,
    #[error("write error: {0}")]
    Write(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(String),
    /// A worker task panicked or its executor went away
    #[error("worker task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::InvalidParameter(msg.into()))
}
