//! Error types for the service pool

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No Tokio runtime available to host expiry monitors")]
    NoRuntime,

    #[error("Pool has been shut down")]
    ShutDown,

    #[error("Released more references than were acquired for key `{0}`")]
    ReleaseUnderflow(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
