use thiserror::Error;

use crate::bus::BusError;

/// Errors surfaced by the registry and the BlueZ objects it hands out.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Does not exist: {0}")]
    DoesNotExist(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Operation already in progress: {0}")]
    InProgress(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("D-Bus error: {0}")]
    Bus(BusError),
}

pub type Result<T> = std::result::Result<T, Error>;

// BlueZ reports its own failures as org.bluez.Error.* names; anything
// else stays a raw bus error.
impl From<BusError> for Error {
    fn from(err: BusError) -> Self {
        let Some(kind) = err
            .name
            .as_deref()
            .and_then(|name| name.strip_prefix("org.bluez.Error."))
        else {
            return Error::Bus(err);
        };

        match kind {
            "DoesNotExist" => Error::DoesNotExist(err.message),
            "AlreadyExists" => Error::AlreadyExists(err.message),
            "InvalidArguments" => Error::InvalidArguments(err.message),
            "NotReady" => Error::NotReady(err.message),
            "NotSupported" => Error::NotSupported(err.message),
            "NotAuthorized" => Error::NotAuthorized(err.message),
            "InProgress" => Error::InProgress(err.message),
            "Failed" => Error::Failed(err.message),
            _ => Error::Bus(err),
        }
    }
}
