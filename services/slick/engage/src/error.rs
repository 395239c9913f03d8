//! Facade error types.

use crate::http::HttpError;
use slick_session::{RequestError, SessionError};
use slick_storage::StorageError;
use thiserror::Error;

/// Failures surfaced by the engagement facade
#[derive(Error, Debug)]
pub enum EngageError {
    /// The session could not be established or resumed
    #[error(transparent)]
    Session(#[from] SessionError),
    /// A domain request failed
    #[error(transparent)]
    Request(#[from] RequestError),
    /// Reader identity or navigation state could not be read or written
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The teardown POST failed
    #[error(transparent)]
    Http(#[from] HttpError),
}
