//! Facade errors.

use harbor_coord::CoordError;
use harbor_model::ErrorKind;
use harbor_state::CatalogError;
use thiserror::Error;

/// Result type alias for facade operations.
pub type FacadeResult<T> = Result<T, FacadeError>;

/// Errors surfaced to RPC callers.
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl FacadeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FacadeError::Catalog(err) => err.kind(),
            FacadeError::Coord(err) => err.kind(),
            FacadeError::NotFound(_) => ErrorKind::NotFound,
            FacadeError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FacadeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FacadeError::Precondition(_) => ErrorKind::PreconditionFailed,
        }
    }
}
