use crate::errors::domain::{DomainError, ErrorCode};
use crate::remote::{RemoteError, RemoteErrorCode};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogErrorCode {
    AlbumNotFound,
    ListingFailed,
    WorkerPool,
}

impl ErrorCode for CatalogErrorCode {
    fn as_code_str(self) -> &'static str {
        match self {
            Self::AlbumNotFound => "album_not_found",
            Self::ListingFailed => "listing_failed",
            Self::WorkerPool => "worker_pool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogError {
    code: CatalogErrorCode,
    message: String,
}

impl CatalogError {
    pub fn new(code: CatalogErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> CatalogErrorCode {
        self.code
    }

    /// Album lookup failed: a missing or inaccessible album is reported as
    /// not found, anything else as a listing failure.
    pub(crate) fn from_album_stat(album: &str, error: RemoteError) -> Self {
        let code = match error.code() {
            RemoteErrorCode::NotFound | RemoteErrorCode::PermissionDenied => {
                CatalogErrorCode::AlbumNotFound
            }
            _ => CatalogErrorCode::ListingFailed,
        };
        Self::new(code, format!("Cannot open album {album}: {error}"))
    }

    pub(crate) fn listing_failed(album: &str, error: RemoteError) -> Self {
        Self::new(
            CatalogErrorCode::ListingFailed,
            format!("Failed to list album {album}: {error}"),
        )
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CatalogError {}

impl DomainError for CatalogError {
    fn code_str(&self) -> &'static str {
        self.code.as_code_str()
    }

    fn message(&self) -> &str {
        &self.message
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;
