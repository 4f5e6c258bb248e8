use crate::errors::domain::{classify_io_error, DomainError, ErrorCode, IoErrorHint};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorCode {
    NotFound,
    PermissionDenied,
    Io,
    InvalidSeek,
    Disconnected,
}

impl ErrorCode for RemoteErrorCode {
    fn as_code_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Io => "io_error",
            Self::InvalidSeek => "invalid_seek",
            Self::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteError {
    code: RemoteErrorCode,
    message: String,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_io_error(context: &str, error: std::io::Error) -> Self {
        let code = match classify_io_error(&error) {
            IoErrorHint::NotFound => RemoteErrorCode::NotFound,
            IoErrorHint::PermissionDenied => RemoteErrorCode::PermissionDenied,
            IoErrorHint::InvalidInput => RemoteErrorCode::InvalidSeek,
            _ => RemoteErrorCode::Io,
        };
        Self::new(code, format!("{context}: {error}"))
    }

    pub fn code(&self) -> RemoteErrorCode {
        self.code
    }

    /// Transient failures are worth one reconnect; missing or inaccessible
    /// paths are not.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, RemoteErrorCode::Io | RemoteErrorCode::Disconnected)
    }

    pub(crate) fn into_io_error(self) -> std::io::Error {
        let kind = match self.code {
            RemoteErrorCode::NotFound => std::io::ErrorKind::NotFound,
            RemoteErrorCode::PermissionDenied => std::io::ErrorKind::PermissionDenied,
            RemoteErrorCode::InvalidSeek => std::io::ErrorKind::InvalidInput,
            RemoteErrorCode::Io | RemoteErrorCode::Disconnected => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, self)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

impl DomainError for RemoteError {
    fn code_str(&self) -> &'static str {
        self.code.as_code_str()
    }

    fn message(&self) -> &str {
        &self.message
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;
