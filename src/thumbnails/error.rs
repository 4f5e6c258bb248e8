use crate::errors::domain::{classify_io_error, DomainError, ErrorCode, IoErrorHint};
use crate::remote::RemoteError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailErrorCode {
    Transport,
    UnsupportedFormat,
    CorruptData,
    ResourceExhaustion,
}

impl ErrorCode for ThumbnailErrorCode {
    fn as_code_str(self) -> &'static str {
        match self {
            Self::Transport => "transport_error",
            Self::UnsupportedFormat => "unsupported_format",
            Self::CorruptData => "corrupt_data",
            Self::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

/// Why one thumbnail request produced nothing. Never escapes the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailError {
    code: ThumbnailErrorCode,
    message: String,
}

impl ThumbnailError {
    pub fn new(code: ThumbnailErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ThumbnailErrorCode::Transport, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ThumbnailErrorCode::UnsupportedFormat, message)
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ThumbnailErrorCode::CorruptData, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ThumbnailErrorCode::ResourceExhaustion, message)
    }

    pub fn code(&self) -> ThumbnailErrorCode {
        self.code
    }

    /// Maps an I/O error raised while a decoder pulled bytes from the device.
    pub fn from_io_error(context: &str, error: std::io::Error) -> Self {
        let code = match classify_io_error(&error) {
            IoErrorHint::OutOfMemory => ThumbnailErrorCode::ResourceExhaustion,
            IoErrorHint::UnexpectedEof | IoErrorHint::InvalidInput => {
                ThumbnailErrorCode::CorruptData
            }
            _ => ThumbnailErrorCode::Transport,
        };
        Self::new(code, format!("{context}: {error}"))
    }

    pub fn from_image_error(error: image::ImageError) -> Self {
        use image::ImageError;
        match error {
            ImageError::Unsupported(e) => Self::unsupported(format!("Unsupported image: {e}")),
            ImageError::Limits(e) => Self::exhausted(format!("Image exceeds decode limits: {e}")),
            ImageError::IoError(e) => Self::from_io_error("Image read failed", e),
            other => Self::corrupt(format!("Decode failed: {other}")),
        }
    }
}

impl From<RemoteError> for ThumbnailError {
    fn from(error: RemoteError) -> Self {
        Self::transport(error.to_string())
    }
}

impl fmt::Display for ThumbnailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ThumbnailError {}

impl DomainError for ThumbnailError {
    fn code_str(&self) -> &'static str {
        self.code.as_code_str()
    }

    fn message(&self) -> &str {
        &self.message
    }
}
