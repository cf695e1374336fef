use std::sync::Arc;

use oci_spec::OciSpecError;
use reqwest::StatusCode;

/// Crate-wide error type. Operations either return one of the sentinel
/// variants directly or wrap one; [`Error::kind`] sees through the wrapping
/// so callers can always match on [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("digest mismatch: expected {expected} got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("size mismatch: expected {expected} got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("registry does not support the referrers api")]
    ReferrersUnsupported,
    #[error("manifest does not have exactly one index layer")]
    MissingIndex,
    #[error("manifest does not have exactly one data layer")]
    MissingData,
    #[error("server does not support range requests")]
    RangeNotSupported,
    #[error("remote content changed while the source was open")]
    ContentChanged,
    #[error("credential store is static")]
    StaticCredentialStore,
    #[error("credential does not form a valid header value")]
    BadCredential,
    #[error("no cache directory configured")]
    NoCacheDir,
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    OciSpec(#[from] OciSpecError),
    #[error("errno: {0}")]
    Errno(#[from] rustix::io::Errno),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{reference}: {source}")]
    Context {
        reference: String,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Shared(#[from] Arc<Error>),
}

/// Flat classifier for the sentinel variants of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Forbidden,
    InvalidReference,
    InvalidDescriptor,
    InvalidManifest,
    DigestMismatch,
    SizeMismatch,
    ReferrersUnsupported,
    MissingIndex,
    MissingData,
    RangeNotSupported,
    ContentChanged,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::Forbidden => ErrorKind::Forbidden,
            Error::InvalidReference(_) => ErrorKind::InvalidReference,
            Error::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Error::InvalidManifest(_) => ErrorKind::InvalidManifest,
            Error::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Error::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Error::ReferrersUnsupported => ErrorKind::ReferrersUnsupported,
            Error::MissingIndex => ErrorKind::MissingIndex,
            Error::MissingData => ErrorKind::MissingData,
            Error::RangeNotSupported => ErrorKind::RangeNotSupported,
            Error::ContentChanged => ErrorKind::ContentChanged,
            Error::Context { source, .. } => source.kind(),
            Error::Shared(inner) => inner.kind(),
            _ => ErrorKind::Other,
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// Maps a response status to the taxonomy. Statuses without a sentinel
    /// pass through as [`Error::Status`].
    pub(crate) fn from_status(status: StatusCode) -> Error {
        match status {
            StatusCode::NOT_FOUND => Error::NotFound,
            StatusCode::UNAUTHORIZED => Error::Unauthorized,
            StatusCode::FORBIDDEN => Error::Forbidden,
            status => Error::Status(status),
        }
    }

    /// Attaches the reference being accessed to the error message, keeping
    /// the root cause reachable for [`Error::kind`].
    pub(crate) fn with_reference(self, reference: impl std::fmt::Display) -> Error {
        Error::Context {
            reference: reference.to_string(),
            source: Box::new(self),
        }
    }
}
