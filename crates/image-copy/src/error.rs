//! Error types shared by transports, the blob session and the orchestrator.
use std::fmt;

use oci_distribution::errors::OciDistributionError;
use thiserror::Error;

use crate::compression::CompressionError;
use crate::credentials::CredentialProviderError;
use crate::digest::Digest;
use crate::reference::ParseError;

/// Failures reported by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The backend refused our credentials (HTTP 401/403).
    ///
    /// This is recoverable: dropping the cached credentials for `host` and
    /// trying again may succeed.
    #[error("authentication required for {host}")]
    AuthRequired {
        /// Host whose credentials were refused
        host: String,
    },
    /// The backend could not be reached or set up.
    #[error("cannot connect to {target}: {reason}")]
    Connect {
        /// What we tried to reach
        target: String,
        /// Why it failed
        reason: String,
    },
    /// The manifest, blob or file does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The registry answered with an error.
    #[error(transparent)]
    Registry(OciDistributionError),
    /// Local I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Credentials could not be obtained.
    #[error(transparent)]
    Credentials(#[from] CredentialProviderError),
    /// The transport cannot do what was asked.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Stored data is malformed.
    #[error("invalid data: {0}")]
    Invalid(String),
}

impl TransportError {
    /// Converts a wire level error, turning refusals into
    /// [`TransportError::AuthRequired`] for `host`.
    pub fn from_registry(host: &str, err: OciDistributionError) -> Self {
        match err {
            OciDistributionError::Unauthorized { .. } => TransportError::AuthRequired {
                host: host.to_owned(),
            },
            OciDistributionError::NotFound(url) => TransportError::NotFound(url),
            OciDistributionError::RequestError(e) if e.is_connect() || e.is_timeout() => {
                TransportError::Connect {
                    target: host.to_owned(),
                    reason: e.to_string(),
                }
            }
            other => TransportError::Registry(other),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Invalid(e.to_string())
    }
}

/// Failures while moving a single blob.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The bytes read do not hash to the descriptor's digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest named by the descriptor
        expected: Digest,
        /// Digest of the bytes actually read
        actual: Digest,
    },
    /// The number of bytes read differs from the descriptor's size.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Size named by the descriptor
        expected: u64,
        /// Bytes actually read
        actual: u64,
    },
    /// The copy was cancelled while the blob was in flight.
    #[error("cancelled")]
    Cancelled,
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The verified blob could not be recompressed.
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// The step of a copy that was running when it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyPhase {
    /// Checking options
    Start,
    /// Resolving locators and opening transports
    ResolvingRefs,
    /// Fetching the manifest and signatures and consulting the trust policy
    EvaluatingPolicy,
    /// Parsing the manifest and fetching list instances
    FetchingManifest,
    /// Working out which blobs must be transferred and how
    DiffingLayers,
    /// Transferring blobs
    CopyingBlobs,
    /// Writing manifests and signatures
    WritingManifest,
}

impl fmt::Display for CopyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CopyPhase::Start => "starting",
            CopyPhase::ResolvingRefs => "resolving references",
            CopyPhase::EvaluatingPolicy => "evaluating trust policy",
            CopyPhase::FetchingManifest => "fetching manifest",
            CopyPhase::DiffingLayers => "diffing layers",
            CopyPhase::CopyingBlobs => "copying blobs",
            CopyPhase::WritingManifest => "writing manifest",
        };
        f.write_str(name)
    }
}

/// What went wrong, independent of where.
#[derive(Debug, Error)]
pub enum CopyErrorKind {
    /// A locator could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// A transport could not be reached or set up.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Credentials were refused and a refresh did not help.
    #[error("authentication required for {host}")]
    AuthRequired {
        /// Host whose credentials were refused
        host: String,
    },
    /// Content does not hash to its digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest we were promised
        expected: Digest,
        /// Digest of what we received
        actual: Digest,
    },
    /// Content has the wrong length.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Size we were promised
        expected: u64,
        /// Size of what we received
        actual: u64,
    },
    /// The trust policy refused the source image.
    #[error("rejected by trust policy: {0}")]
    PolicyRejected(String),
    /// The credential provider failed.
    #[error(transparent)]
    CredentialProvider(CredentialProviderError),
    /// The copy options contradict each other.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    /// The source or destination cannot represent what the copy needs.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The caller cancelled the copy.
    #[error("cancelled")]
    Cancelled,
    /// Any other transport failure.
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for CopyErrorKind {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::AuthRequired { host } => CopyErrorKind::AuthRequired { host },
            TransportError::Connect { target, reason } => {
                CopyErrorKind::Connect(format!("{}: {}", target, reason))
            }
            TransportError::Credentials(e) => CopyErrorKind::CredentialProvider(e),
            TransportError::Unsupported(what) => CopyErrorKind::Unsupported(what),
            other => CopyErrorKind::Transport(other),
        }
    }
}

impl From<BlobError> for CopyErrorKind {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::DigestMismatch { expected, actual } => {
                CopyErrorKind::DigestMismatch { expected, actual }
            }
            BlobError::SizeMismatch { expected, actual } => {
                CopyErrorKind::SizeMismatch { expected, actual }
            }
            BlobError::Cancelled => CopyErrorKind::Cancelled,
            BlobError::Transport(t) => t.into(),
            BlobError::Compression(e @ CompressionError::NoMediaType { .. }) => {
                CopyErrorKind::Unsupported(e.to_string())
            }
            BlobError::Compression(e) => {
                CopyErrorKind::Transport(TransportError::Invalid(e.to_string()))
            }
        }
    }
}

/// The single failure a copy reports: which phase, which resource, and why.
#[derive(Debug, Error)]
#[error("{phase} failed for {resource}: {kind}")]
pub struct CopyError {
    /// Where the copy was
    pub phase: CopyPhase,
    /// The manifest, blob or locator being handled
    pub resource: String,
    /// What went wrong
    #[source]
    pub kind: CopyErrorKind,
}

impl CopyError {
    /// Builds an error from anything convertible into a [`CopyErrorKind`].
    pub fn new(phase: CopyPhase, resource: impl fmt::Display, kind: impl Into<CopyErrorKind>) -> Self {
        CopyError {
            phase,
            resource: resource.to_string(),
            kind: kind.into(),
        }
    }

    /// Returns true when the copy stopped because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, CopyErrorKind::Cancelled)
    }
}
