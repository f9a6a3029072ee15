//! Errors related to interacting with an OCI compliant remote store

/// Errors returned by the registry [`Client`](crate::Client)
#[derive(thiserror::Error, Debug)]
pub enum OciDistributionError {
    /// The registry refused the credentials, or demanded credentials we did not send
    #[error("Not authorized: {url} answered {status}")]
    Unauthorized {
        /// Request URL
        url: String,
        /// HTTP status, 401 or 403
        status: u16,
    },
    /// The requested manifest or blob does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// The registry answered with a structured OCI error
    #[error("Registry error: url {url}, envelope: {envelope}")]
    RegistryError {
        /// List of errors returned by the registry
        envelope: OciEnvelope,
        /// Request URL
        url: String,
    },
    /// The registry answered with an unexpected status
    #[error("Server error: url {url}, code: {code}, message: {message}")]
    ServerError {
        /// HTTP status
        code: u16,
        /// Request URL
        url: String,
        /// Response body
        message: String,
    },
    /// The token endpoint could not be used
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),
    /// An upload was accepted without a `Location` to continue at
    #[error("Registry did not return a location header")]
    RegistryNoLocationError,
    /// The manifest has a media type this client does not handle
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
    /// Transport level failure
    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
    /// A URL returned by the registry could not be parsed
    #[error("Error parsing Url {0}")]
    UrlParseError(String),
    /// A JSON document could not be decoded
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    /// An upload was attempted with nothing to upload
    #[error("Nothing to push")]
    PushNoDataError,
}

impl OciDistributionError {
    /// Returns true when the error means new credentials are needed
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, OciDistributionError::Unauthorized { .. })
    }
}

/// Helper type to declare `Result` objects that might return an `OciDistributionError`
pub type Result<T> = std::result::Result<T, OciDistributionError>;

/// The OCI specification defines a specific error format.
///
/// This struct represents that error format, which is formally described here:
/// https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug)]
pub struct OciError {
    /// The error code
    pub code: OciErrorCode,
    /// An optional message associated with the error
    #[serde(default)]
    pub message: String,
    /// Unstructured optional data associated with the error
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl std::error::Error for OciError {}

impl std::fmt::Display for OciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OCI API error ({:?}): {}", self.code, self.message.as_str())
    }
}

/// The body the registry sends alongside a failed request
#[derive(serde::Deserialize, Debug)]
pub struct OciEnvelope {
    /// List of errors returned by the registry
    pub errors: Vec<OciError>,
}

impl std::fmt::Display for OciEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let errors: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", errors.join(", "))
    }
}

/// OCI error codes
///
/// Outlined here: https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    /// Blob unknown to registry
    ///
    /// This error MAY be returned when a blob is unknown to the registry in a specified
    /// repository. This can be returned with a standard get or if a manifest
    /// references an unknown layer during upload.
    BlobUnknown,
    /// Blob upload is invalid
    ///
    /// The blob upload encountered an error and can no longer proceed.
    BlobUploadInvalid,
    /// Blob upload is unknown to registry
    BlobUploadUnknown,
    /// Provided digest did not match uploaded content.
    DigestInvalid,
    /// Blob is unknown to registry
    ManifestBlobUnknown,
    /// Manifest is invalid
    ///
    /// During upload, manifests undergo several checks ensuring validity. If
    /// those checks fail, this error MAY be returned, unless a more specific
    /// error is included. The detail will contain information the failed
    /// validation.
    ManifestInvalid,
    /// Manifest unknown
    ///
    /// This error is returned when the manifest, identified by name and tag is unknown to the repository.
    ManifestUnknown,
    /// Manifest failed signature validation
    ///
    /// DEPRECATED: This error code has been removed from the OCI spec.
    ManifestUnverified,
    /// Invalid repository name
    NameInvalid,
    /// Repository name is not known
    NameUnknown,
    /// Provided length did not match content length
    SizeInvalid,
    /// Manifest tag did not match URI
    ///
    /// DEPRECATED: This error code has been removed from the OCI spec.
    TagInvalid,
    /// Authentication required.
    Unauthorized,
    /// Requested access to the resource is denied
    Denied,
    /// This operation is unsupported
    Unsupported,
    /// Too many requests from client
    Toomanyrequests,
}
