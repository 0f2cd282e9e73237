//! Error types for the s3jet client.
//!
//! [`S3Error`] covers every failure the client surfaces, from configuration
//! problems caught before any request is sent, through transport and service
//! failures, to integrity violations detected at stream close. The
//! [`S3Error::is_transient`] classification drives the per-part retry policy:
//! transient errors are retried within the attempt budget, everything else
//! fails the transfer immediately.

use http::StatusCode;

use s3jet_auth::SigningError;
use s3jet_xml::XmlError;

/// Result alias used throughout the crate.
pub type Result<T, E = S3Error> = std::result::Result<T, E>;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum S3Error {
    // -----------------------------------------------------------------------
    // Setup errors, raised before any request is sent
    // -----------------------------------------------------------------------
    /// The transfer configuration is invalid.
    #[error("invalid configuration: {reason}")]
    Config {
        /// Which bound was violated.
        reason: String,
    },

    /// A required credential environment variable is unset or empty.
    #[error("credentials not found: {variable} is not set")]
    MissingCredentials {
        /// The environment variable that was missing.
        variable: String,
    },

    /// The signing region could not be determined for the endpoint domain.
    #[error("cannot determine region for domain {domain}; set AWS_REGION or use a custom endpoint")]
    RegionNotFound {
        /// The endpoint domain that did not resolve to a region.
        domain: String,
    },

    /// Request signing failed.
    #[error("request signing failed: {0}")]
    Signing(#[from] SigningError),

    /// The object path is unusable.
    #[error("invalid object path: {reason}")]
    InvalidPath {
        /// Why the path was rejected.
        reason: String,
    },

    // -----------------------------------------------------------------------
    // Request errors
    // -----------------------------------------------------------------------
    /// The HTTP transport failed (connection, timeout, or body error).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The store answered with an error status.
    #[error("{code}: {message} (HTTP {status})")]
    Service {
        /// HTTP status of the response.
        status: StatusCode,
        /// S3 error code from the response body, or the status reason.
        code: String,
        /// Human-readable message from the response body.
        message: String,
        /// Request id echoed by the store, when present.
        request_id: Option<String>,
    },

    /// The store answered with a well-formed but unusable response.
    #[error("unexpected response: {reason}")]
    UnexpectedResponse {
        /// What was wrong with the response.
        reason: String,
    },

    /// A response body could not be parsed as the expected XML document.
    #[error("malformed XML body: {0}")]
    Xml(#[from] XmlError),

    // -----------------------------------------------------------------------
    // Integrity errors
    // -----------------------------------------------------------------------
    /// A part upload was acknowledged with an ETag that does not match the
    /// digest of the bytes sent. The store saw different bytes; retrying
    /// re-uploads the part.
    #[error("part {index} ETag mismatch: sent {sent}, stored {received}")]
    EtagMismatch {
        /// Zero-based part index.
        index: u64,
        /// Hex MD5 of the bytes the client sent.
        sent: String,
        /// ETag the store returned, without quotes.
        received: String,
    },

    /// The downloaded content does not match the stored checksum.
    #[error("checksum mismatch for {path}: stored {expected}, computed {actual}")]
    ChecksumMismatch {
        /// Object path the mismatch was detected on.
        path: String,
        /// Checksum read from the sidecar object.
        expected: String,
        /// Checksum computed over the delivered bytes.
        actual: String,
    },

    /// Checksum verification is enabled but the sidecar object is absent.
    #[error("no stored checksum for {path}")]
    ChecksumMissing {
        /// Object path whose sidecar was not found.
        path: String,
    },

    // -----------------------------------------------------------------------
    // Session errors
    // -----------------------------------------------------------------------
    /// The multipart session reached an inconsistent state.
    #[error("multipart session violation: {reason}")]
    Protocol {
        /// The invariant that was violated.
        reason: String,
    },

    /// A part operation exhausted its attempt budget or failed permanently.
    #[error("part {index} failed after {attempts} attempt(s): {source}")]
    PartFailed {
        /// Zero-based part index.
        index: u64,
        /// Attempts consumed, including the failing one.
        attempts: u32,
        /// The error from the final attempt.
        source: Box<S3Error>,
    },
}

impl S3Error {
    /// Whether this failure may succeed on retry with identical parameters.
    ///
    /// Transient: transport-level failures (connect, timeout, interrupted
    /// body), 5xx statuses, throttling (429) and request-timeout (408)
    /// statuses, and part ETag mismatches. Everything else is permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_builder(),
            Self::Service { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::EtagMismatch { .. } => true,
            _ => false,
        }
    }
}
