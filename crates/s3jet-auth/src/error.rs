//! Error types for request signing.
//!
//! All signing failures are represented by [`SigningError`]. Signing is
//! deliberately strict: a request that cannot be signed completely is never
//! sent, so every variant here is fatal to the request that triggered it.

/// Errors that can occur while signing an outbound request.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// No signing region was supplied and none could be derived.
    #[error("No signing region available; an unsigned request will not be sent")]
    MissingRegion,

    /// The request carries no `Host` header, which SigV4 requires signed.
    #[error("Request has no Host header")]
    MissingHost,

    /// A header selected for signing contains bytes that are not visible ASCII.
    #[error("Header {0} has a non-ASCII value and cannot be signed")]
    NonAsciiHeader(String),

    /// A computed header value was rejected by the HTTP layer.
    #[error("Computed value for header {0} is not a valid header value")]
    InvalidHeaderValue(String),
}
