//! Model types for the S3 XML documents the client exchanges.
//!
//! Request bodies (multipart completion, multi-object delete) implement
//! [`crate::S3Serialize`]; response bodies implement [`crate::S3Deserialize`].
//! Fields that S3 always populates are plain values; fields the service may
//! omit are `Option`.

use chrono::{DateTime, Utc};

/// One part of a completed multipart upload.
#[derive(Debug, Clone, Default)]
pub struct CompletedPart {
    /// Wire part number, starting at 1.
    pub part_number: u32,
    /// Quoted entity tag returned by the part upload.
    pub e_tag: String,
}

/// Body of the multipart upload completion request.
///
/// Parts must be listed in ascending `part_number` order.
#[derive(Debug, Clone, Default)]
pub struct CompleteMultipartUpload {
    pub parts: Vec<CompletedPart>,
}

/// One object named in a multi-object delete request.
#[derive(Debug, Clone, Default)]
pub struct ObjectIdentifier {
    pub key: String,
    pub version_id: Option<String>,
}

/// Body of the multi-object delete request.
#[derive(Debug, Clone, Default)]
pub struct Delete {
    /// When set, the response omits per-object success entries.
    pub quiet: bool,
    pub objects: Vec<ObjectIdentifier>,
}

/// Response to a multipart upload initiation.
#[derive(Debug, Clone, Default)]
pub struct InitiateMultipartUploadResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// Response to a multipart upload completion.
#[derive(Debug, Clone, Default)]
pub struct CompleteMultipartUploadResult {
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    pub e_tag: String,
}

/// A successfully deleted object in a multi-object delete response.
#[derive(Debug, Clone, Default)]
pub struct DeletedObject {
    pub key: String,
    pub version_id: Option<String>,
}

/// A per-object failure in a multi-object delete response.
#[derive(Debug, Clone, Default)]
pub struct DeleteErrorEntry {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Response to a multi-object delete request.
#[derive(Debug, Clone, Default)]
pub struct DeleteResult {
    pub deleted: Vec<DeletedObject>,
    pub errors: Vec<DeleteErrorEntry>,
}

/// One object entry in a bucket listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub e_tag: String,
    pub size: i64,
    pub storage_class: Option<String>,
}

/// Response page from a ListObjectsV2 request.
#[derive(Debug, Clone, Default)]
pub struct ListBucketResult {
    pub name: String,
    pub prefix: String,
    pub key_count: i32,
    pub max_keys: i32,
    pub is_truncated: bool,
    /// Opaque token for fetching the next page, present when truncated.
    pub next_continuation_token: Option<String>,
    pub contents: Vec<ObjectSummary>,
}

/// Body of an S3 error response.
#[derive(Debug, Clone, Default)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub resource: Option<String>,
    pub request_id: Option<String>,
}
