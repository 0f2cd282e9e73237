//! Checksum sidecar objects.
//!
//! Whole-object MD5 digests live next to the data under a reserved prefix:
//! the digest for `<key>` is stored at `/.md5/<key>.md5` as lowercase hex
//! with content type `text/plain`. Uploads publish the sidecar after
//! completion; downloads fetch it up front and verify the assembled stream
//! against it; deletes remove it alongside the object.

use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, header::CONTENT_TYPE};

use s3jet_auth::PayloadHash;

use crate::bucket::ObjectLocation;
use crate::error::{Result, S3Error};
use crate::transport::{RequestSpec, Transport};

/// Sidecar path for an object path; any `versionId` query is dropped.
pub(crate) fn key(path: &str) -> String {
    let bare = path.split('?').next().unwrap_or(path);
    let trimmed = bare.trim_start_matches('/');
    format!("/.md5/{trimmed}.md5")
}

/// Fetch the published digest for `display_path`.
///
/// A missing sidecar is reported as [`S3Error::ChecksumMissing`]; callers
/// with verification enabled treat that as fatal.
pub(crate) async fn fetch(
    transport: &Transport,
    location: &ObjectLocation,
    display_path: &str,
    max_attempts: u32,
) -> Result<String> {
    let spec = RequestSpec::new(
        Method::GET,
        location.host.clone(),
        location.path.clone(),
        location.query.clone(),
    );
    let response = match transport
        .send_checked_retry(&spec, StatusCode::OK, max_attempts)
        .await
    {
        Ok(response) => response,
        Err(S3Error::Service { status, .. }) if status == StatusCode::NOT_FOUND => {
            return Err(S3Error::ChecksumMissing {
                path: display_path.to_owned(),
            });
        }
        Err(error) => return Err(error),
    };

    let body = response.bytes().await?;
    let text = String::from_utf8_lossy(&body).trim().to_owned();
    if text.len() != 32 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(S3Error::UnexpectedResponse {
            reason: format!("checksum sidecar for {display_path} is not an MD5 digest"),
        });
    }
    Ok(text)
}

/// Publish the digest for a freshly completed upload.
pub(crate) async fn publish(
    transport: &Transport,
    location: &ObjectLocation,
    md5_hex: &str,
    max_attempts: u32,
) -> Result<()> {
    let body = Bytes::from(md5_hex.to_owned());
    let mut spec = RequestSpec::new(
        Method::PUT,
        location.host.clone(),
        location.path.clone(),
        location.query.clone(),
    );
    spec.headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    spec.payload = PayloadHash::of(&body);
    spec.body = Some(body);
    transport
        .send_checked_retry(&spec, StatusCode::OK, max_attempts)
        .await?;
    Ok(())
}

/// Remove the digest together with its object. An absent sidecar is fine;
/// objects stored with verification disabled never had one.
pub(crate) async fn delete(
    transport: &Transport,
    location: &ObjectLocation,
    max_attempts: u32,
) -> Result<()> {
    let spec = RequestSpec::new(
        Method::DELETE,
        location.host.clone(),
        location.path.clone(),
        location.query.clone(),
    );
    match transport
        .send_checked_retry(&spec, StatusCode::NO_CONTENT, max_attempts)
        .await
    {
        Ok(_) => Ok(()),
        Err(S3Error::Service { status, .. }) if status == StatusCode::NOT_FOUND => Ok(()),
        Err(error) => Err(error),
    }
}
