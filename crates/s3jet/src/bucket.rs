//! Bucket handle and object addressing.
//!
//! A [`Bucket`] binds a name, an [`Endpoint`], credentials, and a default
//! [`Config`] into one handle. It turns object paths into signed request
//! addresses (virtual-hosted by default, path-style on request or whenever
//! the bucket name contains a dot, since such names break TLS wildcard
//! certificates) and exposes the transfer operations: streaming reads and
//! writes, deletes, bulk deletes, and listing.

use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use md5::{Digest, Md5};
use tracing::debug;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use s3jet_auth::PayloadHash;
use s3jet_auth::canonical::{build_canonical_uri, uri_encode};
use s3jet_xml::types::{Delete, DeleteResult, ListBucketResult, ObjectIdentifier, ObjectSummary};
use s3jet_xml::{from_xml, to_xml};

use crate::config::Config;
use crate::credentials::ProvideCredentials;
use crate::endpoint::Endpoint;
use crate::error::{Result, S3Error};
use crate::get::{self, ObjectReader};
use crate::put::{self, ObjectWriter};
use crate::sidecar;
use crate::transport::{CONTENT_MD5, RequestSpec, Transport};

/// Most keys a single bulk-delete request may carry.
const MAX_DELETE_KEYS: usize = 1000;

/// Fully resolved request address: signed host, encoded path, encoded query.
#[derive(Debug, Clone)]
pub(crate) struct ObjectLocation {
    pub(crate) host: String,
    pub(crate) path: String,
    pub(crate) query: String,
}

/// Handle to one bucket.
///
/// Cheap to share behind an [`Arc`]; every operation borrows it immutably.
/// The signing region, URL scheme, and request timeout are fixed when the
/// bucket is created; the remaining tuning knobs can be overridden per call
/// through the `*_with_config` variants.
#[derive(Debug)]
pub struct Bucket {
    name: String,
    endpoint: Endpoint,
    config: Config,
    transport: Arc<Transport>,
}

impl Bucket {
    /// Bind a bucket name to an endpoint, credentials, and defaults.
    ///
    /// Resolves the signing region from the endpoint once; a region that
    /// cannot be determined fails here rather than on first use.
    pub fn new(
        name: impl Into<String>,
        credentials: impl ProvideCredentials + 'static,
        endpoint: Endpoint,
        config: Config,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(S3Error::Config {
                reason: "bucket name is empty".to_owned(),
            });
        }
        config.validate()?;
        let region = endpoint.region()?;
        let transport = Transport::new(
            Arc::new(credentials),
            region,
            config.scheme,
            config.timeout,
        )?;
        Ok(Self {
            name,
            endpoint,
            config,
            transport: Arc::new(transport),
        })
    }

    /// The bucket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The endpoint requests are addressed to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The default configuration operations run with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a streaming reader with the bucket defaults.
    pub async fn get_reader(&self, path: &str) -> Result<ObjectReader> {
        self.get_reader_with_config(path, self.config.clone()).await
    }

    /// Open a streaming reader with per-call settings.
    ///
    /// When checksum verification is enabled the sidecar digest is fetched
    /// before any data moves; an object without a published digest fails
    /// with [`S3Error::ChecksumMissing`].
    pub async fn get_reader_with_config(
        &self,
        path: &str,
        config: Config,
    ) -> Result<ObjectReader> {
        config.validate()?;
        let location = self.object_location(path, &config)?;
        let display_path = self.display_path(path);
        let expected_md5 = if config.verify_checksums {
            let sidecar_location = self.sidecar_location(path, &config)?;
            let digest = sidecar::fetch(
                &self.transport,
                &sidecar_location,
                &display_path,
                config.max_attempts,
            )
            .await?;
            Some(digest)
        } else {
            None
        };
        get::new_reader(
            Arc::clone(&self.transport),
            location,
            display_path,
            &config,
            expected_md5,
        )
        .await
    }

    /// Open a streaming writer with the bucket defaults.
    ///
    /// `headers` are sent with the initiating request; use them for
    /// content type, cache control, server-side encryption, and the like.
    pub fn put_writer(&self, path: &str, headers: HeaderMap) -> Result<ObjectWriter> {
        self.put_writer_with_config(path, headers, self.config.clone())
    }

    /// Open a streaming writer with per-call settings.
    pub fn put_writer_with_config(
        &self,
        path: &str,
        headers: HeaderMap,
        config: Config,
    ) -> Result<ObjectWriter> {
        config.validate()?;
        let location = self.object_location(path, &config)?;
        let sidecar_location = if config.verify_checksums {
            Some(self.sidecar_location(path, &config)?)
        } else {
            None
        };
        let display_path = self.display_path(path);
        put::new_writer(
            Arc::clone(&self.transport),
            location,
            sidecar_location,
            display_path,
            headers,
            config,
        )
    }

    /// Delete one object, and its checksum sidecar when verification is on.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let location = self.object_location(path, &self.config)?;
        let spec = RequestSpec::new(Method::DELETE, location.host, location.path, location.query);
        self.transport
            .send_checked_retry(&spec, StatusCode::NO_CONTENT, self.config.max_attempts)
            .await?;
        debug!(path = %self.display_path(path), "Object deleted");

        if self.config.verify_checksums {
            let sidecar_location = self.sidecar_location(path, &self.config)?;
            sidecar::delete(&self.transport, &sidecar_location, self.config.max_attempts).await?;
        }
        Ok(())
    }

    /// Delete many objects with bulk-delete requests of up to 1000 keys.
    ///
    /// Checksum sidecars for the named objects are included when
    /// verification is on. With `quiet` set, the store reports only
    /// failures; otherwise every deleted key is echoed back. Per-key
    /// failures do not fail the call, they come back in
    /// [`DeleteResult::errors`].
    pub async fn delete_multiple<S: AsRef<str>>(
        &self,
        quiet: bool,
        paths: &[S],
    ) -> Result<DeleteResult> {
        let mut objects = Vec::with_capacity(paths.len());
        for path in paths {
            let (key, version) = split_version(path.as_ref())?;
            let key = key.trim_start_matches('/');
            if key.is_empty() {
                return Err(S3Error::InvalidPath {
                    reason: "empty object path in bulk delete".to_owned(),
                });
            }
            objects.push(ObjectIdentifier {
                key: key.to_owned(),
                version_id: version.map(ToOwned::to_owned),
            });
            if self.config.verify_checksums {
                objects.push(ObjectIdentifier {
                    key: sidecar::key(path.as_ref())
                        .trim_start_matches('/')
                        .to_owned(),
                    version_id: None,
                });
            }
        }

        let root = self.root_location(&self.config);
        let mut merged = DeleteResult::default();
        for chunk in objects.chunks(MAX_DELETE_KEYS) {
            let request = Delete {
                quiet,
                objects: chunk.to_vec(),
            };
            let body = Bytes::from(to_xml("Delete", &request)?);
            let digest = Md5::digest(&body);

            let mut spec = RequestSpec::new(
                Method::POST,
                root.host.clone(),
                root.path.clone(),
                "delete".to_owned(),
            );
            spec.headers.insert(
                CONTENT_MD5,
                HeaderValue::from_str(&STANDARD.encode(digest)).map_err(|_| S3Error::Protocol {
                    reason: "delete digest is not a valid header value".to_owned(),
                })?,
            );
            spec.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
            spec.payload = PayloadHash::of(&body);
            spec.body = Some(body);

            let response = self
                .transport
                .send_checked_retry(&spec, StatusCode::OK, self.config.max_attempts)
                .await?;
            let raw = response.bytes().await?;
            let result: DeleteResult = from_xml(&raw)?;
            merged.deleted.extend(result.deleted);
            merged.errors.extend(result.errors);
        }
        debug!(
            bucket = %self.name,
            deleted = merged.deleted.len(),
            failed = merged.errors.len(),
            "Bulk delete finished"
        );
        Ok(merged)
    }

    /// List every key under `prefix`, following continuation tokens until
    /// the listing is exhausted.
    ///
    /// `max_keys` caps the page size, not the total; pass `0` for the
    /// store's default page size.
    pub async fn list_objects(&self, prefix: &str, max_keys: i32) -> Result<Vec<ObjectSummary>> {
        let root = self.root_location(&self.config);
        let mut summaries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query = String::from("list-type=2");
            if !prefix.is_empty() {
                query.push_str(&format!("&prefix={}", uri_encode(prefix)));
            }
            if max_keys > 0 {
                query.push_str(&format!("&max-keys={max_keys}"));
            }
            if let Some(token) = &continuation {
                query.push_str(&format!("&continuation-token={}", uri_encode(token)));
            }

            let spec = RequestSpec::new(Method::GET, root.host.clone(), root.path.clone(), query);
            let response = self
                .transport
                .send_checked_retry(&spec, StatusCode::OK, self.config.max_attempts)
                .await?;
            let raw = response.bytes().await?;
            let page: ListBucketResult = from_xml(&raw)?;
            summaries.extend(page.contents);

            if !page.is_truncated {
                return Ok(summaries);
            }
            match page.next_continuation_token {
                Some(token) if !token.is_empty() => continuation = Some(token),
                _ => {
                    return Err(S3Error::UnexpectedResponse {
                        reason: "truncated listing without a continuation token".to_owned(),
                    });
                }
            }
        }
    }

    /// Resolve an object path into a signed request address.
    pub(crate) fn object_location(&self, path: &str, config: &Config) -> Result<ObjectLocation> {
        let (key, version) = split_version(path)?;
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(S3Error::InvalidPath {
                reason: "object path is empty".to_owned(),
            });
        }

        let (host, raw_path) = if self.path_style(config) {
            (
                self.endpoint.domain().to_owned(),
                format!("/{}/{key}", self.name),
            )
        } else {
            (self.endpoint.domain_for_bucket(&self.name), format!("/{key}"))
        };
        let query = version
            .map(|v| format!("versionId={}", uri_encode(v)))
            .unwrap_or_default();
        Ok(ObjectLocation {
            host,
            path: build_canonical_uri(&raw_path),
            query,
        })
    }

    /// The bucket-level address used by bulk delete and listing.
    pub(crate) fn root_location(&self, config: &Config) -> ObjectLocation {
        let (host, path) = if self.path_style(config) {
            (
                self.endpoint.domain().to_owned(),
                format!("/{}", self.name),
            )
        } else {
            (self.endpoint.domain_for_bucket(&self.name), "/".to_owned())
        };
        ObjectLocation {
            host,
            path,
            query: String::new(),
        }
    }

    fn sidecar_location(&self, path: &str, config: &Config) -> Result<ObjectLocation> {
        self.object_location(&sidecar::key(path), config)
    }

    fn path_style(&self, config: &Config) -> bool {
        config.path_style || self.name.contains('.')
    }

    fn display_path(&self, path: &str) -> String {
        format!("{}/{}", self.name, path.trim_start_matches('/'))
    }
}

/// Split an object path into its key and an optional `versionId`.
///
/// `versionId` is the only query parameter object paths may carry.
fn split_version(path: &str) -> Result<(&str, Option<&str>)> {
    let Some((key, query)) = path.split_once('?') else {
        return Ok((path, None));
    };
    let mut version = None;
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        if let Some(value) = pair.strip_prefix("versionId=") {
            version = Some(value);
        } else {
            return Err(S3Error::InvalidPath {
                reason: format!("unsupported query parameter in object path: {pair}"),
            });
        }
    }
    Ok((key, version))
}
