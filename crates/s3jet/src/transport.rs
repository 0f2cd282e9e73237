//! Signed HTTP transport shared by every request path.
//!
//! A [`Transport`] owns the HTTP client, the credentials supplier, and the
//! signing region. Callers describe a request as a [`RequestSpec`]; the
//! transport signs it (always, an unsigned request is never sent) and
//! dispatches it. Control requests go through [`Transport::send_checked_retry`],
//! which applies the same transient-retry policy the part scheduler uses.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::header::{HOST, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use rand::RngExt;
use tracing::{debug, warn};

use s3jet_auth::{PayloadHash, SigningContext, sign_request};
use s3jet_xml::types::ErrorResponse;

use crate::config::Scheme;
use crate::credentials::ProvideCredentials;
use crate::error::{Result, S3Error};

/// `User-Agent` value attached to every request before signing.
pub(crate) const USER_AGENT_VALUE: &str = concat!("s3jet/", env!("CARGO_PKG_VERSION"));

/// `Content-MD5` carries the base64 digest the store verifies server-side.
pub(crate) const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 10_000;

/// One outbound request, described wire-exactly.
///
/// `path` is percent-encoded per segment and `query` is already encoded;
/// both are signed byte-for-byte as they appear on the wire.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpec {
    pub method: Method,
    pub host: String,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub payload: PayloadHash,
}

impl RequestSpec {
    pub(crate) fn new(method: Method, host: String, path: String, query: String) -> Self {
        Self {
            method,
            host,
            path,
            query,
            headers: HeaderMap::new(),
            body: None,
            payload: PayloadHash::Empty,
        }
    }
}

/// Signing and dispatch for one bucket's requests.
#[derive(Debug)]
pub(crate) struct Transport {
    http: reqwest::Client,
    credentials: Arc<dyn ProvideCredentials>,
    region: String,
    scheme: Scheme,
}

impl Transport {
    pub(crate) fn new(
        credentials: Arc<dyn ProvideCredentials>,
        region: String,
        scheme: Scheme,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            credentials,
            region,
            scheme,
        })
    }

    /// Sign and send one request, without status checking or retry.
    pub(crate) async fn send(&self, spec: &RequestSpec) -> Result<reqwest::Response> {
        let credentials = self.credentials.credentials()?;

        let mut headers = spec.headers.clone();
        let host = HeaderValue::from_str(&spec.host).map_err(|_| S3Error::Config {
            reason: format!("invalid request host: {}", spec.host),
        })?;
        headers.insert(HOST, host);
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let context = SigningContext {
            access_key_id: credentials.access_key_id(),
            secret_access_key: credentials.secret_access_key(),
            session_token: credentials.session_token(),
            region: &self.region,
            service: "s3",
            timestamp: Utc::now(),
        };
        sign_request(
            &spec.method,
            &spec.path,
            &spec.query,
            &mut headers,
            &spec.payload,
            &context,
        )?;

        let url = if spec.query.is_empty() {
            format!("{}://{}{}", self.scheme, spec.host, spec.path)
        } else {
            format!("{}://{}{}?{}", self.scheme, spec.host, spec.path, spec.query)
        };
        debug!(method = %spec.method, %url, "Sending request");

        let mut request = self.http.request(spec.method.clone(), url).headers(headers);
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }
        Ok(request.send().await?)
    }

    /// Send and require `expected`; any other status becomes an error.
    pub(crate) async fn send_checked(
        &self,
        spec: &RequestSpec,
        expected: StatusCode,
    ) -> Result<reqwest::Response> {
        let response = self.send(spec).await?;
        if response.status() == expected {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }

    /// [`Transport::send_checked`] under the transient-retry policy, for
    /// control requests (HEAD, initiate, complete, abort, delete, sidecar).
    pub(crate) async fn send_checked_retry(
        &self,
        spec: &RequestSpec,
        expected: StatusCode,
        max_attempts: u32,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_checked(spec, expected).await {
                Ok(response) => return Ok(response),
                Err(error) if attempt < max_attempts && error.is_transient() => {
                    warn!(method = %spec.method, path = %spec.path, attempt, error = %error,
                        "Transient request failure, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Convert a non-success response into [`S3Error::Service`], parsing the XML
/// error document when one is present.
pub(crate) async fn error_from_response(response: reqwest::Response) -> S3Error {
    let status = response.status();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(error) => return S3Error::Transport(error),
    };

    if !body.is_empty() {
        if let Ok(parsed) = s3jet_xml::from_xml::<ErrorResponse>(&body) {
            if !parsed.code.is_empty() {
                return S3Error::Service {
                    status,
                    code: parsed.code,
                    message: parsed.message,
                    request_id: parsed.request_id,
                };
            }
        }
    }

    S3Error::Service {
        status,
        code: status
            .canonical_reason()
            .unwrap_or("UnknownError")
            .to_owned(),
        message: String::from_utf8_lossy(&body).trim().to_owned(),
        request_id: None,
    }
}

/// Join two already-encoded query fragments with `&`, tolerating either
/// being empty.
pub(crate) fn join_query(base: &str, extra: &str) -> String {
    match (base.is_empty(), extra.is_empty()) {
        (true, _) => extra.to_owned(),
        (_, true) => base.to_owned(),
        (false, false) => format!("{base}&{extra}"),
    }
}

/// Delay before retry `attempt + 1`: exponential from [`BACKOFF_BASE_MS`],
/// capped at [`BACKOFF_CAP_MS`], with up to 50% added jitter.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE_MS.saturating_mul(1 << exponent);
    let capped = base.min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0..=capped / 2);
    Duration::from_millis(capped + jitter)
}
