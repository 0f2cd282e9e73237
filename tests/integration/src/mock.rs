//! In-process S3-compatible store for exercising the client end to end.
//!
//! [`MockStore`] binds a loopback port and speaks enough of the S3 REST
//! protocol for every client operation: multipart uploads, ranged reads,
//! sidecar puts, deletes, bulk deletes, and V2 listing. Every request's
//! SigV4 signature is re-derived from the wire bytes and compared against
//! the received `Authorization` header, so an encoding skew between what
//! the client signs and what it sends surfaces as a 403 in any test.
//!
//! Fault injection is scripted through [`Faults`]: per-part 500s, garbled
//! part ETags, truncated range responses, artificial latency, and
//! error-bodied completions. [`Counters`] records how often each wire
//! operation was hit so tests can assert retry and abort behavior.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::SeqCst};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, RANGE,
};
use http::request::Parts;
use http::{HeaderMap, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use rand::RngExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::debug;

use s3jet::{Credentials, Endpoint};
use s3jet_auth::{PayloadHash, SigningContext, hash_payload, sign_request};

/// Access key every test bucket signs with.
pub const TEST_ACCESS_KEY: &str = "AKIDMOCKACCESSKEY";
/// Secret key the store verifies signatures against.
pub const TEST_SECRET_KEY: &str = "mock-secret-key/with+chars";
/// Region baked into the credential scope on both sides.
pub const TEST_REGION: &str = "mock-1";

/// Credentials matching what the store verifies.
#[must_use]
pub fn credentials() -> Credentials {
    Credentials::new(TEST_ACCESS_KEY, TEST_SECRET_KEY)
}

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    modified: DateTime<Utc>,
}

struct StoredPart {
    data: Bytes,
    etag: String,
}

struct Upload {
    path: String,
    content_type: Option<String>,
    parts: Mutex<BTreeMap<u32, StoredPart>>,
}

/// Scripted failures, consumed as matching requests arrive.
#[derive(Default)]
pub struct Faults {
    initiate_failures: AtomicU32,
    complete_failures: AtomicU32,
    complete_error_body: AtomicBool,
    etag_corruptions: AtomicU32,
    upload_failures: Mutex<HashMap<u32, u32>>,
    fetch_failures: Mutex<HashMap<u64, u32>>,
    truncate_fetch: Mutex<Option<u64>>,
    part_delay_ms: Mutex<Option<Range<u64>>>,
    deny_delete: Mutex<HashSet<String>>,
}

impl Faults {
    /// Answer the next `times` uploads of wire part `part_number` with 500.
    pub fn fail_upload_part(&self, part_number: u32, times: u32) {
        self.upload_failures.lock().insert(part_number, times);
    }

    /// Answer the next `times` range fetches starting at `start` with 500.
    pub fn fail_fetch_at(&self, start: u64, times: u32) {
        self.fetch_failures.lock().insert(start, times);
    }

    /// Answer the next `times` initiate requests with 500.
    pub fn fail_initiate(&self, times: u32) {
        self.initiate_failures.store(times, SeqCst);
    }

    /// Answer the next `times` completion requests with 500.
    pub fn fail_complete(&self, times: u32) {
        self.complete_failures.store(times, SeqCst);
    }

    /// Answer the next completion with HTTP 200 carrying an `<Error>` body.
    pub fn complete_with_error_body(&self) {
        self.complete_error_body.store(true, SeqCst);
    }

    /// Garble the ETag of the next part-upload response.
    pub fn corrupt_next_etag(&self) {
        self.etag_corruptions.fetch_add(1, SeqCst);
    }

    /// Return a short body (correct 206 status) for the next range fetch
    /// starting at `start`.
    pub fn truncate_fetch_at(&self, start: u64) {
        *self.truncate_fetch.lock() = Some(start);
    }

    /// Delay every part-level request by a random duration in `range` ms.
    pub fn delay_parts(&self, range: Range<u64>) {
        *self.part_delay_ms.lock() = Some(range);
    }

    /// Refuse to bulk-delete `key`, reporting an `AccessDenied` entry.
    pub fn deny_delete(&self, key: &str) {
        self.deny_delete.lock().insert(key.to_owned());
    }
}

/// Wire-operation hit counts.
#[derive(Default)]
pub struct Counters {
    initiates: AtomicU32,
    part_uploads: AtomicU32,
    part_fetches: AtomicU32,
    completes: AtomicU32,
    aborts: AtomicU32,
    bulk_deletes: AtomicU32,
    lists: AtomicU32,
}

impl Counters {
    /// Multipart initiations received.
    #[must_use]
    pub fn initiates(&self) -> u32 {
        self.initiates.load(SeqCst)
    }

    /// Part uploads received, including retried attempts.
    #[must_use]
    pub fn part_uploads(&self) -> u32 {
        self.part_uploads.load(SeqCst)
    }

    /// Range fetches received, including retried attempts.
    #[must_use]
    pub fn part_fetches(&self) -> u32 {
        self.part_fetches.load(SeqCst)
    }

    /// Successful multipart completions.
    #[must_use]
    pub fn completes(&self) -> u32 {
        self.completes.load(SeqCst)
    }

    /// Multipart aborts received.
    #[must_use]
    pub fn aborts(&self) -> u32 {
        self.aborts.load(SeqCst)
    }

    /// Bulk-delete requests received.
    #[must_use]
    pub fn bulk_deletes(&self) -> u32 {
        self.bulk_deletes.load(SeqCst)
    }

    /// Listing requests received.
    #[must_use]
    pub fn lists(&self) -> u32 {
        self.lists.load(SeqCst)
    }
}

#[derive(Default)]
struct StoreState {
    objects: DashMap<String, StoredObject>,
    uploads: DashMap<String, Arc<Upload>>,
    faults: Faults,
    counters: Counters,
    request_serial: AtomicU64,
}

/// A running store bound to a loopback port.
pub struct MockStore {
    address: SocketAddr,
    state: Arc<StoreState>,
    acceptor: JoinHandle<()>,
}

impl std::fmt::Debug for MockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStore")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl MockStore {
    /// Bind a fresh store on an ephemeral loopback port and start serving.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind mock listener");
        let address = listener.local_addr().expect("mock listener address");
        let state = Arc::new(StoreState::default());

        let accept_state = Arc::clone(&state);
        let acceptor = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| handle(Arc::clone(&conn_state), req));
                    if let Err(error) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(%error, "mock connection closed");
                    }
                });
            }
        });

        Self {
            address,
            state,
            acceptor,
        }
    }

    /// The endpoint test buckets should be built with.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::Custom {
            domain: format!("127.0.0.1:{}", self.address.port()),
            region: TEST_REGION.to_owned(),
        }
    }

    /// Seed one object directly, bypassing the wire.
    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.state.objects.insert(
            format!("/{bucket}/{key}"),
            StoredObject {
                data: data.into(),
                content_type: None,
                modified: Utc::now(),
            },
        );
    }

    /// Seed one object together with its published MD5 sidecar.
    pub fn insert_object_with_checksum(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let digest = hex::encode(Md5::digest(&data));
        self.insert_object(bucket, key, data);
        self.insert_object(bucket, &format!(".md5/{key}.md5"), digest.into_bytes());
    }

    /// Seed a specific version of an object.
    pub fn insert_object_version(&self, bucket: &str, key: &str, version: &str, data: impl Into<Bytes>) {
        self.insert_object(bucket, &format!("{key}?versionId={version}"), data);
    }

    /// The stored bytes of an object, if present.
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .objects
            .get(&format!("/{bucket}/{key}"))
            .map(|entry| entry.data.clone())
    }

    /// The stored bytes of a specific object version, if present.
    #[must_use]
    pub fn object_version(&self, bucket: &str, key: &str, version: &str) -> Option<Bytes> {
        self.object(bucket, &format!("{key}?versionId={version}"))
    }

    /// Total stored objects, sidecars and versions included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state.objects.len()
    }

    /// Multipart uploads that are initiated but neither completed nor
    /// aborted.
    #[must_use]
    pub fn open_upload_count(&self) -> usize {
        self.state.uploads.len()
    }

    /// Fault-injection controls.
    #[must_use]
    pub fn faults(&self) -> &Faults {
        &self.state.faults
    }

    /// Wire-operation counters.
    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn handle(
    state: Arc<StoreState>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(plain_status(StatusCode::BAD_REQUEST)),
    };
    Ok(route(&state, &parts, body).await)
}

async fn route(state: &StoreState, parts: &Parts, body: Bytes) -> Response<Full<Bytes>> {
    let serial = state.request_serial.fetch_add(1, SeqCst);
    let path = percent_decode_str(parts.uri.path())
        .decode_utf8_lossy()
        .into_owned();
    let query = parse_query(parts.uri.query().unwrap_or(""));

    if let Err(response) = verify_signature(parts, &body, serial) {
        return *response;
    }

    match parts.method.as_str() {
        "POST" if query.contains_key("uploads") => initiate(state, parts, &path),
        "POST" if query.contains_key("uploadId") => {
            complete(state, &path, &query["uploadId"], &body)
        }
        "POST" if query.contains_key("delete") => bulk_delete(state, parts, &path, &body),
        "PUT" if query.contains_key("uploadId") => upload_part(state, parts, &query, body).await,
        "PUT" => put_object(state, parts, &path, &query, body),
        "DELETE" if query.contains_key("uploadId") => abort_upload(state, &query["uploadId"]),
        "DELETE" => delete_object(state, &path, &query),
        "HEAD" => head_object(state, &path, &query),
        "GET" if query.contains_key("list-type") => list_objects(state, &path, &query),
        "GET" => get_object(state, &path, &query, parts).await,
        _ => error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            "unsupported method",
            &path,
        ),
    }
}

/// Re-derive the request signature from the wire bytes and compare.
fn verify_signature(
    parts: &Parts,
    body: &Bytes,
    serial: u64,
) -> Result<(), Box<Response<Full<Bytes>>>> {
    let path = parts.uri.path();
    let deny = |code: &str, message: &str| {
        debug!(serial, %code, "mock rejecting request");
        Box::new(error_response(StatusCode::FORBIDDEN, code, message, path))
    };

    let received = header_str(&parts.headers, AUTHORIZATION.as_str())
        .ok_or_else(|| deny("AccessDenied", "missing authorization header"))?
        .to_owned();
    let amz_date = header_str(&parts.headers, "x-amz-date")
        .ok_or_else(|| deny("AccessDenied", "missing x-amz-date"))?;
    let timestamp = NaiveDateTime::parse_from_str(amz_date, "%Y%m%dT%H%M%SZ")
        .map_err(|_| deny("AccessDenied", "malformed x-amz-date"))?
        .and_utc();
    let content_sha = header_str(&parts.headers, "x-amz-content-sha256")
        .ok_or_else(|| deny("AccessDenied", "missing x-amz-content-sha256"))?
        .to_owned();

    if content_sha != "UNSIGNED-PAYLOAD" && content_sha != hash_payload(body) {
        return Err(deny(
            "XAmzContentSHA256Mismatch",
            "payload hash does not match the body",
        ));
    }

    let mut resigned = parts.headers.clone();
    resigned.remove(AUTHORIZATION);
    let context = SigningContext {
        access_key_id: TEST_ACCESS_KEY,
        secret_access_key: TEST_SECRET_KEY,
        session_token: None,
        region: TEST_REGION,
        service: "s3",
        timestamp,
    };
    sign_request(
        &parts.method,
        path,
        parts.uri.query().unwrap_or(""),
        &mut resigned,
        &PayloadHash::Hash(content_sha),
        &context,
    )
    .map_err(|_| deny("AccessDenied", "request is unsignable"))?;

    let expected = header_str(&resigned, AUTHORIZATION.as_str()).unwrap_or_default();
    if expected == received {
        Ok(())
    } else {
        Err(deny(
            "SignatureDoesNotMatch",
            "the request signature does not match",
        ))
    }
}

fn initiate(state: &StoreState, parts: &Parts, path: &str) -> Response<Full<Bytes>> {
    state.counters.initiates.fetch_add(1, SeqCst);
    if consume_atomic(&state.faults.initiate_failures) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "injected initiate failure",
            path,
        );
    }

    let upload_id = uuid::Uuid::new_v4().to_string();
    let (bucket, key) = split_bucket_key(path);
    state.uploads.insert(
        upload_id.clone(),
        Arc::new(Upload {
            path: path.to_owned(),
            content_type: header_str(&parts.headers, CONTENT_TYPE.as_str()).map(ToOwned::to_owned),
            parts: Mutex::new(BTreeMap::new()),
        }),
    );

    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <InitiateMultipartUploadResult>\
         <Bucket>{}</Bucket><Key>{}</Key><UploadId>{upload_id}</UploadId>\
         </InitiateMultipartUploadResult>",
        escape(bucket),
        escape(key),
    );
    xml_response(StatusCode::OK, body)
}

async fn upload_part(
    state: &StoreState,
    parts: &Parts,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Response<Full<Bytes>> {
    state.counters.part_uploads.fetch_add(1, SeqCst);
    apply_part_delay(state).await;

    let part_number: u32 = query
        .get("partNumber")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    if consume_keyed(&state.faults.upload_failures, &part_number) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "injected part failure",
            parts.uri.path(),
        );
    }

    let upload_id = &query["uploadId"];
    let Some(upload) = state.uploads.get(upload_id).map(|u| Arc::clone(&u)) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "NoSuchUpload",
            "unknown upload id",
            parts.uri.path(),
        );
    };

    let digest = Md5::digest(&body);
    if let Some(sent) = header_str(&parts.headers, "content-md5") {
        if sent != STANDARD.encode(digest) {
            return error_response(
                StatusCode::BAD_REQUEST,
                "BadDigest",
                "Content-MD5 does not match the body",
                parts.uri.path(),
            );
        }
    }

    let etag = hex::encode(digest);
    upload.parts.lock().insert(
        part_number,
        StoredPart {
            data: body,
            etag: etag.clone(),
        },
    );

    let reported = if consume_atomic(&state.faults.etag_corruptions) {
        "00000000000000000000000000000000".to_owned()
    } else {
        etag
    };
    let mut response = plain_status(StatusCode::OK);
    response.headers_mut().insert(
        ETAG,
        format!("\"{reported}\"").parse().expect("etag header"),
    );
    response
}

fn complete(
    state: &StoreState,
    path: &str,
    upload_id: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    if consume_atomic(&state.faults.complete_failures) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "injected completion failure",
            path,
        );
    }
    if state.faults.complete_error_body.swap(false, SeqCst) {
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Error><Code>InternalError</Code>\
             <Message>completion failed after 200</Message>\
             <Resource>{}</Resource></Error>",
            escape(path),
        );
        return xml_response(StatusCode::OK, body);
    }

    let Some(upload) = state.uploads.get(upload_id).map(|u| Arc::clone(&u)) else {
        return error_response(StatusCode::NOT_FOUND, "NoSuchUpload", "unknown upload id", path);
    };

    let manifest = parse_completion(body);
    if manifest.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MalformedXML",
            "empty completion manifest",
            path,
        );
    }

    let mut assembled = Vec::new();
    {
        let stored = upload.parts.lock();
        for (part_number, etag) in &manifest {
            let Some(part) = stored.get(part_number) else {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "InvalidPart",
                    "listed part was never uploaded",
                    path,
                );
            };
            if part.etag != etag.trim_matches('"') {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "InvalidPart",
                    "listed part etag does not match",
                    path,
                );
            }
            assembled.extend_from_slice(&part.data);
        }
    }

    state.uploads.remove(upload_id);
    let etag = format!("\"{}-{}\"", hex::encode(Md5::digest(&assembled)), manifest.len());
    state.objects.insert(
        upload.path.clone(),
        StoredObject {
            data: Bytes::from(assembled),
            content_type: upload.content_type.clone(),
            modified: Utc::now(),
        },
    );
    state.counters.completes.fetch_add(1, SeqCst);

    let (bucket, key) = split_bucket_key(path);
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <CompleteMultipartUploadResult>\
         <Location>http://mock/{}</Location>\
         <Bucket>{}</Bucket><Key>{}</Key><ETag>{etag}</ETag>\
         </CompleteMultipartUploadResult>",
        escape(key),
        escape(bucket),
        escape(key),
    );
    xml_response(StatusCode::OK, body)
}

fn abort_upload(state: &StoreState, upload_id: &str) -> Response<Full<Bytes>> {
    state.counters.aborts.fetch_add(1, SeqCst);
    if state.uploads.remove(upload_id).is_some() {
        plain_status(StatusCode::NO_CONTENT)
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "NoSuchUpload",
            "unknown upload id",
            "/",
        )
    }
}

fn put_object(
    state: &StoreState,
    parts: &Parts,
    path: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Response<Full<Bytes>> {
    state.objects.insert(
        storage_key(path, query),
        StoredObject {
            data: body,
            content_type: header_str(&parts.headers, CONTENT_TYPE.as_str()).map(ToOwned::to_owned),
            modified: Utc::now(),
        },
    );
    plain_status(StatusCode::OK)
}

fn delete_object(
    state: &StoreState,
    path: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    if state.objects.remove(&storage_key(path, query)).is_some() {
        plain_status(StatusCode::NO_CONTENT)
    } else {
        error_response(StatusCode::NOT_FOUND, "NoSuchKey", "no such key", path)
    }
}

fn head_object(
    state: &StoreState,
    path: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let Some(object) = state.objects.get(&storage_key(path, query)) else {
        return plain_status(StatusCode::NOT_FOUND);
    };

    let mut response = plain_status(StatusCode::OK);
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_LENGTH,
        object.data.len().to_string().parse().expect("length header"),
    );
    headers.insert(
        ETAG,
        format!("\"{}\"", hex::encode(Md5::digest(&object.data)))
            .parse()
            .expect("etag header"),
    );
    if let Some(content_type) = &object.content_type {
        headers.insert(CONTENT_TYPE, content_type.parse().expect("content type"));
    }
    response
}

async fn get_object(
    state: &StoreState,
    path: &str,
    query: &HashMap<String, String>,
    parts: &Parts,
) -> Response<Full<Bytes>> {
    let Some(range) = header_str(&parts.headers, RANGE.as_str()).map(ToOwned::to_owned) else {
        // Whole-object read, used for sidecar fetches.
        let Some(object) = state.objects.get(&storage_key(path, query)) else {
            return error_response(StatusCode::NOT_FOUND, "NoSuchKey", "no such key", path);
        };
        let mut response = full_response(StatusCode::OK, object.data.clone());
        if let Some(content_type) = &object.content_type {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, content_type.parse().expect("content type"));
        }
        return response;
    };

    state.counters.part_fetches.fetch_add(1, SeqCst);
    apply_part_delay(state).await;

    let Some((start, end)) = parse_range(&range) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "InvalidRange",
            "malformed range header",
            path,
        );
    };
    if consume_keyed(&state.faults.fetch_failures, &start) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "InternalError",
            "injected fetch failure",
            path,
        );
    }

    let Some(object) = state.objects.get(&storage_key(path, query)) else {
        return error_response(StatusCode::NOT_FOUND, "NoSuchKey", "no such key", path);
    };
    let total = object.data.len() as u64;
    if start > end || end >= total {
        return error_response(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "InvalidRange",
            "range outside object",
            path,
        );
    }

    let mut slice = object.data.slice(
        usize::try_from(start).expect("range start")..=usize::try_from(end).expect("range end"),
    );
    let truncate = {
        let mut pending = state.faults.truncate_fetch.lock();
        if *pending == Some(start) {
            *pending = None;
            true
        } else {
            false
        }
    };
    if truncate && slice.len() > 1 {
        slice = slice.slice(..slice.len() / 2);
    }

    let mut response = full_response(StatusCode::PARTIAL_CONTENT, slice);
    response.headers_mut().insert(
        CONTENT_RANGE,
        format!("bytes {start}-{end}/{total}")
            .parse()
            .expect("content range"),
    );
    response
}

fn bulk_delete(
    state: &StoreState,
    parts: &Parts,
    path: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    state.counters.bulk_deletes.fetch_add(1, SeqCst);
    let Some(sent) = header_str(&parts.headers, "content-md5") else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MissingContentMD5",
            "bulk delete requires Content-MD5",
            path,
        );
    };
    if sent != STANDARD.encode(Md5::digest(body)) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "BadDigest",
            "Content-MD5 does not match the body",
            path,
        );
    }

    let bucket = path.trim_matches('/');
    let (keys, quiet) = parse_delete(body);
    let denied = state.faults.deny_delete.lock().clone();

    let mut deleted = String::new();
    let mut errors = String::new();
    for (key, version) in keys {
        if denied.contains(&key) {
            errors.push_str(&format!(
                "<Error><Key>{}</Key><Code>AccessDenied</Code>\
                 <Message>denied by test fault</Message></Error>",
                escape(&key),
            ));
            continue;
        }
        let suffix = version
            .as_deref()
            .map(|v| format!("?versionId={v}"))
            .unwrap_or_default();
        state.objects.remove(&format!("/{bucket}/{key}{suffix}"));
        if !quiet {
            deleted.push_str(&format!("<Deleted><Key>{}</Key></Deleted>", escape(&key)));
        }
    }

    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <DeleteResult>{deleted}{errors}</DeleteResult>"
    );
    xml_response(StatusCode::OK, body)
}

fn list_objects(
    state: &StoreState,
    path: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    state.counters.lists.fetch_add(1, SeqCst);
    let bucket = path.trim_matches('/').to_owned();
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let max_keys: usize = query
        .get("max-keys")
        .and_then(|value| value.parse().ok())
        .unwrap_or(1000);
    let after = query.get("continuation-token").cloned();

    let bucket_prefix = format!("/{bucket}/");
    let mut keys: Vec<(String, StoredObject)> = state
        .objects
        .iter()
        .filter_map(|entry| {
            let key = entry.key().strip_prefix(&bucket_prefix)?;
            // Synthetic versioned entries are not part of a listing.
            if key.contains('?') || !key.starts_with(&prefix) {
                return None;
            }
            Some((key.to_owned(), entry.value().clone()))
        })
        .collect();
    keys.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(after) = &after {
        keys.retain(|(key, _)| key > after);
    }

    let truncated = keys.len() > max_keys;
    keys.truncate(max_keys);

    let mut contents = String::new();
    for (key, object) in &keys {
        contents.push_str(&format!(
            "<Contents><Key>{}</Key>\
             <LastModified>{}</LastModified>\
             <ETag>\"{}\"</ETag>\
             <Size>{}</Size>\
             <StorageClass>STANDARD</StorageClass></Contents>",
            escape(key),
            object.modified.to_rfc3339(),
            hex::encode(Md5::digest(&object.data)),
            object.data.len(),
        ));
    }
    let continuation = if truncated {
        keys.last()
            .map(|(key, _)| {
                format!("<NextContinuationToken>{}</NextContinuationToken>", escape(key))
            })
            .unwrap_or_default()
    } else {
        String::new()
    };

    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <ListBucketResult>\
         <Name>{}</Name><Prefix>{}</Prefix>\
         <KeyCount>{}</KeyCount><MaxKeys>{max_keys}</MaxKeys>\
         <IsTruncated>{truncated}</IsTruncated>{continuation}{contents}\
         </ListBucketResult>",
        escape(&bucket),
        escape(&prefix),
        keys.len(),
    );
    xml_response(StatusCode::OK, body)
}

// ---- wire helpers ----

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode_str(key).decode_utf8_lossy().into_owned(),
                percent_decode_str(value).decode_utf8_lossy().into_owned(),
            )
        })
        .collect()
}

fn storage_key(path: &str, query: &HashMap<String, String>) -> String {
    match query.get("versionId") {
        Some(version) => format!("{path}?versionId={version}"),
        None => path.to_owned(),
    }
}

fn split_bucket_key(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    trimmed.split_once('/').unwrap_or((trimmed, ""))
}

/// Parse `bytes=a-b` (inclusive).
fn parse_range(header: &str) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn decode_text(decoder: quick_xml::Decoder, text: &quick_xml::events::BytesText<'_>) -> String {
    let decoded = decoder.decode(text).unwrap_or_default();
    unescape(&decoded)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_else(|_| decoded.into_owned())
}

fn parse_completion(body: &[u8]) -> Vec<(u32, String)> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut manifest = Vec::new();
    let mut tag = Vec::new();
    let mut part_number = 0u32;
    let mut etag = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => tag = e.name().as_ref().to_vec(),
            Ok(Event::Text(text)) => {
                let value = decode_text(reader.decoder(), &text);
                match tag.as_slice() {
                    b"PartNumber" => part_number = value.parse().unwrap_or(0),
                    b"ETag" => etag = value,
                    _ => {}
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"Part" => {
                manifest.push((part_number, std::mem::take(&mut etag)));
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    manifest
}

/// Parse a bulk-delete request into `(key, version)` pairs and the quiet flag.
fn parse_delete(body: &[u8]) -> (Vec<(String, Option<String>)>, bool) {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut keys = Vec::new();
    let mut quiet = false;
    let mut tag = Vec::new();
    let mut key = String::new();
    let mut version = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => tag = e.name().as_ref().to_vec(),
            Ok(Event::Text(text)) => {
                let value = decode_text(reader.decoder(), &text);
                match tag.as_slice() {
                    b"Key" => key = value,
                    b"VersionId" => version = Some(value),
                    b"Quiet" => quiet = value == "true",
                    _ => {}
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"Object" => {
                keys.push((std::mem::take(&mut key), version.take()));
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    (keys, quiet)
}

// ---- fault helpers ----

fn consume_atomic(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(SeqCst, SeqCst, |current| current.checked_sub(1))
        .is_ok()
}

fn consume_keyed<K: std::hash::Hash + Eq>(map: &Mutex<HashMap<K, u32>>, key: &K) -> bool {
    let mut map = map.lock();
    match map.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

async fn apply_part_delay(state: &StoreState) {
    let delay = state
        .faults
        .part_delay_ms
        .lock()
        .clone()
        .map(|range| rand::rng().random_range(range));
    if let Some(ms) = delay {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

// ---- response helpers ----

fn plain_status(status: StatusCode) -> Response<Full<Bytes>> {
    full_response(status, Bytes::new())
}

fn full_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}

fn xml_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = full_response(status, Bytes::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, "application/xml".parse().expect("content type"));
    response
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    resource: &str,
) -> Response<Full<Bytes>> {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Error><Code>{code}</Code><Message>{message}</Message>\
         <Resource>{}</Resource><RequestId>mock-request</RequestId></Error>",
        escape(resource),
    );
    xml_response(status, body)
}
