//! Bounded part scheduler shared by uploads and downloads.
//!
//! A [`PartPool`] runs `concurrency` workers. Tasks enter through a bounded
//! MPMC queue whose capacity equals the worker count, giving natural
//! backpressure at the submission point; outcomes return to the single
//! owning coordinator over a bounded completion channel. Workers retry
//! transient failures per task with exponential backoff; a task that
//! exhausts its budget (or fails permanently) is reported as failed and the
//! owner decides to cancel the whole transfer. Completion order is
//! unspecified; every result carries its part index.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{ETAG, RANGE};
use http::{HeaderValue, Method, StatusCode};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use s3jet_auth::PayloadHash;
use s3jet_auth::canonical::uri_encode;

use crate::error::{Result, S3Error};
use crate::transport::{
    CONTENT_MD5, RequestSpec, Transport, backoff_delay, error_from_response, join_query,
};

/// Address of the object a pool moves parts for.
#[derive(Debug, Clone)]
pub(crate) struct PartTarget {
    pub host: String,
    pub path: String,
    /// Encoded query carried by every part request (`versionId` pass-through).
    pub query: String,
}

/// What a worker does with one part.
#[derive(Debug)]
pub(crate) enum PartOp {
    /// Fetch the byte range `[start, end)`.
    Fetch { start: u64, end: u64 },
    /// Upload a sealed buffer under the session's upload id.
    Upload {
        upload_id: Arc<str>,
        body: Bytes,
        /// Base64 of the raw body digest, sent as `Content-MD5`.
        md5_b64: String,
        /// Hex body digest, checked against the returned ETag.
        md5_hex: String,
    },
}

/// One indexed unit of work.
#[derive(Debug)]
pub(crate) struct PartTask {
    pub index: u64,
    pub op: PartOp,
    /// Held until the owner consumes the part; bounds reassembly memory.
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Successful payload of a part operation.
#[derive(Debug)]
pub(crate) enum PartPayload {
    /// Fetched bytes, exactly the requested range length.
    Bytes(Bytes),
    /// ETag assigned to an uploaded part, as returned by the store.
    Etag(String),
}

/// Outcome of one part task, tagged with its index.
#[derive(Debug)]
pub(crate) struct PartResult {
    pub index: u64,
    pub outcome: Result<PartPayload>,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Handle to the worker set and its intake queue.
#[derive(Debug)]
pub(crate) struct PartPool {
    work_tx: async_channel::Sender<PartTask>,
    workers: JoinSet<()>,
}

impl PartPool {
    /// Spawn `concurrency` workers; results arrive on the returned channel.
    pub(crate) fn spawn(
        transport: Arc<Transport>,
        target: PartTarget,
        concurrency: usize,
        max_attempts: u32,
    ) -> (Self, mpsc::Receiver<PartResult>) {
        let concurrency = concurrency.max(1);
        let (work_tx, work_rx) = async_channel::bounded::<PartTask>(concurrency);
        // Twice the worker count so a worker can always deposit its result
        // even while the owner is blocked submitting new work.
        let (result_tx, result_rx) = mpsc::channel::<PartResult>(concurrency * 2);

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let transport = Arc::clone(&transport);
            let target = target.clone();
            workers.spawn(async move {
                while let Ok(task) = work_rx.recv().await {
                    let PartTask { index, op, permit } = task;
                    let outcome =
                        run_with_retry(&transport, &target, index, &op, max_attempts).await;
                    let result = PartResult {
                        index,
                        outcome,
                        permit,
                    };
                    if result_tx.send(result).await.is_err() {
                        // Owner is gone; nothing left to report to.
                        break;
                    }
                }
                debug!(worker, "Part worker exiting");
            });
        }

        (Self { work_tx, workers }, result_rx)
    }

    /// A submission handle for the intake queue.
    pub(crate) fn sender(&self) -> async_channel::Sender<PartTask> {
        self.work_tx.clone()
    }

    /// Stop admitting tasks; queued and in-flight tasks still complete.
    pub(crate) fn close_intake(&self) {
        self.work_tx.close();
    }

    /// Cancel everything: close the intake and abort all workers.
    pub(crate) fn abort(&mut self) {
        self.work_tx.close();
        self.workers.abort_all();
    }
}

/// Run one part operation under the retry policy.
///
/// Transient failures sleep with exponential backoff and try again with
/// identical parameters. The returned error wraps the final attempt's error
/// together with the attempt count.
async fn run_with_retry(
    transport: &Transport,
    target: &PartTarget,
    index: u64,
    op: &PartOp,
    max_attempts: u32,
) -> Result<PartPayload> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match run_once(transport, target, index, op).await {
            Ok(payload) => {
                if attempt > 1 {
                    debug!(index, attempt, "Part recovered after retry");
                }
                return Ok(payload);
            }
            Err(error) if attempt < max_attempts && error.is_transient() => {
                warn!(index, attempt, error = %error, "Transient part failure, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(error) => {
                return Err(S3Error::PartFailed {
                    index,
                    attempts: attempt,
                    source: Box::new(error),
                });
            }
        }
    }
}

async fn run_once(
    transport: &Transport,
    target: &PartTarget,
    index: u64,
    op: &PartOp,
) -> Result<PartPayload> {
    match op {
        PartOp::Fetch { start, end } => fetch_range(transport, target, *start, *end).await,
        PartOp::Upload {
            upload_id,
            body,
            md5_b64,
            md5_hex,
        } => upload_part(transport, target, index, upload_id, body, md5_b64, md5_hex).await,
    }
}

/// Fetch `[start, end)` with a ranged GET. Requires a 206 with a body of
/// exactly the requested length; anything else is a permanent error.
async fn fetch_range(
    transport: &Transport,
    target: &PartTarget,
    start: u64,
    end: u64,
) -> Result<PartPayload> {
    let mut spec = RequestSpec::new(
        Method::GET,
        target.host.clone(),
        target.path.clone(),
        target.query.clone(),
    );
    let range = format!("bytes={start}-{}", end - 1);
    spec.headers.insert(
        RANGE,
        HeaderValue::from_str(&range).map_err(|_| S3Error::UnexpectedResponse {
            reason: format!("unrepresentable range header: {range}"),
        })?,
    );

    let response = transport.send(&spec).await?;
    let status = response.status();
    if status != StatusCode::PARTIAL_CONTENT {
        if status.is_client_error() || status.is_server_error() {
            return Err(error_from_response(response).await);
        }
        return Err(S3Error::UnexpectedResponse {
            reason: format!("range request answered with {status}, expected 206"),
        });
    }

    let bytes = response.bytes().await?;
    let expected = end - start;
    if bytes.len() as u64 != expected {
        return Err(S3Error::UnexpectedResponse {
            reason: format!(
                "range {start}-{} returned {} bytes, expected {expected}",
                end - 1,
                bytes.len()
            ),
        });
    }
    Ok(PartPayload::Bytes(bytes))
}

/// Upload one sealed part. The store recomputes the digest from the
/// `Content-MD5` header, and the returned ETag is cross-checked against the
/// part digest; a mismatch is transient and re-uploads the same bytes.
async fn upload_part(
    transport: &Transport,
    target: &PartTarget,
    index: u64,
    upload_id: &str,
    body: &Bytes,
    md5_b64: &str,
    md5_hex: &str,
) -> Result<PartPayload> {
    // Part numbers are 1-based on the wire.
    let part_query = format!("partNumber={}&uploadId={}", index + 1, uri_encode(upload_id));
    let mut spec = RequestSpec::new(
        Method::PUT,
        target.host.clone(),
        target.path.clone(),
        join_query(&target.query, &part_query),
    );
    spec.headers.insert(
        CONTENT_MD5,
        HeaderValue::from_str(md5_b64).map_err(|_| S3Error::Protocol {
            reason: "part digest is not a valid header value".to_owned(),
        })?,
    );
    spec.body = Some(body.clone());
    spec.payload = PayloadHash::Unsigned;

    let response = transport.send(&spec).await?;
    if response.status() != StatusCode::OK {
        return Err(error_from_response(response).await);
    }

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| S3Error::UnexpectedResponse {
            reason: "part upload response missing ETag".to_owned(),
        })?;

    let bare = etag.trim_matches('"');
    if !bare.eq_ignore_ascii_case(md5_hex) {
        return Err(S3Error::EtagMismatch {
            index,
            sent: md5_hex.to_owned(),
            received: bare.to_owned(),
        });
    }

    Ok(PartPayload::Etag(etag))
}
