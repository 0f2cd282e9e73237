//! Parallel streaming downloads.
//!
//! [`ObjectReader`] exposes an object as [`tokio::io::AsyncRead`]. Behind it,
//! a feeder task slices the object into fixed-size ranges and a worker pool
//! fetches them concurrently; a coordinator reorders completed ranges by part
//! index and delivers bytes strictly in object order. A semaphore window the
//! size of the worker count caps how many fetched-but-undelivered parts can
//! exist, so one slow range cannot balloon the reorder buffer.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method, StatusCode};
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::bucket::ObjectLocation;
use crate::config::Config;
use crate::error::{Result, S3Error};
use crate::pool::{PartOp, PartPayload, PartPool, PartResult, PartTarget, PartTask};
use crate::transport::{RequestSpec, Transport};

/// A fetched part waiting for its turn in the output stream.
struct SequencedPart {
    index: u64,
    bytes: Bytes,
    /// Released when the part leaves the reorder buffer.
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl PartialEq for SequencedPart {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for SequencedPart {}

impl PartialOrd for SequencedPart {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequencedPart {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

/// Min-heap reassembly buffer keyed by part index.
struct Sequencer {
    heap: BinaryHeap<Reverse<SequencedPart>>,
    next: u64,
}

impl Sequencer {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next: 0,
        }
    }

    fn push(&mut self, part: SequencedPart) {
        self.heap.push(Reverse(part));
    }

    /// The next in-order part, if it has arrived.
    fn pop_ready(&mut self) -> Option<SequencedPart> {
        match self.heap.peek() {
            Some(Reverse(part)) if part.index == self.next => {
                self.next += 1;
                self.heap.pop().map(|Reverse(part)| part)
            }
            _ => None,
        }
    }
}

/// Adapter turning the ordered delivery channel into a byte stream.
struct ChunkStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Stream for ChunkStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Streaming, in-order view of one object.
///
/// Read it like any async byte source. After EOF (or at any earlier point),
/// call [`ObjectReader::close`] to learn the terminal status of the
/// transfer, including checksum verification; dropping the reader instead
/// cancels any remaining work.
pub struct ObjectReader {
    inner: StreamReader<ChunkStream, Bytes>,
    headers: HeaderMap,
    size: u64,
    coordinator: JoinHandle<Result<()>>,
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl ObjectReader {
    /// Response headers from the initial metadata probe.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Total object size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finish the download and report its terminal status.
    ///
    /// Returns an error if any part failed permanently or if the assembled
    /// stream did not match the stored checksum. Closing before EOF cancels
    /// the remaining transfer and reports success for the delivered prefix.
    pub async fn close(self) -> Result<()> {
        drop(self.inner);
        match self.coordinator.await {
            Ok(result) => result,
            Err(join_error) => Err(S3Error::Protocol {
                reason: format!("download coordinator failed: {join_error}"),
            }),
        }
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Probe the object and start the parallel fetch pipeline.
pub(crate) async fn new_reader(
    transport: Arc<Transport>,
    location: ObjectLocation,
    display_path: String,
    config: &Config,
    expected_md5: Option<String>,
) -> Result<ObjectReader> {
    let head = RequestSpec::new(
        Method::HEAD,
        location.host.clone(),
        location.path.clone(),
        location.query.clone(),
    );
    let response = transport
        .send_checked_retry(&head, StatusCode::OK, config.max_attempts)
        .await?;
    let headers = response.headers().clone();
    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| S3Error::UnexpectedResponse {
            reason: "missing Content-Length in HEAD response".to_owned(),
        })?;

    let part_size = config.part_size;
    let n_parts = size.div_ceil(part_size);
    debug!(path = %display_path, size, n_parts, "Starting parallel download");

    let target = PartTarget {
        host: location.host,
        path: location.path,
        query: location.query,
    };
    let (pool, results_rx) = PartPool::spawn(
        Arc::clone(&transport),
        target,
        config.concurrency,
        config.max_attempts,
    );

    // One permit per worker; a permit rides with its part from fetch until
    // ordered delivery, bounding the reorder buffer to the window size.
    let window = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let work_tx = pool.sender();
    let feeder_window = Arc::clone(&window);
    let feeder = tokio::spawn(async move {
        for index in 0..n_parts {
            let Ok(permit) = Arc::clone(&feeder_window).acquire_owned().await else {
                break;
            };
            let start = index * part_size;
            let end = (start + part_size).min(size);
            let task = PartTask {
                index,
                op: PartOp::Fetch { start, end },
                permit: Some(permit),
            };
            if work_tx.send(task).await.is_err() {
                break;
            }
        }
        work_tx.close();
    });

    let (delivery_tx, delivery_rx) = mpsc::channel::<io::Result<Bytes>>(config.concurrency.max(1));
    let coordinator = tokio::spawn(coordinate(
        pool,
        feeder,
        window,
        results_rx,
        delivery_tx,
        n_parts,
        display_path,
        expected_md5,
    ));

    Ok(ObjectReader {
        inner: StreamReader::new(ChunkStream { rx: delivery_rx }),
        headers,
        size,
        coordinator,
    })
}

/// Reorder part results and deliver bytes in object order.
#[allow(clippy::too_many_arguments)]
async fn coordinate(
    mut pool: PartPool,
    feeder: JoinHandle<()>,
    window: Arc<Semaphore>,
    mut results_rx: mpsc::Receiver<PartResult>,
    delivery_tx: mpsc::Sender<io::Result<Bytes>>,
    n_parts: u64,
    display_path: String,
    expected_md5: Option<String>,
) -> Result<()> {
    let cancel = |pool: &mut PartPool| {
        window.close();
        pool.abort();
        feeder.abort();
    };

    let mut sequencer = Sequencer::new();
    let mut digest = Md5::new();
    let mut delivered = 0u64;

    while delivered < n_parts {
        let result = tokio::select! {
            result = results_rx.recv() => result,
            () = delivery_tx.closed() => {
                // Reader dropped; stop fetching.
                cancel(&mut pool);
                return Ok(());
            }
        };
        match result {
            Some(PartResult {
                index,
                outcome: Ok(PartPayload::Bytes(bytes)),
                permit,
            }) => {
                sequencer.push(SequencedPart {
                    index,
                    bytes,
                    _permit: permit,
                });
                while let Some(part) = sequencer.pop_ready() {
                    let SequencedPart { bytes, _permit, .. } = part;
                    digest.update(&bytes);
                    if delivery_tx.send(Ok(bytes)).await.is_err() {
                        cancel(&mut pool);
                        return Ok(());
                    }
                    delivered += 1;
                }
            }
            Some(PartResult {
                outcome: Ok(PartPayload::Etag(_)),
                ..
            }) => {
                cancel(&mut pool);
                return Err(S3Error::Protocol {
                    reason: "fetch pool produced an upload result".to_owned(),
                });
            }
            Some(PartResult {
                outcome: Err(error),
                ..
            }) => {
                warn!(path = %display_path, error = %error, "Download failed");
                cancel(&mut pool);
                let message = error.to_string();
                let _ = delivery_tx.send(Err(io::Error::other(message))).await;
                return Err(error);
            }
            None => {
                cancel(&mut pool);
                return Err(S3Error::Protocol {
                    reason: "part workers stopped before the object was fully fetched".to_owned(),
                });
            }
        }
    }

    // EOF for the reader side.
    drop(delivery_tx);

    if let Some(expected) = expected_md5 {
        let actual = hex::encode(digest.finalize());
        let expected = expected.trim();
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(S3Error::ChecksumMismatch {
                path: display_path,
                expected: expected.to_owned(),
                actual,
            });
        }
        debug!(path = %display_path, md5 = %actual, "Checksum verified");
    }
    Ok(())
}
