//! Parallel streaming uploads.
//!
//! [`ObjectWriter`] buffers written bytes into fixed-size parts and hands
//! each sealed part to a worker pool that uploads it concurrently under one
//! multipart session. The session is started lazily when the first part is
//! sealed, so a writer that is aborted before buffering a full part never
//! touches the store. [`ObjectWriter::finish`] seals the tail, drains the
//! pool, and sends the completion manifest; any failure along the way aborts
//! the session on the store so no orphaned parts accrue charges.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use md5::{Digest, Md5};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use s3jet_auth::PayloadHash;
use s3jet_auth::canonical::uri_encode;
use s3jet_xml::types::{
    CompleteMultipartUpload, CompleteMultipartUploadResult, CompletedPart, ErrorResponse,
    InitiateMultipartUploadResult,
};
use s3jet_xml::{from_xml, to_xml};

use crate::bucket::ObjectLocation;
use crate::config::Config;
use crate::error::{Result, S3Error};
use crate::pool::{PartOp, PartPayload, PartPool, PartResult, PartTarget, PartTask};
use crate::sidecar;
use crate::transport::{RequestSpec, Transport, join_query};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Failed,
    Finished,
    Aborted,
}

/// Live multipart session: one pool of upload workers bound to an upload id.
struct Session {
    upload_id: Arc<str>,
    pool: PartPool,
    work_tx: async_channel::Sender<PartTask>,
    results_rx: mpsc::Receiver<PartResult>,
}

/// Streaming writer that stores an object as a multipart upload.
///
/// Write bytes in any chunking; parts are sealed every `part_size` bytes and
/// uploaded concurrently. Call [`ObjectWriter::finish`] to complete the
/// object or [`ObjectWriter::abort`] to discard it. Dropping an open writer
/// aborts the session in the background when a runtime is available.
pub struct ObjectWriter {
    transport: Arc<Transport>,
    location: ObjectLocation,
    sidecar_location: Option<ObjectLocation>,
    display_path: String,
    initiate_headers: HeaderMap,
    config: Config,
    part_len: usize,
    state: WriterState,
    session: Option<Session>,
    buffer: BytesMut,
    next_index: u64,
    submitted: u64,
    manifest: BTreeMap<u64, String>,
    digest: Md5,
    abort_sent: bool,
}

impl fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("path", &self.display_path)
            .field("state", &self.state)
            .field("parts_sealed", &self.next_index)
            .finish_non_exhaustive()
    }
}

/// Build an open writer; no request is sent until the first part seals.
pub(crate) fn new_writer(
    transport: Arc<Transport>,
    location: ObjectLocation,
    sidecar_location: Option<ObjectLocation>,
    display_path: String,
    initiate_headers: HeaderMap,
    config: Config,
) -> Result<ObjectWriter> {
    let part_len = usize::try_from(config.part_size).map_err(|_| S3Error::Config {
        reason: format!(
            "part size {} does not fit this platform's address space",
            config.part_size
        ),
    })?;
    Ok(ObjectWriter {
        transport,
        location,
        sidecar_location,
        display_path,
        initiate_headers,
        config,
        part_len,
        state: WriterState::Open,
        session: None,
        buffer: BytesMut::new(),
        next_index: 0,
        submitted: 0,
        manifest: BTreeMap::new(),
        digest: Md5::new(),
        abort_sent: false,
    })
}

impl ObjectWriter {
    /// Append bytes to the object.
    ///
    /// Backpressure applies once all workers are busy and the intake queue
    /// is full. Any part's permanent failure fails the writer and aborts the
    /// session; afterwards only [`ObjectWriter::abort`] (a no-op) succeeds.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        match self.write_inner(data).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.fail().await;
                Err(error)
            }
        }
    }

    /// Seal the tail, wait for all parts, and complete the multipart upload.
    ///
    /// A writer that never received any bytes still stores a zero-byte
    /// object. When checksum publication is enabled, the whole-object MD5 is
    /// written to the checksum sidecar after completion.
    pub async fn finish(&mut self) -> Result<()> {
        self.ensure_open()?;
        match self.do_finish().await {
            Ok(()) => {
                self.state = WriterState::Finished;
                Ok(())
            }
            Err(error) => {
                self.fail().await;
                Err(error)
            }
        }
    }

    /// Discard the upload and free all stored parts.
    ///
    /// Safe to call repeatedly; the abort request is sent at most once. A
    /// writer that already finished cannot be aborted.
    pub async fn abort(&mut self) -> Result<()> {
        match self.state {
            WriterState::Finished => Err(S3Error::Protocol {
                reason: "upload already completed; nothing to abort".to_owned(),
            }),
            WriterState::Aborted | WriterState::Failed => Ok(()),
            WriterState::Open => {
                self.state = WriterState::Aborted;
                if let Some(mut session) = self.session.take() {
                    session.pool.abort();
                    if !self.abort_sent {
                        self.abort_sent = true;
                        send_abort(
                            &self.transport,
                            &self.location,
                            &session.upload_id,
                            self.config.max_attempts,
                        )
                        .await?;
                    }
                }
                Ok(())
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Failed => Err(S3Error::Protocol {
                reason: "writer already failed; the upload was aborted".to_owned(),
            }),
            WriterState::Finished => Err(S3Error::Protocol {
                reason: "writer already finished".to_owned(),
            }),
            WriterState::Aborted => Err(S3Error::Protocol {
                reason: "writer already aborted".to_owned(),
            }),
        }
    }

    async fn write_inner(&mut self, data: &[u8]) -> Result<()> {
        self.digest.update(data);
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.part_len {
            let body = self.buffer.split_to(self.part_len).freeze();
            self.submit_part(body).await?;
        }
        Ok(())
    }

    /// Start the multipart session if this is the first sealed part.
    async fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut spec = RequestSpec::new(
            Method::POST,
            self.location.host.clone(),
            self.location.path.clone(),
            join_query(&self.location.query, "uploads"),
        );
        spec.headers = self.initiate_headers.clone();
        let response = self
            .transport
            .send_checked_retry(&spec, StatusCode::OK, self.config.max_attempts)
            .await?;
        let body = response.bytes().await?;
        let initiated: InitiateMultipartUploadResult = from_xml(&body)?;
        debug!(
            path = %self.display_path,
            upload_id = %initiated.upload_id,
            "Multipart upload started"
        );

        let target = PartTarget {
            host: self.location.host.clone(),
            path: self.location.path.clone(),
            query: self.location.query.clone(),
        };
        let (pool, results_rx) = PartPool::spawn(
            Arc::clone(&self.transport),
            target,
            self.config.concurrency,
            self.config.max_attempts,
        );
        let work_tx = pool.sender();
        self.session = Some(Session {
            upload_id: Arc::from(initiated.upload_id.as_str()),
            pool,
            work_tx,
            results_rx,
        });
        Ok(())
    }

    /// Queue one sealed part, draining finished results while the queue is
    /// full so submission and completion cannot deadlock.
    async fn submit_part(&mut self, body: Bytes) -> Result<()> {
        self.ensure_session().await?;
        let Some(session) = self.session.as_mut() else {
            return Err(S3Error::Protocol {
                reason: "part submitted without an upload session".to_owned(),
            });
        };

        let index = self.next_index;
        let raw = Md5::digest(&body);
        let mut task = PartTask {
            index,
            op: PartOp::Upload {
                upload_id: Arc::clone(&session.upload_id),
                body,
                md5_b64: STANDARD.encode(raw),
                md5_hex: hex::encode(raw),
            },
            permit: None,
        };
        loop {
            match session.work_tx.try_send(task) {
                Ok(()) => break,
                Err(async_channel::TrySendError::Full(returned)) => {
                    task = returned;
                    match session.results_rx.recv().await {
                        Some(result) => record(&mut self.manifest, result)?,
                        None => {
                            return Err(S3Error::Protocol {
                                reason: "upload workers stopped while accepting parts".to_owned(),
                            });
                        }
                    }
                }
                Err(async_channel::TrySendError::Closed(_)) => {
                    return Err(S3Error::Protocol {
                        reason: "upload intake closed while the writer was open".to_owned(),
                    });
                }
            }
        }
        self.next_index += 1;
        self.submitted += 1;
        Ok(())
    }

    async fn do_finish(&mut self) -> Result<()> {
        // The tail is usually short; an object smaller than one part becomes
        // a single part, and an empty object becomes a single empty part.
        if !self.buffer.is_empty() || self.next_index == 0 {
            let body = self.buffer.split().freeze();
            self.submit_part(body).await?;
        }

        let Some(session) = self.session.as_mut() else {
            return Err(S3Error::Protocol {
                reason: "no upload session at completion".to_owned(),
            });
        };
        session.pool.close_intake();
        while (self.manifest.len() as u64) < self.submitted {
            match session.results_rx.recv().await {
                Some(result) => record(&mut self.manifest, result)?,
                None => {
                    return Err(S3Error::Protocol {
                        reason: "completion manifest is missing part results".to_owned(),
                    });
                }
            }
        }
        let upload_id = Arc::clone(&session.upload_id);

        let mut completion = CompleteMultipartUpload::default();
        for (&index, etag) in &self.manifest {
            let part_number = u32::try_from(index + 1).map_err(|_| S3Error::Protocol {
                reason: "part index exceeds the wire format".to_owned(),
            })?;
            completion.parts.push(CompletedPart {
                part_number,
                e_tag: etag.clone(),
            });
        }
        let body = Bytes::from(to_xml("CompleteMultipartUpload", &completion)?);

        let mut spec = RequestSpec::new(
            Method::POST,
            self.location.host.clone(),
            self.location.path.clone(),
            join_query(
                &self.location.query,
                &format!("uploadId={}", uri_encode(&upload_id)),
            ),
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

        // Stores may answer 200 with an error document instead of a result.
        let completed: CompleteMultipartUploadResult = from_xml(&raw)?;
        if completed.e_tag.is_empty() {
            if let Ok(error) = from_xml::<ErrorResponse>(&raw) {
                if !error.code.is_empty() {
                    return Err(S3Error::Service {
                        status: StatusCode::OK,
                        code: error.code,
                        message: error.message,
                        request_id: error.request_id,
                    });
                }
            }
            return Err(S3Error::UnexpectedResponse {
                reason: "completion response missing ETag".to_owned(),
            });
        }
        debug!(
            path = %self.display_path,
            parts = self.manifest.len(),
            etag = %completed.e_tag,
            "Multipart upload completed"
        );

        // The upload is durable; later failures must not trigger an abort.
        self.session = None;

        if self.config.verify_checksums {
            if let Some(sidecar_location) = self.sidecar_location.clone() {
                let md5_hex = hex::encode(self.digest.clone().finalize());
                sidecar::publish(
                    &self.transport,
                    &sidecar_location,
                    &md5_hex,
                    self.config.max_attempts,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Tear down after an unrecoverable error: stop workers and abort the
    /// session on the store, keeping the original error for the caller.
    async fn fail(&mut self) {
        self.state = WriterState::Failed;
        if let Some(mut session) = self.session.take() {
            session.pool.abort();
            if !self.abort_sent {
                self.abort_sent = true;
                if let Err(error) = send_abort(
                    &self.transport,
                    &self.location,
                    &session.upload_id,
                    self.config.max_attempts,
                )
                .await
                {
                    warn!(path = %self.display_path, error = %error, "Abort request failed");
                }
            }
        }
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if self.state != WriterState::Open || self.abort_sent {
            return;
        }
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.abort_sent = true;
        let transport = Arc::clone(&self.transport);
        let location = self.location.clone();
        let display_path = self.display_path.clone();
        let max_attempts = self.config.max_attempts;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    session.pool.abort();
                    let result = send_abort(
                        &transport,
                        &location,
                        &session.upload_id,
                        max_attempts,
                    )
                    .await;
                    if let Err(error) = result {
                        warn!(path = %display_path, error = %error, "Abort on drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    path = %display_path,
                    "Writer dropped outside a runtime; multipart upload left open"
                );
            }
        }
    }
}

/// Fold one pool result into the completion manifest.
fn record(manifest: &mut BTreeMap<u64, String>, result: PartResult) -> Result<()> {
    match result.outcome {
        Ok(PartPayload::Etag(etag)) => {
            manifest.insert(result.index, etag);
            Ok(())
        }
        Ok(PartPayload::Bytes(_)) => Err(S3Error::Protocol {
            reason: "upload pool produced a fetch result".to_owned(),
        }),
        Err(error) => Err(error),
    }
}

async fn send_abort(
    transport: &Transport,
    location: &ObjectLocation,
    upload_id: &str,
    max_attempts: u32,
) -> Result<()> {
    let spec = RequestSpec::new(
        Method::DELETE,
        location.host.clone(),
        location.path.clone(),
        join_query(
            &location.query,
            &format!("uploadId={}", uri_encode(upload_id)),
        ),
    );
    transport
        .send_checked_retry(&spec, StatusCode::NO_CONTENT, max_attempts)
        .await?;
    Ok(())
}
