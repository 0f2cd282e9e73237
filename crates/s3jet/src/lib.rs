//! Parallel streaming transfers for S3-compatible object stores.
//!
//! s3jet moves large objects fast by splitting them into fixed-size parts
//! and transferring the parts concurrently. Uploads stream through the
//! multipart upload protocol and are completed atomically; downloads issue
//! ranged reads and reassemble them strictly in object order, so both sides
//! run at full parallelism while callers see plain sequential byte streams.
//! Whole-object MD5 digests are published to checksum sidecar objects on
//! upload and verified end to end on download.
//!
//! Every request is signed with AWS Signature Version 4, and transient
//! failures (connection errors, 5xx, throttling) are retried per part with
//! exponential backoff, so a single flaky part does not sink a transfer.
//!
//! # Quick start
//!
//! ```no_run
//! use http::HeaderMap;
//! use s3jet::{Bucket, Config, Credentials, Endpoint};
//! use tokio::io::AsyncReadExt;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials::from_env()?;
//! let bucket = Bucket::new("jet-data", credentials, Endpoint::default(), Config::default())?;
//!
//! let mut writer = bucket.put_writer("logs/day.gz", HeaderMap::new())?;
//! writer.write(b"payload").await?;
//! writer.finish().await?;
//!
//! let mut reader = bucket.get_reader("logs/day.gz").await?;
//! let mut contents = Vec::new();
//! reader.read_to_end(&mut contents).await?;
//! reader.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod config;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod get;
pub mod put;

mod pool;
mod sidecar;
mod transport;

pub use bucket::Bucket;
pub use config::{Config, Scheme};
pub use credentials::{Credentials, ProvideCredentials};
pub use endpoint::Endpoint;
pub use error::{Result, S3Error};
pub use get::ObjectReader;
pub use put::ObjectWriter;
pub use s3jet_xml::types::{DeleteErrorEntry, DeleteResult, DeletedObject, ObjectSummary};
