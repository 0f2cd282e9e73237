//! S3 XML wire codec for `s3jet`.
//!
//! This crate handles conversion between the client's model types and the XML
//! wire format of the S3 REST protocol. Request bodies (multipart completion,
//! multi-object delete) are serialized; response bodies (upload initiation,
//! listings, delete results, error documents) are parsed.
//!
//! # Key components
//!
//! - [`S3Serialize`] trait and [`to_xml`] function for building request bodies
//! - [`S3Deserialize`] trait and [`from_xml`] function for parsing response bodies
//! - [`types`] module with the exchanged document types
//!
//! # S3 XML conventions
//!
//! - Namespace: `http://s3.amazonaws.com/doc/2006-03-01/`
//! - Booleans: lowercase `true`/`false`
//! - Timestamps: ISO 8601 format (`2006-02-03T16:45:09.000Z`)
//! - XML declaration: `<?xml version="1.0" encoding="UTF-8"?>`

pub mod deserialize;
pub mod error;
pub mod serialize;
pub mod types;

pub use deserialize::{S3Deserialize, from_xml};
pub use error::XmlError;
pub use serialize::{S3_NAMESPACE, S3Serialize, to_xml};
