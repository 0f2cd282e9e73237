//! S3 XML deserialization: parsing response bodies into typed values.
//!
//! This module provides the [`S3Deserialize`] trait and implementations for the
//! response bodies the client consumes. The deserialization follows the AWS S3
//! RestXml protocol conventions and tolerates unknown elements, since services
//! add response fields over time.

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::XmlError;
use crate::types::{
    CompleteMultipartUploadResult, DeleteErrorEntry, DeleteResult, DeletedObject, ErrorResponse,
    InitiateMultipartUploadResult, ListBucketResult, ObjectSummary,
};

/// Trait for deserializing S3 response types from XML.
///
/// Implementors parse XML elements from the reader and populate the struct fields.
/// The root element has already been consumed by the caller; the implementation
/// reads child elements until the matching end tag.
pub trait S3Deserialize: Sized {
    /// Deserialize an instance from the given XML reader.
    ///
    /// The reader is positioned just after the opening tag of this element.
    /// The implementation should read all child content and return when
    /// the matching end tag is consumed.
    ///
    /// # Errors
    ///
    /// Returns `XmlError` if the XML is malformed or required fields are missing.
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError>;
}

/// Deserialize S3-compatible XML into a typed value.
///
/// Finds the root element and delegates to the type's `S3Deserialize` implementation.
///
/// # Errors
///
/// Returns `XmlError` if the XML is malformed or deserialization fails.
pub fn from_xml<T: S3Deserialize>(xml: &[u8]) -> Result<T, XmlError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    // Skip the XML declaration and find the root element.
    loop {
        match reader.read_event()? {
            Event::Start(_) => {
                return T::deserialize_xml(&mut reader);
            }
            Event::Eof => {
                return Err(XmlError::MissingElement("root element".to_string()));
            }
            // Skip declaration, comments, processing instructions, whitespace.
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Helper functions for reading common XML patterns
// ---------------------------------------------------------------------------

/// Read the text content of the current element and consume its end tag.
///
/// Expects the reader to be positioned right after a `Start` event. Reads
/// the text content and consumes through the matching `End` event.
fn read_text_content(reader: &mut Reader<&[u8]>) -> Result<String, XmlError> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(e) => {
                let decoded = reader
                    .decoder()
                    .decode(&e)
                    .map_err(|err| XmlError::ParseError(err.to_string()))?;
                let unescaped = quick_xml::escape::unescape(&decoded)
                    .map_err(|err| XmlError::ParseError(err.to_string()))?;
                text.push_str(&unescaped);
            }
            Event::End(_) => {
                return Ok(text);
            }
            Event::Eof => {
                return Err(XmlError::UnexpectedElement(
                    "unexpected EOF while reading text content".to_string(),
                ));
            }
            _ => {}
        }
    }
}

/// Skip over an element and all its children.
fn skip_element(reader: &mut Reader<&[u8]>) -> Result<(), XmlError> {
    let mut depth: u32 = 1;
    loop {
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => {
                return Err(XmlError::UnexpectedElement(
                    "unexpected EOF while skipping element".to_string(),
                ));
            }
            _ => {}
        }
    }
}

/// Parse a boolean from XML text ("true"/"false").
fn parse_bool(s: &str) -> Result<bool, XmlError> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(XmlError::ParseError(format!("invalid boolean: {s}"))),
    }
}

/// Parse an i32 from XML text.
fn parse_i32(s: &str) -> Result<i32, XmlError> {
    s.parse::<i32>()
        .map_err(|e| XmlError::ParseError(format!("invalid i32 '{s}': {e}")))
}

/// Parse an i64 from XML text.
fn parse_i64(s: &str) -> Result<i64, XmlError> {
    s.parse::<i64>()
        .map_err(|e| XmlError::ParseError(format!("invalid i64 '{s}': {e}")))
}

/// Parse an ISO 8601 timestamp from XML text.
fn parse_timestamp(s: &str) -> Result<chrono::DateTime<chrono::Utc>, XmlError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .or_else(|_| {
            // Try parsing the S3 format: 2006-02-03T16:45:09.000Z
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ")
                .map(|ndt| ndt.and_utc())
        })
        .map_err(|e| XmlError::ParseError(format!("invalid timestamp '{s}': {e}")))
}

// ---------------------------------------------------------------------------
// S3Deserialize implementations for response bodies
// ---------------------------------------------------------------------------

impl S3Deserialize for InitiateMultipartUploadResult {
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut bucket = None;
        let mut key = None;
        let mut upload_id = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = e.name();
                    let tag_name = std::str::from_utf8(name.as_ref())
                        .map_err(|e| XmlError::ParseError(e.to_string()))?;
                    match tag_name {
                        "Bucket" => bucket = Some(read_text_content(reader)?),
                        "Key" => key = Some(read_text_content(reader)?),
                        "UploadId" => upload_id = Some(read_text_content(reader)?),
                        _ => skip_element(reader)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(XmlError::UnexpectedElement(
                        "unexpected EOF in InitiateMultipartUploadResult".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(InitiateMultipartUploadResult {
            bucket: bucket.unwrap_or_default(),
            key: key.unwrap_or_default(),
            upload_id: upload_id
                .ok_or_else(|| XmlError::MissingElement("UploadId".to_string()))?,
        })
    }
}

impl S3Deserialize for CompleteMultipartUploadResult {
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut location = None;
        let mut bucket = None;
        let mut key = None;
        let mut e_tag = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = e.name();
                    let tag_name = std::str::from_utf8(name.as_ref())
                        .map_err(|e| XmlError::ParseError(e.to_string()))?;
                    match tag_name {
                        "Location" => location = Some(read_text_content(reader)?),
                        "Bucket" => bucket = Some(read_text_content(reader)?),
                        "Key" => key = Some(read_text_content(reader)?),
                        "ETag" => e_tag = Some(read_text_content(reader)?),
                        _ => skip_element(reader)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(XmlError::UnexpectedElement(
                        "unexpected EOF in CompleteMultipartUploadResult".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(CompleteMultipartUploadResult {
            location,
            bucket: bucket.unwrap_or_default(),
            key: key.unwrap_or_default(),
            e_tag: e_tag.unwrap_or_default(),
        })
    }
}

impl S3Deserialize for DeletedObject {
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut key = None;
        let mut version_id = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = e.name();
                    let tag_name = std::str::from_utf8(name.as_ref())
                        .map_err(|e| XmlError::ParseError(e.to_string()))?;
                    match tag_name {
                        "Key" => key = Some(read_text_content(reader)?),
                        "VersionId" => version_id = Some(read_text_content(reader)?),
                        _ => skip_element(reader)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(XmlError::UnexpectedElement(
                        "unexpected EOF in Deleted".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(DeletedObject {
            key: key.unwrap_or_default(),
            version_id,
        })
    }
}

impl S3Deserialize for DeleteErrorEntry {
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut key = None;
        let mut code = None;
        let mut message = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = e.name();
                    let tag_name = std::str::from_utf8(name.as_ref())
                        .map_err(|e| XmlError::ParseError(e.to_string()))?;
                    match tag_name {
                        "Key" => key = Some(read_text_content(reader)?),
                        "Code" => code = Some(read_text_content(reader)?),
                        "Message" => message = Some(read_text_content(reader)?),
                        _ => skip_element(reader)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(XmlError::UnexpectedElement(
                        "unexpected EOF in Error".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(DeleteErrorEntry {
            key: key.unwrap_or_default(),
            code: code.unwrap_or_default(),
            message: message.unwrap_or_default(),
        })
    }
}

impl S3Deserialize for DeleteResult {
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut deleted = Vec::new();
        let mut errors = Vec::new();

        // Deleted and Error entries repeat directly under the root element.
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = e.name();
                    let tag_name = std::str::from_utf8(name.as_ref())
                        .map_err(|e| XmlError::ParseError(e.to_string()))?;
                    match tag_name {
                        "Deleted" => deleted.push(DeletedObject::deserialize_xml(reader)?),
                        "Error" => errors.push(DeleteErrorEntry::deserialize_xml(reader)?),
                        _ => skip_element(reader)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(XmlError::UnexpectedElement(
                        "unexpected EOF in DeleteResult".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(DeleteResult { deleted, errors })
    }
}

impl S3Deserialize for ObjectSummary {
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut key = None;
        let mut last_modified = None;
        let mut e_tag = None;
        let mut size = None;
        let mut storage_class = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = e.name();
                    let tag_name = std::str::from_utf8(name.as_ref())
                        .map_err(|e| XmlError::ParseError(e.to_string()))?;
                    match tag_name {
                        "Key" => key = Some(read_text_content(reader)?),
                        "LastModified" => {
                            last_modified = Some(parse_timestamp(&read_text_content(reader)?)?);
                        }
                        "ETag" => e_tag = Some(read_text_content(reader)?),
                        "Size" => size = Some(parse_i64(&read_text_content(reader)?)?),
                        "StorageClass" => storage_class = Some(read_text_content(reader)?),
                        _ => skip_element(reader)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(XmlError::UnexpectedElement(
                        "unexpected EOF in Contents".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(ObjectSummary {
            key: key.unwrap_or_default(),
            last_modified,
            e_tag: e_tag.unwrap_or_default(),
            size: size.unwrap_or_default(),
            storage_class,
        })
    }
}

impl S3Deserialize for ListBucketResult {
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut name = None;
        let mut prefix = None;
        let mut key_count = None;
        let mut max_keys = None;
        let mut is_truncated = None;
        let mut next_continuation_token = None;
        let mut contents = Vec::new();

        // Contents entries repeat directly under the root element.
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let tag = e.name();
                    let tag_name = std::str::from_utf8(tag.as_ref())
                        .map_err(|e| XmlError::ParseError(e.to_string()))?;
                    match tag_name {
                        "Name" => name = Some(read_text_content(reader)?),
                        "Prefix" => prefix = Some(read_text_content(reader)?),
                        "KeyCount" => key_count = Some(parse_i32(&read_text_content(reader)?)?),
                        "MaxKeys" => max_keys = Some(parse_i32(&read_text_content(reader)?)?),
                        "IsTruncated" => {
                            is_truncated = Some(parse_bool(&read_text_content(reader)?)?);
                        }
                        "NextContinuationToken" => {
                            next_continuation_token = Some(read_text_content(reader)?);
                        }
                        "Contents" => contents.push(ObjectSummary::deserialize_xml(reader)?),
                        _ => skip_element(reader)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(XmlError::UnexpectedElement(
                        "unexpected EOF in ListBucketResult".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(ListBucketResult {
            name: name.unwrap_or_default(),
            prefix: prefix.unwrap_or_default(),
            key_count: key_count.unwrap_or_default(),
            max_keys: max_keys.unwrap_or_default(),
            is_truncated: is_truncated.unwrap_or_default(),
            next_continuation_token,
            contents,
        })
    }
}

impl S3Deserialize for ErrorResponse {
    fn deserialize_xml(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut code = None;
        let mut message = None;
        let mut resource = None;
        let mut request_id = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = e.name();
                    let tag_name = std::str::from_utf8(name.as_ref())
                        .map_err(|e| XmlError::ParseError(e.to_string()))?;
                    match tag_name {
                        "Code" => code = Some(read_text_content(reader)?),
                        "Message" => message = Some(read_text_content(reader)?),
                        "Resource" => resource = Some(read_text_content(reader)?),
                        "RequestId" => request_id = Some(read_text_content(reader)?),
                        _ => skip_element(reader)?,
                    }
                }
                Event::End(_) => break,
                Event::Eof => {
                    return Err(XmlError::UnexpectedElement(
                        "unexpected EOF in Error".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(ErrorResponse {
            code: code.unwrap_or_default(),
            message: message.unwrap_or_default(),
            resource,
            request_id,
        })
    }
}
