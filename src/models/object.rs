//! Represents an object (file) addressed by key in the configured bucket.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use std::{fmt, io};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Name of an object within the bucket namespace.
///
/// Only emptiness is checked here. Any other character restrictions belong to
/// the backend and come back as backend failures.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Returns `None` for an empty or whitespace-only key.
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last `/`-separated segment, used as the suggested download file name.
    pub fn file_name(&self) -> &str {
        self.0
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Content handed to a backend on upload.
#[derive(Clone, Debug)]
pub struct ObjectPayload {
    pub bytes: Bytes,
    pub content_type: String,
}

impl ObjectPayload {
    pub fn new(bytes: impl Into<Bytes>, content_type: Option<String>) -> Self {
        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        Self {
            bytes: bytes.into(),
            content_type,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Object content as returned by a backend for streaming back to the caller.
pub struct ObjectDownload {
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl fmt::Debug for ObjectDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDownload")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// One entry of a bucket listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}
