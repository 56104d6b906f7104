//! Object-storage backends the gateway can delegate to.
//!
//! The gateway only sees [`ObjectBackend`]; which implementation sits behind it
//! is decided once at startup by [`connect`].

pub mod local;
pub mod memory;
pub mod s3;

use crate::{
    config::{AppConfig, BackendKind},
    models::object::{ObjectDownload, ObjectKey, ObjectPayload, ObjectSummary},
};
use anyhow::Result;
use async_trait::async_trait;
use std::{error::Error as StdError, fmt::Write as _, sync::Arc};
use thiserror::Error;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use s3::S3Backend;

/// Outcome of a failed backend call. Backends never panic or leak their own
/// error types past this boundary.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The object, or the bucket holding it, does not exist.
    #[error("`{target}` not found")]
    NotFound { target: String },

    #[error("{kind}: {message}")]
    Failure {
        /// Name of the underlying error type or service error code.
        kind: String,
        message: String,
        /// Full diagnostic chain for operators.
        detail: String,
    },
}

pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    pub fn not_found(key: &ObjectKey) -> Self {
        Self::NotFound {
            target: key.to_string(),
        }
    }

    /// Wrap an arbitrary error, recording its source chain as the detail.
    pub fn failure<E>(kind: impl Into<String>, err: &E) -> Self
    where
        E: StdError + ?Sized,
    {
        Self::Failure {
            kind: kind.into(),
            message: err.to_string(),
            detail: error_chain(err),
        }
    }
}

/// Render `err` and each of its sources as `outer: inner: ...`.
pub fn error_chain<E>(err: &E) -> String
where
    E: StdError + ?Sized,
{
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(out, ": {}", cause);
        source = cause.source();
    }
    out
}

/// Result of one readiness probe step.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub name: &'static str,
    pub error: Option<String>,
}

impl ReadinessCheck {
    pub fn passed(name: &'static str) -> Self {
        Self { name, error: None }
    }

    pub fn failed(name: &'static str, error: impl Into<String>) -> Self {
        Self {
            name,
            error: Some(error.into()),
        }
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Key-addressed object storage: put/get/delete/list of whole objects in one
/// bucket. Implementations must be safe to share across concurrent requests.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short name used in logs and readiness output.
    fn name(&self) -> &'static str;

    /// Store `payload` under `key`, replacing any existing object.
    async fn put(&self, key: &ObjectKey, payload: ObjectPayload) -> BackendResult<()>;

    async fn get(&self, key: &ObjectKey) -> BackendResult<ObjectDownload>;

    /// Remove `key`. An absent key is reported as [`BackendError::NotFound`].
    async fn delete(&self, key: &ObjectKey) -> BackendResult<()>;

    /// Every object in the bucket, ordered by key.
    async fn list(&self) -> BackendResult<Vec<ObjectSummary>>;

    /// Probe the backend for readiness.
    async fn check(&self) -> Vec<ReadinessCheck>;
}

/// Build the backend selected by `cfg`. Called once before the listener starts.
pub async fn connect(cfg: &AppConfig) -> Result<Arc<dyn ObjectBackend>> {
    let backend: Arc<dyn ObjectBackend> = match cfg.backend {
        BackendKind::S3 => Arc::new(S3Backend::connect(&cfg.s3_settings()?).await?),
        BackendKind::Local => {
            Arc::new(LocalBackend::connect(&cfg.database_url, &cfg.storage_dir).await?)
        }
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    tracing::info!(backend = backend.name(), "storage backend initialized");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, Error)]
    #[error("request failed")]
    struct Outer(#[source] io::Error);

    #[test]
    fn failure_records_source_chain() {
        let err = Outer(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        match BackendError::failure("DispatchFailure", &err) {
            BackendError::Failure {
                kind,
                message,
                detail,
            } => {
                assert_eq!(kind, "DispatchFailure");
                assert_eq!(message, "request failed");
                assert_eq!(detail, "request failed: connect timed out");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
