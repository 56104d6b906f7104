//! GatewayService maps the four storage operations onto one backend call
//! each and turns the outcome into a response envelope.
//!
//! Input is validated before the backend is touched. Backend outcomes are
//! matched exhaustively: a value, "not found", or any other failure. Every
//! failure is logged here with its full detail before the caller sees the
//! summarized envelope.

use crate::{
    backends::{BackendError, ObjectBackend, ReadinessCheck},
    config::UploadEncoding,
    errors::GatewayError,
    models::{
        envelope::ResponseEnvelope,
        object::{ObjectDownload, ObjectKey, ObjectPayload, ObjectSummary},
    },
};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const MISSING_KEY_MESSAGE: &str = "An object key is required.";
pub const EMPTY_PAYLOAD_MESSAGE: &str = "No file content was provided.";

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Cloneable handle shared by every request handler. Holds the one backend
/// client built at startup.
#[derive(Clone)]
pub struct GatewayService {
    backend: Arc<dyn ObjectBackend>,
    upload_encodings: Arc<[UploadEncoding]>,
}

impl GatewayService {
    pub fn new(backend: Arc<dyn ObjectBackend>, upload_encodings: Vec<UploadEncoding>) -> Self {
        Self {
            backend,
            upload_encodings: upload_encodings.into(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Fail with a validation error unless `encoding` is enabled.
    pub fn ensure_encoding(&self, encoding: UploadEncoding) -> GatewayResult<()> {
        if self.upload_encodings.contains(&encoding) {
            return Ok(());
        }
        let accepted = self
            .upload_encodings
            .iter()
            .map(UploadEncoding::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Err(GatewayError::validation(format!(
            "Upload encoding `{}` is not enabled. Accepted encodings: {}.",
            encoding, accepted
        )))
    }

    /// Upload `payload` under `key`, overwriting whatever was there.
    pub async fn put(&self, key: &str, payload: ObjectPayload) -> GatewayResult<ResponseEnvelope> {
        let key = parse_key(key)?;
        if payload.is_empty() {
            warn!(key = %key, "rejected upload with empty payload");
            return Err(GatewayError::validation(EMPTY_PAYLOAD_MESSAGE));
        }

        let size = payload.len();
        match self.backend.put(&key, payload).await {
            Ok(()) => {
                info!(key = %key, size, "File {} uploaded successfully", key);
                Ok(ResponseEnvelope::ok(format!(
                    "File {} uploaded successfully",
                    key
                )))
            }
            Err(err) => Err(self.report("upload", &key, err)),
        }
    }

    /// Open the object for streaming back to the caller.
    pub async fn get(&self, key: &str) -> GatewayResult<(ObjectKey, ObjectDownload)> {
        let key = parse_key(key)?;
        match self.backend.get(&key).await {
            Ok(download) => {
                info!(
                    key = %key,
                    content_type = %download.content_type,
                    "File {} downloaded successfully",
                    key
                );
                Ok((key, download))
            }
            Err(err) => Err(self.report("download", &key, err)),
        }
    }

    /// Remove the object. An absent key is an error, not a silent success.
    pub async fn delete(&self, key: &str) -> GatewayResult<ResponseEnvelope> {
        let key = parse_key(key)?;
        match self.backend.delete(&key).await {
            Ok(()) => {
                info!(key = %key, "File {} deleted successfully", key);
                Ok(ResponseEnvelope::ok(format!(
                    "File {} deleted successfully",
                    key
                )))
            }
            Err(err) => Err(self.report("delete", &key, err)),
        }
    }

    pub async fn list(&self) -> GatewayResult<ResponseEnvelope<Vec<ObjectSummary>>> {
        match self.backend.list().await {
            Ok(listing) => {
                info!(count = listing.len(), "List of file(s) successfully retrieved");
                Ok(ResponseEnvelope::with_data(
                    format!("{} file(s) found", listing.len()),
                    listing,
                ))
            }
            Err(err) => {
                log_backend_error("list", None, &err);
                Err(err.into())
            }
        }
    }

    pub async fn readiness(&self) -> Vec<ReadinessCheck> {
        self.backend.check().await
    }

    fn report(&self, op: &'static str, key: &ObjectKey, err: BackendError) -> GatewayError {
        log_backend_error(op, Some(key), &err);
        err.into()
    }
}

fn parse_key(raw: &str) -> GatewayResult<ObjectKey> {
    ObjectKey::parse(raw).ok_or_else(|| GatewayError::validation(MISSING_KEY_MESSAGE))
}

fn log_backend_error(op: &'static str, key: Option<&ObjectKey>, err: &BackendError) {
    let key = key.map(ObjectKey::as_str).unwrap_or("-");
    match err {
        BackendError::NotFound { .. } => {
            warn!(op, key, "The requested file was not found.");
        }
        BackendError::Failure {
            kind,
            message,
            detail,
        } => {
            error!(op, key, kind = %kind, detail = %detail, "An error occurred: {}", message);
        }
    }
}
