//! Amazon S3 (or any S3-compatible service) through the official AWS SDK.
//!
//! A single `Client` is built at startup and shared by every request; the SDK
//! pools connections internally, so no extra synchronization is needed here.

use super::{BackendError, BackendResult, ObjectBackend, ReadinessCheck};
use crate::models::object::{
    DEFAULT_CONTENT_TYPE, ObjectDownload, ObjectKey, ObjectPayload, ObjectSummary,
};
use anyhow::{Result, bail};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    Client,
    config::{Region, http::HttpResponse},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::Object,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::error::Error as StdError;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Connection settings for [`S3Backend`].
#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, R2, LocalStack...). Enables path-style addressing.
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("static_credentials", &self.access_key.is_some())
            .finish()
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    pub async fn connect(settings: &S3Settings) -> Result<Self> {
        if settings.bucket.trim().is_empty() {
            bail!("an S3 bucket name is required");
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        match (&settings.access_key, &settings.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                loader = loader.credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "storage-gateway",
                ));
            }
            (None, None) => debug!("using the default AWS credential chain"),
            _ => bail!("both an access key and a secret key must be set, or neither"),
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self::from_client(
            Client::from_conf(builder.build()),
            settings.bucket.clone(),
        ))
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

/// True when the service said the object (or bucket) does not exist.
fn is_not_found(status: Option<u16>, code: Option<&str>) -> bool {
    status == Some(404) || matches!(code, Some("NoSuchKey" | "NotFound" | "NoSuchBucket"))
}

/// Turn an SDK error into a [`BackendError`], keeping the service error code,
/// message and full context chain. A missing object or bucket is reported as
/// not found against `target`; without a target every error is a failure.
fn map_sdk_error<E>(target: Option<&str>, err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
{
    let status = err.raw_response().map(|resp| resp.status().as_u16());
    if let Some(target) = target {
        if is_not_found(status, err.code()) {
            return BackendError::NotFound {
                target: target.to_string(),
            };
        }
    }

    let kind = match err.code() {
        Some(code) => code.to_string(),
        None => match &err {
            SdkError::ConstructionFailure(_) => "ConstructionFailure",
            SdkError::TimeoutError(_) => "TimeoutError",
            SdkError::DispatchFailure(_) => "DispatchFailure",
            SdkError::ResponseError(_) => "ResponseError",
            SdkError::ServiceError(_) => "ServiceError",
            _ => "SdkError",
        }
        .to_string(),
    };
    let message = match err.message() {
        Some(message) => message.to_string(),
        None => err.to_string(),
    };
    let detail = match status {
        Some(status) => format!("HTTP {}: {}", status, DisplayErrorContext(&err)),
        None => DisplayErrorContext(&err).to_string(),
    };

    BackendError::Failure {
        kind,
        message,
        detail,
    }
}

fn to_summary(object: &Object) -> Option<ObjectSummary> {
    let key = object.key()?.to_string();
    let last_modified = object
        .last_modified()
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos()))
        .unwrap_or_default();
    Some(ObjectSummary {
        key,
        size: object.size().unwrap_or_default(),
        last_modified,
    })
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, key: &ObjectKey, payload: ObjectPayload) -> BackendResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(&payload.content_type)
            .content_length(payload.len() as i64)
            .body(ByteStream::from(payload.bytes))
            .send()
            .await
            .map_err(|err| map_sdk_error(None, err))?;
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> BackendResult<ObjectDownload> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|err| map_sdk_error(Some(key.as_str()), err))?;

        let content_type = resp
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let content_length = resp.content_length().and_then(|len| u64::try_from(len).ok());
        let body = ReaderStream::new(resp.body.into_async_read()).boxed();

        Ok(ObjectDownload {
            content_type,
            content_length,
            body,
        })
    }

    async fn delete(&self, key: &ObjectKey) -> BackendResult<()> {
        // DeleteObject succeeds for absent keys, so check existence first.
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|err| map_sdk_error(Some(key.as_str()), err))?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|err| map_sdk_error(Some(key.as_str()), err))?;
        Ok(())
    }

    async fn list(&self) -> BackendResult<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|err| map_sdk_error(Some(&self.bucket), err))?;

            objects.extend(resp.contents().iter().filter_map(to_summary));

            match (resp.is_truncated(), resp.next_continuation_token()) {
                (Some(true), Some(next)) => {
                    debug!(fetched = objects.len(), "listing continues on next page");
                    continuation_token = Some(next.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn check(&self) -> Vec<ReadinessCheck> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => vec![ReadinessCheck::passed("s3")],
            Err(err) => vec![ReadinessCheck::failed(
                "s3",
                DisplayErrorContext(&err).to_string(),
            )],
        }
    }
}
