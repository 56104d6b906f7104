//! HTTP handlers for the `/api/storage` endpoints.
//! Object bodies are streamed out on download; everything else answers with a
//! `ResponseEnvelope`. Storage concerns are delegated to `GatewayService`.

use crate::{
    config::UploadEncoding,
    errors::GatewayError,
    models::{
        envelope::ResponseEnvelope,
        object::{ObjectDownload, ObjectKey, ObjectPayload, ObjectSummary},
    },
    services::gateway_service::{EMPTY_PAYLOAD_MESSAGE, GatewayService},
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequest, Multipart, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;

pub const NO_FILE_MESSAGE: &str = "No file was uploaded.";

/// Everything outside RFC 5987 `attr-char`.
const ATTR_CHAR_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// `?key=` (or the older `?fileName=`) selecting one object.
#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    pub key: Option<String>,
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

impl KeyQuery {
    fn into_key(self) -> String {
        self.key.or(self.file_name).unwrap_or_default()
    }
}

/// JSON upload body: `{ "key": "...", "fileContent": "<base64>" }`.
///
/// `fileContent` may also be wrapped as `{ "$content": "<base64>",
/// "$content-type": "..." }`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Base64UploadRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub file_content: Option<FileContent>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FileContent {
    Inline(String),
    Wrapped {
        #[serde(rename = "$content", default)]
        content: Option<String>,
        #[serde(rename = "$content-type", default)]
        content_type: Option<String>,
    },
}

impl Base64UploadRequest {
    /// Decode into the key and payload handed to the gateway.
    fn into_upload(self) -> Result<(String, ObjectPayload), GatewayError> {
        let (encoded, wrapped_type) = match self.file_content {
            Some(FileContent::Inline(content)) => (Some(content), None),
            Some(FileContent::Wrapped {
                content,
                content_type,
            }) => (content, content_type),
            None => (None, None),
        };
        let encoded = encoded.ok_or_else(|| GatewayError::validation(EMPTY_PAYLOAD_MESSAGE))?;
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| {
                GatewayError::validation(format!("File content is not valid base64: {}", err))
            })?;

        let content_type = self.content_type.or(wrapped_type);
        Ok((self.key, ObjectPayload::new(bytes, content_type)))
    }
}

/// `GET /api/storage/index`
pub async fn index() -> &'static str {
    "Storage gateway API is running...."
}

/// `POST /api/storage/upload`: multipart form or base64 JSON, depending on
/// the request content type and the enabled encodings.
pub async fn upload(
    State(service): State<GatewayService>,
    request: Request,
) -> Result<ResponseEnvelope, GatewayError> {
    let (key, payload) = match request_encoding(request.headers()) {
        UploadEncoding::Multipart => {
            service.ensure_encoding(UploadEncoding::Multipart)?;
            let multipart = Multipart::from_request(request, &service)
                .await
                .map_err(|rej| GatewayError::rejected(rej.status(), rej.body_text()))?;
            read_multipart(multipart).await?
        }
        UploadEncoding::Base64Json => {
            service.ensure_encoding(UploadEncoding::Base64Json)?;
            let Json(body) = Json::<Base64UploadRequest>::from_request(request, &service)
                .await
                .map_err(|rej| GatewayError::rejected(rej.status(), rej.body_text()))?;
            body.into_upload()?
        }
    };

    service.put(&key, payload).await
}

/// `GET /api/storage/download?key=` streams the object body.
pub async fn download(
    State(service): State<GatewayService>,
    Query(query): Query<KeyQuery>,
) -> Result<Response, GatewayError> {
    let (key, download) = service.get(&query.into_key()).await?;
    Ok(object_response(&key, download))
}

/// `DELETE /api/storage/delete?key=`
pub async fn delete(
    State(service): State<GatewayService>,
    Query(query): Query<KeyQuery>,
) -> Result<ResponseEnvelope, GatewayError> {
    service.delete(&query.into_key()).await
}

/// `GET /api/storage/list`
pub async fn list(
    State(service): State<GatewayService>,
) -> Result<ResponseEnvelope<Vec<ObjectSummary>>, GatewayError> {
    service.list().await
}

/// Multipart when the request says so, JSON otherwise.
fn request_encoding(headers: &HeaderMap) -> UploadEncoding {
    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/"))
        .unwrap_or(false);
    if is_multipart {
        UploadEncoding::Multipart
    } else {
        UploadEncoding::Base64Json
    }
}

/// Collect the `file` part (or the first part carrying a file name) and an
/// optional `key` text part that overrides the uploaded file name.
async fn read_multipart(mut multipart: Multipart) -> Result<(String, ObjectPayload), GatewayError> {
    let mut key_field: Option<String> = None;
    let mut file: Option<(Option<String>, Option<String>, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| GatewayError::rejected(err.status(), err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "key" {
            let value = field
                .text()
                .await
                .map_err(|err| GatewayError::rejected(err.status(), err.body_text()))?;
            key_field = Some(value);
        } else if file.is_none() && (name == "file" || field.file_name().is_some()) {
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|err| GatewayError::rejected(err.status(), err.body_text()))?;
            file = Some((file_name, content_type, bytes));
        }
    }

    let (file_name, content_type, bytes) =
        file.ok_or_else(|| GatewayError::validation(NO_FILE_MESSAGE))?;
    let key = key_field
        .filter(|k| !k.trim().is_empty())
        .or(file_name)
        .unwrap_or_default();
    Ok((key, ObjectPayload::new(bytes, content_type)))
}

fn object_response(key: &ObjectKey, download: ObjectDownload) -> Response {
    let mut response = Response::new(Body::from_stream(download.body));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&download.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(length) = download.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(key.file_name())) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// `attachment; filename="..."`, adding an RFC 5987 `filename*` when the name
/// is not plain ASCII.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if fallback == file_name {
        return format!("attachment; filename=\"{}\"", fallback);
    }

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(file_name, ATTR_CHAR_ESCAPES)
    )
}
