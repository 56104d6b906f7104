//! The uniform JSON body returned by every non-streaming endpoint.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// `{ success, message, data?, errorCode? }`
///
/// Built only through the constructors below, which keep `errorCode` absent on
/// success and `data` absent on failure.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope<T = ()> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
}

impl ResponseEnvelope<()> {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error_code: None,
        }
    }

    pub fn failure(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error_code: Some(status.as_u16()),
        }
    }
}

impl<T> ResponseEnvelope<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error_code: None,
        }
    }

    /// HTTP status carrying this envelope: the error code when failed, 200 otherwise.
    pub fn status(&self) -> StatusCode {
        self.error_code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::OK)
    }
}

impl<T: Serialize> IntoResponse for ResponseEnvelope<T> {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_omits_error_code() {
        let env = ResponseEnvelope::ok("File a uploaded successfully");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({ "success": true, "message": "File a uploaded successfully" })
        );
        assert_eq!(env.status(), StatusCode::OK);
    }

    #[test]
    fn failure_carries_error_code_and_no_data() {
        let env = ResponseEnvelope::failure(StatusCode::NOT_FOUND, "missing");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({ "success": false, "message": "missing", "errorCode": 404 })
        );
        assert_eq!(env.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn data_is_serialized_when_present() {
        let env = ResponseEnvelope::with_data("listed", Vec::<String>::new());
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({ "success": true, "message": "listed", "data": [] }));
    }
}
