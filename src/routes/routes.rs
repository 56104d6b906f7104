//! Defines routes for the storage gateway.
//!
//! ## Structure
//! - **Probes**
//!   - `GET    /healthz` — liveness
//!   - `GET    /readyz` — backend readiness
//!
//! - **Storage endpoints** (under `/api/storage`)
//!   - `GET    /index` — liveness text
//!   - `POST   /upload` — upload (multipart or base64 JSON)
//!   - `GET    /download?key=` — stream an object
//!   - `DELETE /delete?key=` — delete an object
//!   - `GET    /list` — list every object in the bucket

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        storage_handlers::{delete, download, index, list, upload},
    },
    services::gateway_service::GatewayService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the router for all gateway routes.
///
/// `max_upload_bytes` caps the body accepted by the upload endpoint.
pub fn routes(max_upload_bytes: usize) -> Router<GatewayService> {
    let storage = Router::new()
        .route("/index", get(index))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/download", get(download))
        .route("/delete", axum::routing::delete(delete))
        .route("/list", get(list));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/storage", storage)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backends::MemoryBackend, config::UploadEncoding};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use base64::{Engine as _, engine::general_purpose};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "gateway-test-boundary";

    fn app_with(encodings: Vec<UploadEncoding>, limit: usize) -> Router {
        let service = GatewayService::new(Arc::new(MemoryBackend::new()), encodings);
        routes(limit).with_state(service)
    }

    fn app() -> Router {
        app_with(
            vec![UploadEncoding::Multipart, UploadEncoding::Base64Json],
            1024 * 1024,
        )
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_upload(key: &str, content: &[u8]) -> Request<Body> {
        let body = json!({
            "key": key,
            "fileContent": general_purpose::STANDARD.encode(content),
            "contentType": "text/csv",
        });
        Request::post("/api/storage/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_upload(file_name: &str, content: &str, key: Option<&str>) -> Request<Body> {
        let mut body = String::new();
        if let Some(key) = key {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"key\"\r\n\r\n{key}\r\n"
            ));
        }
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: text/plain\r\n\r\n{content}\r\n--{BOUNDARY}--\r\n"
        ));
        Request::post("/api/storage/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn delete(uri: &str) -> Request<Body> {
        Request::delete(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn index_reports_running() {
        let response = send(&app(), get("/api/storage/index")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Storage gateway API is running....");
    }

    #[tokio::test]
    async fn csv_report_lifecycle() {
        let app = app();

        let response = send(&app, json_upload("reports/jan.csv", b"a,b,c\n1,2,3")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "success": true, "message": "File reports/jan.csv uploaded successfully" })
        );

        let response = send(&app, get("/api/storage/download?key=reports/jan.csv")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"jan.csv\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"a,b,c\n1,2,3");

        let response = send(&app, delete("/api/storage/delete?key=reports/jan.csv")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);

        let response = send(&app, get("/api/storage/download?key=reports/jan.csv")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(response).await,
            json!({
                "success": false,
                "message": "The requested file was not found.",
                "errorCode": 404
            })
        );
    }

    #[tokio::test]
    async fn multipart_upload_uses_file_name_as_key() {
        let app = app();
        let response = send(&app, multipart_upload("notes.txt", "hello", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await["message"],
            "File notes.txt uploaded successfully"
        );

        let response = send(&app, get("/api/storage/download?fileName=notes.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn multipart_key_field_overrides_file_name() {
        let app = app();
        let response = send(
            &app,
            multipart_upload("notes.txt", "hello", Some("docs/notes.txt")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let listing = json_body(send(&app, get("/api/storage/list")).await).await;
        assert_eq!(listing["data"][0]["key"], "docs/notes.txt");
        assert_eq!(listing["data"][0]["size"], 5);
    }

    #[tokio::test]
    async fn empty_multipart_file_is_rejected() {
        let response = send(&app(), multipart_upload("empty.txt", "", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "No file content was provided.");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn disabled_encoding_is_rejected() {
        let app = app_with(vec![UploadEncoding::Multipart], 1024);
        let response = send(&app, json_upload("a.csv", b"1")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["errorCode"], 400);
        assert!(body["message"].as_str().unwrap().contains("multipart"));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let app = app_with(vec![UploadEncoding::Base64Json], 64);
        let response = send(&app, json_upload("big.bin", &[7u8; 256])).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await["errorCode"], 413);
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_not_found() {
        let response = send(&app(), delete("/api/storage/delete?key=missing-key")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["errorCode"], 404);
    }

    #[tokio::test]
    async fn missing_key_is_a_validation_error() {
        let response = send(&app(), get("/api/storage/download")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["message"],
            "An object key is required."
        );
    }

    #[tokio::test]
    async fn list_on_empty_bucket() {
        let response = send(&app(), get("/api/storage/list")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], json!([]));
        assert!(body.get("errorCode").is_none());
    }

    #[tokio::test]
    async fn probes_answer() {
        let app = app();
        let response = send(&app, get("/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, get("/readyz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["backend"], "memory");
        assert_eq!(body["checks"]["memory"]["ok"], true);
    }
}
