//! Web service for converting uploaded workbooks.
//!
//! Exposes upload, live progress (server-sent events) and one-shot download
//! endpoints under `/excel`, plus a health check.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Settings;
use crate::fetch::{Fetch, HttpFetcher};
use crate::services::{JobManager, Pipeline};

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobManager,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let transport = HttpFetcher::new(settings.request_timeout(), Some(&settings.user_agent))?;
        Ok(Self::with_transport(settings, Arc::new(transport)))
    }

    /// Build state around a custom image transport.
    pub fn with_transport(settings: &Settings, transport: Arc<dyn Fetch>) -> Self {
        let pipeline = Pipeline::from_settings(settings, transport);
        Self {
            jobs: JobManager::new(pipeline, settings.job_options()),
            settings: Arc::new(settings.clone()),
        }
    }
}

/// Start the web server.
pub async fn serve(settings: &Settings, host: &str, port: u16) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let state = AppState::new(settings)?;
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::fetch::testing::ScriptedFetch;
    use crate::models::{CellValue, Document, Sheet};
    use crate::workbook::{build_workbook, read_workbook, TINY_PNG};

    const IMAGE_URL: &str = "https://img.example.com/photo.png";
    const BOUNDARY: &str = "imagesheet-test-boundary";

    fn setup_test_app() -> (axum::Router, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let settings = Settings {
            retry_delay_ms: 1,
            progress_grace_secs: 0,
            ..Settings::with_tmp_dir(dir.path().to_path_buf())
        };
        let transport = ScriptedFetch::new().with_body(IMAGE_URL, TINY_PNG);
        let state = AppState::with_transport(&settings, Arc::new(transport));
        (create_router(state), dir)
    }

    fn workbook() -> Vec<u8> {
        let mut sheet = Sheet::new("Sheet1");
        sheet.set_value(1, 1, CellValue::Text("photo".into()));
        sheet.set_value(2, 1, CellValue::Text(IMAGE_URL.into()));
        let mut doc = Document::new();
        doc.push_sheet(sheet);
        build_workbook(&doc)
    }

    fn multipart_request(field: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; \
                 filename=\"input.xlsx\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/excel/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn upload(app: &axum::Router) -> String {
        let response = app
            .clone()
            .oneshot(multipart_request("excel", &workbook()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        json["progressId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _dir) = setup_test_app();

        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_upload_then_download_once() {
        let (app, dir) = setup_test_app();
        let job_id = upload(&app).await;
        assert!(job_id.starts_with("excel_"));

        let mut response = None;
        for _ in 0..200 {
            let r = app
                .clone()
                .oneshot(get(&format!("/excel/download/{}", job_id)))
                .await
                .unwrap();
            if r.status() == StatusCode::OK {
                response = Some(r);
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let response = response.expect("job never completed");

        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"output_with_images.xlsx\""
        );
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let doc = read_workbook(&body).unwrap();
        assert_eq!(
            doc.sheets[0].cell(1, 1).unwrap().value.as_text(),
            Some("photo")
        );
        assert!(doc.sheets[0].cell(2, 1).is_none());

        // Artifacts are gone and a second download fails.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        let again = app
            .oneshot(get(&format!("/excel/download/{}", job_id)))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_progress_stream_replays_and_ends() {
        let (app, _dir) = setup_test_app();
        let job_id = upload(&app).await;

        let response = app
            .oneshot(get(&format!("/excel/progress/{}", job_id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let events: Vec<serde_json::Value> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim_start()).unwrap())
            .collect();

        assert_eq!(events[0]["stage"], "connected");
        assert_eq!(events[0]["id"], job_id.as_str());
        let last = events.last().unwrap();
        assert_eq!(last["stage"], "complete");
        assert_eq!(last["percentage"], 100);
    }

    #[tokio::test]
    async fn test_download_unknown_job_is_404() {
        let (app, _dir) = setup_test_app();

        let response = app
            .oneshot(get("/excel/download/excel_0_unknown"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = json_body(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "file does not exist or has expired");
    }

    #[tokio::test]
    async fn test_upload_without_excel_field_is_rejected() {
        let (app, dir) = setup_test_app();

        let response = app
            .oneshot(multipart_request("file", &workbook()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
