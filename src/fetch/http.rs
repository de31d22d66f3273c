//! reqwest-backed transport.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use super::{Fetch, FetchError};

/// Default User-Agent for image requests.
pub const USER_AGENT: &str = concat!("imagesheet/", env!("CARGO_PKG_VERSION"));

/// HTTP transport performing single GET attempts.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher whose every attempt is bounded by `timeout`.
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent.unwrap_or(USER_AGENT))
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let start = Instant::now();
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        tracing::debug!(
            "GET {} -> {} ({} bytes in {}ms)",
            url,
            status.as_u16(),
            bytes.len(),
            start.elapsed().as_millis()
        );
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{http::StatusCode, routing::get, Router};

    use super::*;

    async fn spawn_image_server() -> SocketAddr {
        let app = Router::new()
            .route("/photo.png", get(|| async { vec![1u8, 2, 3, 4] }))
            .route(
                "/broken.png",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_get_bytes_returns_body() {
        let addr = spawn_image_server().await;
        let fetcher = HttpFetcher::new(Duration::from_secs(5), None).unwrap();

        let bytes = fetcher
            .get_bytes(&format!("http://{}/photo.png", addr))
            .await
            .unwrap();

        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let addr = spawn_image_server().await;
        let fetcher = HttpFetcher::new(Duration::from_secs(5), None).unwrap();

        let err = fetcher
            .get_bytes(&format!("http://{}/broken.png", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(500)));

        let err = fetcher
            .get_bytes(&format!("http://{}/missing.png", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
    }
}
