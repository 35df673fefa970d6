//! HTTP OCR service client.
//!
//! Posts the base64-encoded page image to `{service_url}/ocr` and reads back
//! `{success, text, error}`.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{Credential, OcrClient, OcrError};

/// Request parameters forwarded to the OCR service.
#[derive(Debug, Clone)]
pub struct OcrRequestOptions {
    pub task_type: String,
    pub figure_language: String,
}

impl Default for OcrRequestOptions {
    fn default() -> Self {
        Self {
            task_type: "v1.5".to_string(),
            figure_language: "Thai".to_string(),
        }
    }
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    image_base64: String,
    api_key: &'a [String],
    task_type: &'a str,
    figure_language: &'a str,
}

#[derive(Deserialize)]
struct OcrResponse {
    success: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// OCR client for the JSON HTTP service.
#[derive(Clone)]
pub struct HttpOcrClient {
    client: Client,
    endpoint: String,
    options: OcrRequestOptions,
}

impl HttpOcrClient {
    pub fn new(
        service_url: &str,
        timeout: Duration,
        options: OcrRequestOptions,
    ) -> Result<Self, OcrError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OcrError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/ocr", service_url.trim_end_matches('/')),
            options,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl OcrClient for HttpOcrClient {
    async fn extract(
        &self,
        image: &[u8],
        mime_type: &str,
        credential: &Credential,
    ) -> Result<String, OcrError> {
        let request = OcrRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(image),
            api_key: credential.keys(),
            task_type: &self.options.task_type,
            figure_language: &self.options.figure_language,
        };
        debug!(
            "OCR request: {} bytes ({}) with credential {}",
            image.len(),
            mime_type,
            credential.index
        );

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OcrError::Timeout
                } else {
                    OcrError::Http(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(OcrError::Service { status, body });
        }

        let parsed: OcrResponse = resp
            .json()
            .await
            .map_err(|e| OcrError::Decode(e.to_string()))?;

        if parsed.success {
            Ok(parsed.text.unwrap_or_default())
        } else {
            Err(OcrError::Rejected(
                parsed
                    .error
                    .unwrap_or_else(|| "OCR processing failed".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the request body.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= split + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&buf).to_string();
            text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string()
        });
        (url, handle)
    }

    fn credential() -> Credential {
        Credential::new(0, vec!["k1".to_string(), "k2".to_string()])
    }

    #[tokio::test]
    async fn test_successful_extraction() {
        let (url, server) = serve_once("200 OK", r#"{"success":true,"text":"hello page"}"#).await;
        let client =
            HttpOcrClient::new(&url, Duration::from_secs(5), OcrRequestOptions::default()).unwrap();

        let text = client.extract(b"img", "image/png", &credential()).await.unwrap();
        assert_eq!(text, "hello page");

        let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent["image_base64"], "aW1n");
        assert_eq!(sent["api_key"], serde_json::json!(["k1", "k2"]));
        assert_eq!(sent["task_type"], "v1.5");
    }

    #[tokio::test]
    async fn test_non_success_status_is_service_error() {
        let (url, _server) = serve_once("503 Service Unavailable", r#"{"detail":"busy"}"#).await;
        let client =
            HttpOcrClient::new(&url, Duration::from_secs(5), OcrRequestOptions::default()).unwrap();

        match client.extract(b"img", "image/png", &credential()).await {
            Err(OcrError::Service { status, body }) => {
                assert_eq!(status, 503);
                assert!(body.contains("busy"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_page() {
        let (url, _server) =
            serve_once("200 OK", r#"{"success":false,"error":"quota exceeded"}"#).await;
        let client =
            HttpOcrClient::new(&url, Duration::from_secs(5), OcrRequestOptions::default()).unwrap();

        let err = client
            .extract(b"img", "image/png", &credential())
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::Rejected(ref m) if m == "quota exceeded"));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = HttpOcrClient::new(
            "http://localhost:8000/",
            Duration::from_secs(1),
            OcrRequestOptions::default(),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8000/ocr");
    }
}
