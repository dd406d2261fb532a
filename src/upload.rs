//! Hand-off of completed runs to a results collector.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ScheduleRun;

const UPLOAD_PATH: &str = "/api/v1/results/upload";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("collector rejected upload with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Receives every completed run, including partially cancelled ones.
/// Retries, if any, are the implementation's business.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, run: &ScheduleRun) -> Result<(), UploadError>;
}

/// POSTs runs as JSON to a collector.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpUploader {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .user_agent(concat!("netpulse/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), UPLOAD_PATH),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, run: &ScheduleRun) -> Result<(), UploadError> {
        let mut request = self.client.post(&self.endpoint).json(run);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(512);
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(run_id = run.run_id, results = run.results.len(), "Uploaded run");
        Ok(())
    }
}

/// Logs a summary of each run; used when no collector is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUploader;

#[async_trait]
impl Uploader for LogUploader {
    async fn upload(&self, run: &ScheduleRun) -> Result<(), UploadError> {
        tracing::info!(
            run_id = run.run_id,
            trigger = ?run.trigger,
            succeeded = run.succeeded,
            failed = run.failed,
            cancelled = run.cancelled,
            "Run complete"
        );
        for result in run.results.iter().filter(|r| r.is_failed()) {
            if let Some(error) = &result.error {
                tracing::info!(
                    target_name = %result.target.name,
                    kind = ?error.kind,
                    "  {} failed: {}",
                    result.target.address,
                    error.message
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceIdentity, RunTrigger};
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    fn empty_run() -> ScheduleRun {
        let now = Utc::now();
        ScheduleRun::new(
            7,
            RunTrigger::Manual,
            DeviceIdentity {
                hostname: "probe-1".to_string(),
                serial: "SN1".to_string(),
            },
            now,
            now,
            vec![],
        )
    }

    /// Accept one request, report its head and body, and answer with `status_line`.
    async fn collector(status_line: &'static str) -> (String, oneshot::Receiver<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            let mut buf = [0u8; 4096];
            let (head, body) = loop {
                let n = socket.read(&mut buf).await.unwrap();
                data.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&data).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if body.len() >= length {
                        break (head.to_string(), body.to_string());
                    }
                }
                if n == 0 {
                    break (text, String::new());
                }
            };
            let response = format!("{}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok", status_line);
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send((head, body));
        });
        (format!("http://{}/", addr), rx)
    }

    #[tokio::test]
    async fn test_http_upload_posts_json_with_bearer() {
        let (url, request) = collector("HTTP/1.1 200 OK").await;
        let uploader = HttpUploader::new(&url, Some("secret".to_string())).unwrap();
        assert!(uploader.endpoint().ends_with("/api/v1/results/upload"));
        assert!(!uploader.endpoint().contains("//api"));

        assert_ok!(uploader.upload(&empty_run()).await);

        let (head, body) = request.await.unwrap();
        assert!(head.starts_with("POST /api/v1/results/upload HTTP/1.1"));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer secret"));
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["run_id"], 7);
        assert_eq!(json["device"]["hostname"], "probe-1");
    }

    #[tokio::test]
    async fn test_http_upload_rejected() {
        let (url, _request) = collector("HTTP/1.1 503 Service Unavailable").await;
        let uploader = HttpUploader::new(&url, None).unwrap();

        let err = assert_err!(uploader.upload(&empty_run()).await);
        assert!(matches!(err, UploadError::Rejected { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_log_uploader_never_fails() {
        assert_ok!(LogUploader.upload(&empty_run()).await);
    }
}
