use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header::CONTENT_TYPE, Client};
use shared::protocol::{BinaryReference, FileBody, FileLocation, FileRef};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Resolves a backend file reference into displayable bytes.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, reference: &BinaryReference) -> Result<FetchedFile>;
}

pub struct MissingFileFetcher;

#[async_trait]
impl FileFetcher for MissingFileFetcher {
    async fn fetch(&self, reference: &BinaryReference) -> Result<FetchedFile> {
        Err(anyhow!("file fetcher unavailable for {}", reference.url))
    }
}

pub struct HttpFileFetcher {
    http: Client,
}

impl HttpFileFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client for file fetches")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl FileFetcher for HttpFileFetcher {
    async fn fetch(&self, reference: &BinaryReference) -> Result<FetchedFile> {
        let response = self
            .http
            .get(&reference.url)
            .send()
            .await
            .with_context(|| format!("failed to request {}", reference.url))?
            .error_for_status()?;
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {}", reference.url))?;
        Ok(FetchedFile {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }
}

/// File body for a reference whose bytes were fetched.
pub fn resolved_body(reference: &BinaryReference, file: FetchedFile) -> FileBody {
    FileBody {
        file_ref: FileRef {
            name: reference.name.clone(),
            mime_type: file.mime_type.or_else(|| reference.mime_type.clone()),
            size_bytes: file.bytes.len() as u64,
            location: FileLocation::Inline {
                data_b64: STANDARD.encode(&file.bytes),
            },
        },
        batch_id: reference.batch_id.clone(),
        total_files: reference.total_files,
    }
}

/// File body pointing at the unresolved reference, used for failed fetches.
pub fn unresolved_body(reference: &BinaryReference) -> FileBody {
    FileBody {
        file_ref: FileRef {
            name: reference.name.clone(),
            mime_type: reference.mime_type.clone(),
            size_bytes: reference.size_bytes,
            location: FileLocation::Remote {
                url: reference.url.clone(),
            },
        },
        batch_id: reference.batch_id.clone(),
        total_files: reference.total_files,
    }
}

#[cfg(test)]
mod tests {
    use axum::{http::header, routing::get, Router};
    use tokio::net::TcpListener;

    use super::*;

    fn reference(url: String) -> BinaryReference {
        BinaryReference {
            url,
            name: "notes.txt".to_string(),
            mime_type: None,
            size_bytes: 0,
            batch_id: None,
            total_files: None,
        }
    }

    async fn spawn_file_server() -> Result<String> {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = Router::new()
            .route(
                "/files/notes",
                get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "hello file") }),
            )
            .route(
                "/files/missing",
                get(|| async { axum::http::StatusCode::NOT_FOUND }),
            );
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(format!("http://{addr}"))
    }

    #[tokio::test]
    async fn http_fetcher_returns_body_and_content_type() {
        let base = spawn_file_server().await.expect("server");
        let fetcher = HttpFileFetcher::new(DEFAULT_FETCH_TIMEOUT).expect("fetcher");

        let file = fetcher
            .fetch(&reference(format!("{base}/files/notes")))
            .await
            .expect("fetch");

        assert_eq!(file.bytes, b"hello file".to_vec());
        assert_eq!(file.mime_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn http_fetcher_fails_on_error_status() {
        let base = spawn_file_server().await.expect("server");
        let fetcher = HttpFileFetcher::new(DEFAULT_FETCH_TIMEOUT).expect("fetcher");

        let err = fetcher
            .fetch(&reference(format!("{base}/files/missing")))
            .await
            .expect_err("404 must fail");
        assert!(err.to_string().contains("404"), "unexpected error: {err}");
    }

    #[test]
    fn resolved_body_inlines_bytes_and_keeps_batch_metadata() {
        let mut reference = reference("https://files.example.com/n".to_string());
        reference.batch_id = Some("batch-1".into());
        reference.total_files = Some(2);

        let body = resolved_body(
            &reference,
            FetchedFile {
                bytes: b"abc".to_vec(),
                mime_type: None,
            },
        );

        assert_eq!(body.file_ref.size_bytes, 3);
        assert_eq!(
            body.file_ref.location,
            FileLocation::Inline {
                data_b64: STANDARD.encode(b"abc")
            }
        );
        assert_eq!(body.batch_id.as_ref().map(|id| id.as_str()), Some("batch-1"));
        assert_eq!(body.total_files, Some(2));
    }
}
