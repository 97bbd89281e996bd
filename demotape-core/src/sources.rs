//! Track source resolution and remote download.

use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::NetworkConfig;

/// Where a track's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Local(PathBuf),
    Remote(Url),
}

impl SourceLocation {
    /// Classifies a source string.
    ///
    /// `http`/`https` URLs are remote and `file://` URLs map to local paths.
    /// Anything else, including strings that fail to parse as URLs, is a path.
    pub fn parse(source: &str) -> Self {
        match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => SourceLocation::Remote(url),
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => SourceLocation::Local(path),
                Err(()) => SourceLocation::Local(PathBuf::from(url.path())),
            },
            _ => SourceLocation::Local(PathBuf::from(source)),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SourceLocation::Remote(_))
    }
}

/// Hex md5 digest of a source string, the key for all derived files.
pub fn source_key(source: &str) -> String {
    hex::encode(Md5::digest(source.as_bytes()))
}

/// Errors from downloading remote sources.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP client setup failed: {reason}")]
    Client { reason: String },

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("{url} responded with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned an empty body")]
    EmptyBody { url: String },

    #[error("I/O error while saving download: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads remote sources into local cache files.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl SourceFetcher {
    /// # Errors
    ///
    /// - `FetchError::Client` - TLS backend or client configuration failed
    pub fn new(config: &NetworkConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Client {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            timeout: config.download_timeout,
        })
    }

    /// Downloads `url` to `dest` unless a non-empty copy already exists.
    ///
    /// The body is streamed into a uniquely named sibling file and renamed
    /// into place, so readers never observe a partial download.
    ///
    /// # Errors
    ///
    /// - `FetchError::Request` - Connection failed or timed out
    /// - `FetchError::Status` - Server answered with a non-success status
    /// - `FetchError::EmptyBody` - Server answered with no bytes
    /// - `FetchError::Io` - Destination could not be written
    pub async fn fetch_to(&self, url: &Url, dest: &Path) -> Result<u64, FetchError> {
        if let Ok(existing) = tokio::fs::metadata(dest).await
            && existing.is_file()
            && existing.len() > 0
        {
            tracing::trace!("Reusing cached download {}", dest.display());
            return Ok(existing.len());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!("Downloading {} (timeout {:?})", url, self.timeout);

        let request_error = |e: reqwest::Error| FetchError::Request {
            url: url.to_string(),
            reason: if e.is_timeout() {
                "timed out".to_string()
            } else {
                e.to_string()
            },
        };

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let staging = dest.with_file_name(format!(
            ".{}.{}.part",
            dest.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("download"),
            uuid::Uuid::new_v4()
        ));

        let written = match self.write_body(&mut response, &staging).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
        };

        if written == 0 {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }

        tokio::fs::rename(&staging, dest).await?;
        tracing::debug!("Saved {} bytes from {} to {}", written, url, dest.display());
        Ok(written)
    }

    async fn write_body(
        &self,
        response: &mut reqwest::Response,
        staging: &Path,
    ) -> Result<u64, FetchError> {
        let mut file = tokio::fs::File::create(staging).await?;
        let mut written = 0u64;
        let url = response.url().to_string();

        loop {
            let chunk = response.chunk().await.map_err(|e| FetchError::Request {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tempfile::tempdir;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_source_classification() {
        assert!(SourceLocation::parse("https://cdn.example.com/a.mp3").is_remote());
        assert!(SourceLocation::parse("http://cdn.example.com/a.mp3").is_remote());
        assert_eq!(
            SourceLocation::parse("/srv/music/a.mp3"),
            SourceLocation::Local(PathBuf::from("/srv/music/a.mp3"))
        );
        assert_eq!(
            SourceLocation::parse("relative/a.mp3"),
            SourceLocation::Local(PathBuf::from("relative/a.mp3"))
        );
        assert!(!SourceLocation::parse("ftp://example.com/a.mp3").is_remote());
    }

    #[test]
    fn test_source_key_is_md5_hex() {
        assert_eq!(source_key(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(source_key("a"), source_key("a"));
        assert_ne!(source_key("a"), source_key("b"));
    }

    #[tokio::test]
    async fn test_fetch_downloads_once() {
        let base = serve(Router::new().route("/a.mp3", get(|| async { vec![7u8; 4096] }))).await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("sources").join("a.mp3");
        let fetcher = SourceFetcher::new(&NetworkConfig::default()).unwrap();
        let url = Url::parse(&format!("{base}/a.mp3")).unwrap();

        assert_eq!(fetcher.fetch_to(&url, &dest).await.unwrap(), 4096);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 4096]);

        // Cached copy is reused even if the origin changes.
        std::fs::write(&dest, b"cached").unwrap();
        assert_eq!(fetcher.fetch_to(&url, &dest).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_fetch_rejects_error_status() {
        let base = serve(Router::new().route(
            "/missing.mp3",
            get(|| async { (StatusCode::NOT_FOUND, "Not Found") }),
        ))
        .await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing.mp3");
        let fetcher = SourceFetcher::new(&NetworkConfig::default()).unwrap();
        let url = Url::parse(&format!("{base}/missing.mp3")).unwrap();

        let result = fetcher.fetch_to(&url, &dest).await;
        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
        assert!(!dest.exists());
    }
}
