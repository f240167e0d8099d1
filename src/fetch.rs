//! Downloading documents into memory.

use std::time::Duration;

use reqwest::Url;
use tokio::{fs::File, io::AsyncReadExt as _};

use crate::{document::SourceDocument, error::FetchError, prelude::*};

/// How much of a local file we read at a time.
const FILE_CHUNK_SIZE: usize = 8192;

/// Interface for fetching a document by URI.
///
/// Implementations buffer the whole document before returning, and never
/// retry. Retry policy belongs to the caller, which can use
/// [`FetchError::is_transient`] to decide.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch the document at `uri`.
    async fn fetch(&self, uri: &str) -> Result<SourceDocument, FetchError>;
}

/// Fetches `http`, `https` and `file` URIs.
pub struct UriFetcher {
    client: reqwest::Client,
}

impl UriFetcher {
    /// Create a fetcher whose HTTP requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("cannot build HTTP client")?;
        Ok(Self { client })
    }

    /// Stream an HTTP response body into memory, one chunk at a time.
    async fn fetch_http(&self, uri: &str, url: Url) -> Result<Vec<u8>, FetchError> {
        let transport = |source| FetchError::Transport {
            uri: uri.to_owned(),
            source,
        };

        let mut response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                uri: uri.to_owned(),
                status,
            });
        }

        // Don't trust `Content-Length`, which may be missing or wrong.
        let mut buffer = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            trace!(len = chunk.len(), "Received chunk");
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

#[async_trait]
impl Fetcher for UriFetcher {
    #[instrument(level = "debug", skip_all, fields(uri = %uri))]
    async fn fetch(&self, uri: &str) -> Result<SourceDocument, FetchError> {
        let url = Url::parse(uri).map_err(|err| FetchError::InvalidUri {
            uri: uri.to_owned(),
            reason: err.to_string(),
        })?;
        let bytes = match url.scheme() {
            "http" | "https" => self.fetch_http(uri, url).await?,
            "file" => fetch_file(uri, &url).await?,
            other => {
                return Err(FetchError::InvalidUri {
                    uri: uri.to_owned(),
                    reason: format!("unsupported scheme {:?}", other),
                });
            }
        };
        debug!(len = bytes.len(), "Fetched document");
        Ok(SourceDocument::new(uri, bytes))
    }
}

/// Read a local `file://` URI into memory.
async fn fetch_file(uri: &str, url: &Url) -> Result<Vec<u8>, FetchError> {
    let path = url.to_file_path().map_err(|()| FetchError::InvalidUri {
        uri: uri.to_owned(),
        reason: "not a local file path".to_owned(),
    })?;
    let io_error = |source| FetchError::Io {
        path: path.clone(),
        source,
    };

    let mut file = File::open(&path).await.map_err(io_error)?;
    let mut buffer = Vec::new();
    let mut chunk = vec![0; FILE_CHUNK_SIZE];
    loop {
        let len = file.read(&mut chunk).await.map_err(io_error)?;
        if len == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..len]);
    }
    Ok(buffer)
}
