//! Remote byte source for the download stage
//!
//! The download manager only needs "GET this URL and give me the body as a
//! stream of chunks". Keeping that behind a trait lets tests drive the
//! manager with in-memory bodies that fail mid-stream or count concurrency.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, Url};
use std::time::Duration;
use thiserror::Error;

/// Error produced while fetching a remote body
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GET {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Body stream failed: {0}")]
    Body(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open response body
pub struct RemoteBody {
    /// Declared size, when the server sends one
    pub content_length: Option<u64>,
    /// Body bytes in arrival order
    pub chunks: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

impl std::fmt::Debug for RemoteBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Source of remote archive bodies
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a GET for `url`; non-success statuses are errors
    async fn get(&self, url: &Url) -> Result<RemoteBody, TransportError>;
}

/// HTTP(S) transport backed by a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a transport with an optional whole-request timeout
    pub fn new(timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .user_agent(concat!("cnpj-etl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<RemoteBody, TransportError> {
        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let content_length = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TransportError::from))
            .boxed();

        Ok(RemoteBody {
            content_length,
            chunks,
        })
    }
}
