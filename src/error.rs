use std::path::PathBuf;

use thiserror::Error;

/// One entry of a manifest list, as offered to the user when a tag resolves
/// to a multi-platform image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformChoice {
    pub platform: String,
    pub digest: String,
}

/// Errors produced while pulling and repackaging an image.
#[derive(Error, Debug)]
pub enum PullError {
    /// The reference string could not be parsed
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Challenge parsing or token negotiation failed
    #[error("authentication with {registry} failed: {message}")]
    Auth { registry: String, message: String },

    /// The manifest could not be fetched
    #[error("cannot fetch manifest for {reference}: {message}")]
    Resolution {
        reference: String,
        status: Option<u16>,
        message: String,
    },

    /// The tag points at a manifest list; the caller has to pick a digest
    #[error("{reference} is a multi-platform image, pull one of its {} manifests by digest", platforms.len())]
    PlatformSelectionRequired {
        reference: String,
        platforms: Vec<PlatformChoice>,
    },

    /// A blob could not be downloaded from any candidate URL, or streaming it failed
    #[error("failed to download {digest}: {message}")]
    Transfer { digest: String, message: String },

    /// The HTTP request itself failed (DNS, TLS, connection reset, ...)
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A manifest or config document did not have the expected shape
    #[error("unexpected document format: {0}")]
    Format(String),

    /// The output archive could not be written
    #[error("failed to write archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Working directory I/O
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PullError>;

/// Attach a human-readable context to filesystem errors in the working directory.
pub trait IoContext<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| PullError::Io {
            context: context(),
            source,
        })
    }
}

impl From<serde_json::Error> for PullError {
    fn from(e: serde_json::Error) -> Self {
        PullError::Format(e.to_string())
    }
}
