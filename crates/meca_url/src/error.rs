use std::{path::PathBuf, sync::Arc};

use reqwest::StatusCode;
use reqwest_middleware::Error as ReqwestMiddlewareError;
use thiserror::Error;
use url::Url;

/// Errors that can occur while turning a spec into a [`crate::ResolvedIdentity`].
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("invalid URL '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("{url} is not on an allowed origin")]
    OriginNotAllowed { url: Url, host: String },

    #[error("{url} is unreachable: {reason}")]
    Unreachable { url: Url, reason: ProbeFailure },
}

/// Why the reachability probe did not succeed.
#[derive(Debug, Clone, Error)]
pub enum ProbeFailure {
    #[error("server responded with {0}")]
    Status(StatusCode),

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Transport(Arc<ReqwestMiddlewareError>),
}

impl From<ReqwestMiddlewareError> for ProbeFailure {
    fn from(err: ReqwestMiddlewareError) -> Self {
        let timed_out = match &err {
            ReqwestMiddlewareError::Reqwest(err) => err.is_timeout(),
            ReqwestMiddlewareError::Middleware(_) => false,
        };
        if timed_out {
            Self::Timeout
        } else {
            Self::Transport(Arc::new(err))
        }
    }
}

/// Errors that can occur while fetching and unpacking a bundle.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("failed to download {url}: {status}")]
    HttpStatus { url: Url, status: StatusCode },

    #[error("failed to download {url}")]
    Download {
        url: Url,
        #[source]
        source: Arc<ReqwestMiddlewareError>,
    },

    #[error("the file downloaded from {url} is not a valid bundle: {reason}")]
    InvalidArchive { url: Url, reason: String },

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("output directory '{}' does not exist", .0.display())]
    MissingOutputDir(PathBuf),

    #[error("refusing to overwrite '{}' in the output directory", path.display())]
    OutputCollision { path: PathBuf },

    #[error("fetching {url} was cancelled")]
    Cancelled { url: Url },

    #[error(transparent)]
    Io(Arc<std::io::Error>),

    #[error(transparent)]
    Join(Arc<tokio::task::JoinError>),
}

impl FetchError {
    pub(crate) fn download(url: &Url, err: impl Into<ReqwestMiddlewareError>) -> Self {
        Self::Download {
            url: url.clone(),
            source: Arc::new(err.into()),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<tokio::task::JoinError> for FetchError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(Arc::new(err))
    }
}

impl From<fs_extra::error::Error> for FetchError {
    fn from(err: fs_extra::error::Error) -> Self {
        Self::Io(Arc::new(std::io::Error::other(err)))
    }
}

/// Errors emitted while validating or unpacking an archive.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    #[error("invalid zip archive: {0}")]
    InvalidZip(String),

    #[error("corrupt entry '{name}': {reason}")]
    CorruptEntry { name: String, reason: String },

    #[error("entry '{0}' would be unpacked outside of the target directory")]
    UnsafeEntry(String),

    #[error("entry '{0}' is a symbolic link")]
    SymlinkEntry(String),

    #[error("failed to extract zip archive: {0}")]
    ZipExtractionError(String),
}

impl From<std::io::Error> for ExtractError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Reasons the manifest could not be used to locate the payload.
///
/// These never fail a fetch, they only select a fallback payload root.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("manifest has no `{0}` item")]
    MissingItem(&'static str),

    #[error("the `{0}` item has no instance with an href")]
    MissingHref(&'static str),
}
