//! Turns a user supplied spec into a stable identity without downloading the
//! bundle.
use std::{fmt, time::Duration};

use indexmap::IndexSet;
use meca_config::Config;
use percent_encoding::percent_decode_str;
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap};
use reqwest_middleware::ClientWithMiddleware;
use tracing::instrument;
use url::Url;

use crate::{
    error::{ProbeFailure, ResolveError},
    util::hashed_slug,
};

/// A weak indicator of whether the content behind a URL changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeSignal {
    /// The value of the `ETag` header.
    EntityTag(String),
    /// The value of the `Content-Length` header.
    ContentLength(u64),
    /// The server sent neither header.
    Unknown,
}

impl ChangeSignal {
    /// Reads the signal from the headers of a probe response, preferring the
    /// entity tag over the content length.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let etag = headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(etag) = etag {
            return Self::EntityTag(etag.to_string());
        }

        headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .map_or(Self::Unknown, Self::ContentLength)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for ChangeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeSignal::EntityTag(etag) => f.write_str(etag),
            ChangeSignal::ContentLength(len) => write!(f, "{len}"),
            ChangeSignal::Unknown => Ok(()),
        }
    }
}

/// The identity of a bundle, computed once per resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    canonical_url: Url,
    change_signal: ChangeSignal,
    slug: String,
}

impl ResolvedIdentity {
    pub fn new(canonical_url: Url, change_signal: ChangeSignal) -> Self {
        let slug = hashed_slug(&canonical_url, &change_signal.to_string());
        Self {
            canonical_url,
            change_signal,
            slug,
        }
    }

    /// The URL to fetch the bundle from, including its query and fragment.
    pub fn canonical_url(&self) -> &Url {
        &self.canonical_url
    }

    pub fn change_signal(&self) -> &ChangeSignal {
        &self.change_signal
    }

    /// The identity slug, `meca-<digest>`.
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// The slug if it actually tracks the content, `None` if the server gave
    /// nothing to detect changes with and every build must start fresh.
    pub fn content_id(&self) -> Option<&str> {
        self.change_signal.is_known().then_some(self.slug.as_str())
    }
}

fn invalid_spec(spec: &str, reason: impl Into<String>) -> ResolveError {
    ResolveError::InvalidSpec {
        spec: spec.to_string(),
        reason: reason.into(),
    }
}

/// Parses a raw spec into an absolute `http` or `https` URL.
///
/// The spec is percent-decoded once first, hosts commonly hand specs over in
/// their URL-encoded form.
pub fn parse_spec(spec: &str) -> Result<Url, ResolveError> {
    let decoded = percent_decode_str(spec.trim())
        .decode_utf8()
        .map_err(|_| invalid_spec(spec, "not valid UTF-8 after percent-decoding"))?;
    parse_url(&decoded).map_err(|err| match err {
        ResolveError::InvalidSpec { reason, .. } => invalid_spec(spec, reason),
        err => err,
    })
}

/// Parses an already decoded URL, keeping its escapes as they are.
pub fn parse_url(raw: &str) -> Result<Url, ResolveError> {
    let invalid = |reason: &str| invalid_spec(raw, reason);
    let url = Url::parse(raw.trim()).map_err(|err| invalid(&err.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("only http and https URLs are supported"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("the URL has no host"));
    }

    Ok(url)
}

/// Rejects the URL if an allow-list is configured and its host is not on it.
pub fn check_origin(url: &Url, allowed_origins: &IndexSet<String>) -> Result<(), ResolveError> {
    if allowed_origins.is_empty() {
        return Ok(());
    }

    let host = url.host_str().unwrap_or_default();
    if allowed_origins.contains(host) {
        Ok(())
    } else {
        Err(ResolveError::OriginNotAllowed {
            url: url.clone(),
            host: host.to_string(),
        })
    }
}

/// Resolves specs to [`ResolvedIdentity`] values using a HEAD probe.
#[derive(Clone)]
pub struct IdentityResolver {
    client: ClientWithMiddleware,
    allowed_origins: IndexSet<String>,
    probe_timeout: Duration,
}

impl IdentityResolver {
    pub fn new(client: ClientWithMiddleware, config: &Config) -> Self {
        Self {
            client,
            allowed_origins: config.allowed_origins().clone(),
            probe_timeout: config.probe_timeout(),
        }
    }

    /// Checks the shape and origin of a spec without touching the network.
    pub fn validate(&self, spec: &str) -> Result<Url, ResolveError> {
        let url = parse_spec(spec)?;
        check_origin(&url, &self.allowed_origins)?;
        Ok(url)
    }

    /// Like [`IdentityResolver::validate`] for a URL that was decoded before,
    /// such as one taken from a repository URL.
    pub fn validate_url(&self, raw: &str) -> Result<Url, ResolveError> {
        let url = parse_url(raw)?;
        check_origin(&url, &self.allowed_origins)?;
        Ok(url)
    }

    /// Validates the spec and probes the URL it points at.
    #[instrument(skip(self))]
    pub async fn resolve(&self, spec: &str) -> Result<ResolvedIdentity, ResolveError> {
        let url = self.validate(spec)?;
        self.probe(url).await
    }

    /// Issues a HEAD request against an already validated URL and derives the
    /// identity from the response headers.
    pub async fn probe(&self, url: Url) -> Result<ResolvedIdentity, ResolveError> {
        let unreachable = |reason: ProbeFailure| ResolveError::Unreachable {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .head(url.clone())
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|err| unreachable(err.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unreachable(ProbeFailure::Status(status)));
        }

        let change_signal = ChangeSignal::from_headers(response.headers());
        if !change_signal.is_known() {
            tracing::warn!("{url} sent neither an ETag nor a Content-Length header");
        }

        let identity = ResolvedIdentity::new(url, change_signal);
        tracing::debug!("resolved {} to {}", identity.canonical_url(), identity.slug());
        Ok(identity)
    }
}
