//! The host facing side of the crate.
//!
//! A [`RepoProvider`] validates a spec and resolves it to an identity when a
//! launch is requested, a [`ContentProvider`] later recognizes the repository
//! URL handed over by the host and materializes the bundle for a build.
use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use meca_config::Config;
use meca_consts::consts;
use reqwest_middleware::ClientWithMiddleware;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{FetchError, ResolveError},
    progress::{NoProgressHandler, ProgressHandler},
    resolver::{IdentityResolver, ResolvedIdentity},
    source::BundleSource,
    util::{from_meca_url, to_meca_url},
};

/// Texts a host shows in its launch form for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderLabels {
    pub text: &'static str,
    pub tag_text: &'static str,
    pub ref_prop_disabled: bool,
    pub label_prop_disabled: bool,
}

/// Host side provider, turns a user supplied spec into a buildable
/// repository.
#[async_trait]
pub trait RepoProvider: Send + Sync {
    /// Short human readable name.
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    fn labels(&self) -> ProviderLabels;

    /// The spec exactly as it was supplied, for ban-list and quota checks.
    fn spec(&self) -> &str;

    /// The URL handed to the build side.
    fn repo_url(&self) -> String;

    /// Resolves the spec to an identity, checking that it is reachable.
    async fn resolved_ref(&self) -> Result<ResolvedIdentity, ResolveError>;

    /// The URL of the content at the resolved identity.
    fn resolved_ref_url(&self, identity: &ResolvedIdentity) -> Url;

    /// A slug that is unique for the content of the repository.
    fn build_slug(&self, identity: &ResolvedIdentity) -> String;
}

/// Build side provider, recognizes repository URLs and materializes their
/// content.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// What [`ContentProvider::detect`] learned about a spec.
    type Descriptor: Send + Sync;

    /// Returns a descriptor if this provider can fetch the spec, `None`
    /// otherwise.
    async fn detect(&self, spec: &str) -> Option<Self::Descriptor>;

    /// Fetches the content into `output_dir`, which must already exist. The
    /// stream yields progress messages.
    fn fetch(
        &self,
        descriptor: &Self::Descriptor,
        output_dir: &Path,
    ) -> BoxStream<'static, Result<String, FetchError>>;

    /// An id that changes whenever the content changes, `None` if every
    /// build must start fresh.
    fn content_id(&self, descriptor: &Self::Descriptor) -> Option<String>;
}

/// Repo provider for MECA bundles behind a plain URL.
pub struct MecaRepoProvider {
    spec: String,
    url: Url,
    resolver: IdentityResolver,
}

impl MecaRepoProvider {
    /// Creates the provider, rejecting malformed specs and specs on origins
    /// that are not allowed. No network request is made.
    pub fn new(
        spec: impl Into<String>,
        client: ClientWithMiddleware,
        config: &Config,
    ) -> Result<Self, ResolveError> {
        let spec = spec.into();
        let resolver = IdentityResolver::new(client, config);
        let url = resolver.validate(&spec)?;
        Ok(Self {
            spec,
            url,
            resolver,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RepoProvider for MecaRepoProvider {
    fn name(&self) -> &str {
        consts::PROVIDER_NAME
    }

    fn display_name(&self) -> &str {
        consts::PROVIDER_DISPLAY_NAME
    }

    fn labels(&self) -> ProviderLabels {
        ProviderLabels {
            text: "MECA Bundle URL (https://journals.curvenote.com/agu/submissions/12345/meca.zip)",
            tag_text: "<no tag required>",
            ref_prop_disabled: true,
            label_prop_disabled: true,
        }
    }

    fn spec(&self) -> &str {
        &self.spec
    }

    fn repo_url(&self) -> String {
        to_meca_url(&self.url)
    }

    async fn resolved_ref(&self) -> Result<ResolvedIdentity, ResolveError> {
        self.resolver.probe(self.url.clone()).await
    }

    fn resolved_ref_url(&self, identity: &ResolvedIdentity) -> Url {
        identity.canonical_url().clone()
    }

    fn build_slug(&self, identity: &ResolvedIdentity) -> String {
        identity.slug().to_string()
    }
}

/// A MECA bundle recognized by [`MecaContentProvider::detect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MecaDescriptor {
    pub url: Url,
    /// `None` if the bundle could not be probed.
    pub identity: Option<ResolvedIdentity>,
}

/// Content provider for `http+meca://` and `https+meca://` repository URLs.
pub struct MecaContentProvider {
    client: ClientWithMiddleware,
    config: Config,
    resolver: IdentityResolver,
    progress: Arc<dyn ProgressHandler>,
    cancellation: CancellationToken,
}

impl MecaContentProvider {
    pub fn new(client: ClientWithMiddleware, config: Config) -> Self {
        let resolver = IdentityResolver::new(client.clone(), &config);
        Self {
            client,
            config,
            resolver,
            progress: Arc::new(NoProgressHandler),
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_progress_handler(mut self, handler: Arc<dyn ProgressHandler>) -> Self {
        self.progress = handler;
        self
    }

    /// Every fetch started by this provider is aborted when the token is
    /// cancelled.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

#[async_trait]
impl ContentProvider for MecaContentProvider {
    type Descriptor = MecaDescriptor;

    async fn detect(&self, spec: &str) -> Option<MecaDescriptor> {
        let plain = from_meca_url(spec)?;
        let url = match self.resolver.validate_url(&plain) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!("not fetching {spec}: {err}");
                return None;
            }
        };

        let identity = match self.resolver.probe(url.clone()).await {
            Ok(identity) => Some(identity),
            Err(err) => {
                tracing::warn!("{err}, the bundle will be rebuilt from scratch");
                None
            }
        };

        Some(MecaDescriptor { url, identity })
    }

    fn fetch(
        &self,
        descriptor: &MecaDescriptor,
        output_dir: &Path,
    ) -> BoxStream<'static, Result<String, FetchError>> {
        BundleSource::new(descriptor.url.clone(), self.client.clone(), &self.config)
            .with_progress_handler(self.progress.clone())
            .with_cancellation_token(self.cancellation.child_token())
            .fetch(output_dir)
    }

    fn content_id(&self, descriptor: &MecaDescriptor) -> Option<String> {
        descriptor
            .identity
            .as_ref()
            .and_then(ResolvedIdentity::content_id)
            .map(str::to_string)
    }
}
