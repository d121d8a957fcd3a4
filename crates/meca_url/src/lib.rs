//! Resolve MECA bundle URLs to stable identities and unpack their payload.
//!
//! The [`IdentityResolver`] validates a spec and probes it with a `HEAD`
//! request, the resulting [`ResolvedIdentity`] carries the slug that decides
//! whether a previous build can be reused. [`BundleSource`] downloads the
//! bundle and moves its payload into an output directory. The providers in
//! [`provider`] wire both into a host.

mod error;
pub mod extract;
pub mod manifest;
pub mod progress;
pub mod provider;
mod reqwest;
pub mod resolver;
mod source;
mod util;

pub use self::reqwest::build_reqwest_client;
pub use error::{ExtractError, FetchError, ManifestError, ProbeFailure, ResolveError};
pub use manifest::{Manifest, ManifestLookup, PayloadRoot, PayloadRootSource};
pub use progress::{NoProgressHandler, ProgressHandler};
pub use provider::{
    ContentProvider, MecaContentProvider, MecaDescriptor, MecaRepoProvider, ProviderLabels,
    RepoProvider,
};
pub use resolver::{ChangeSignal, IdentityResolver, ResolvedIdentity, parse_spec, parse_url};
pub use source::BundleSource;
pub use util::{from_meca_url, hashed_slug, to_meca_url};
