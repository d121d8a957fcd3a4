/// Prefix of every identity slug and build slug.
pub const SLUG_PREFIX: &str = "meca";

/// Scheme marker appended to `http`/`https` so the host can dispatch a
/// repository URL to the MECA content provider, e.g. `https+meca://`.
pub const SCHEME_MARKER: &str = "meca";

pub const PROVIDER_NAME: &str = "MECA Bundle";
pub const PROVIDER_DISPLAY_NAME: &str = "MECA Bundle (URL)";

/// User agent sent with the reachability probe and the bundle download.
pub const USER_AGENT: &str = concat!("meca4binder/", env!("CARGO_PKG_VERSION"));

/// Media type requested when downloading a bundle.
pub const BUNDLE_MEDIA_TYPE: &str = "application/zip";

/// File name the downloaded bundle is stored under in the working directory.
pub const ARCHIVE_FILE_NAME: &str = "meca.zip";

/// Directory inside the working directory the bundle is unpacked into.
pub const UNPACK_DIR: &str = "unpacked";

/// Location of the manifest, relative to the bundle root.
pub const MANIFEST_FILE: &str = "manifest.xml";

/// The `item-type` of the manifest item pointing at the article sources.
pub const SOURCE_DIRECTORY_ITEM_TYPE: &str = "article-source-directory";

/// Conventional payload directory used when the manifest does not name one.
pub const BUNDLE_DIR: &str = "bundle";

pub const CONFIG_DIR: &str = "meca";
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable naming an additional configuration file.
pub const CONFIG_ENV_VAR: &str = "MECA_CONFIG";

/// Default number of seconds to wait for the reachability probe.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Default number of seconds a single read of the bundle download may stall.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 5 * 60;
