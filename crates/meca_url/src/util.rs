use meca_consts::consts;
use url::Url;
use xxhash_rust::xxh3::xxh3_128;

/// Returns the URL without its query and fragment.
///
/// Signed links carry their signature in the query, stripping it keeps the
/// identity of the bundle stable across re-signed links.
pub fn strip_query_and_fragment(url: &Url) -> Url {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    stripped
}

/// Computes the identity slug of a bundle from its URL and a value that
/// changes whenever the bundle content changes.
///
/// The digest is a non-cryptographic 128-bit hash, stable across platforms.
pub fn hashed_slug(url: &Url, changes_with_content: &str) -> String {
    let stripped = strip_query_and_fragment(url);
    let digest = xxh3_128(format!("{stripped}-{changes_with_content}").as_bytes());
    format!("{}-{digest:032x}", consts::SLUG_PREFIX)
}

/// Converts a fetchable `http(s)` URL into the repository URL handed to the
/// host, `https://host/path` becomes `https+meca://host/path`.
pub fn to_meca_url(url: &Url) -> String {
    let rest = &url.as_str()[url.scheme().len()..];
    format!("{}+{}{rest}", url.scheme(), consts::SCHEME_MARKER)
}

/// Converts a repository URL with the MECA scheme marker back into the plain
/// URL, returns `None` for any other spec.
pub fn from_meca_url(spec: &str) -> Option<String> {
    let (scheme, rest) = spec.split_once("://")?;
    let (base, marker) = scheme.split_once('+')?;
    if !marker.eq_ignore_ascii_case(consts::SCHEME_MARKER) {
        return None;
    }
    if !(base.eq_ignore_ascii_case("http") || base.eq_ignore_ascii_case("https")) {
        return None;
    }
    Some(format!("{}://{rest}", base.to_ascii_lowercase()))
}
