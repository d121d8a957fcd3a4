//! Locating the payload of an unpacked bundle.
//!
//! A bundle describes its layout in a `manifest.xml` at its root. The only
//! thing read from it is the directory holding the article sources:
//!
//! ```xml
//! <manifest xmlns="https://manuscriptexchange.org/schema/manifest" version="2.0">
//!   <item item-type="article-source-directory">
//!     <instance media-type="application/x-directory" href="bundle/"/>
//!   </item>
//! </manifest>
//! ```
//!
//! A missing or unusable manifest never fails a fetch, [`PayloadRoot::locate`]
//! falls back to a `bundle/` directory and then to the bundle root.
use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

use fs_err as fs;
use meca_consts::consts;
use percent_encoding::percent_decode_str;

use crate::error::ManifestError;

/// The parts of a bundle manifest the fetcher cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    source_directory: String,
}

impl Manifest {
    /// Parses a manifest document.
    pub fn parse(xml: &str) -> Result<Self, ManifestError> {
        let document = roxmltree::Document::parse(xml)?;

        let item = document
            .descendants()
            .find(is_source_directory_item)
            .ok_or(ManifestError::MissingItem(consts::SOURCE_DIRECTORY_ITEM_TYPE))?;

        let href = item
            .children()
            .filter(|node| node.has_tag_name("instance"))
            .find_map(instance_href)
            .ok_or(ManifestError::MissingHref(consts::SOURCE_DIRECTORY_ITEM_TYPE))?;

        Ok(Self {
            source_directory: href,
        })
    }

    /// Reads and parses the manifest file at `path`.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let xml = fs::read_to_string(path)?;
        Self::parse(&xml)
    }

    /// The href of the article source directory, relative to the bundle root.
    pub fn source_directory(&self) -> &str {
        &self.source_directory
    }
}

fn is_source_directory_item(node: &roxmltree::Node<'_, '_>) -> bool {
    let item_type = node.attribute("item-type").or_else(|| node.attribute("type"));
    node.has_tag_name("item") && item_type == Some(consts::SOURCE_DIRECTORY_ITEM_TYPE)
}

/// `href` is used both plain and with the xlink namespace.
fn instance_href(instance: roxmltree::Node<'_, '_>) -> Option<String> {
    instance
        .attributes()
        .find(|attr| attr.name() == "href")
        .map(|attr| attr.value().to_string())
}

/// Outcome of looking for the manifest of an unpacked bundle.
#[derive(Debug)]
pub enum ManifestLookup {
    Found(Manifest),
    Missing,
    Unreadable(ManifestError),
}

impl ManifestLookup {
    /// Looks for `manifest.xml` at the root of an unpacked bundle.
    pub fn read(bundle_root: &Path) -> Self {
        let path = bundle_root.join(consts::MANIFEST_FILE);
        if !path.is_file() {
            return Self::Missing;
        }
        match Manifest::from_path(&path) {
            Ok(manifest) => Self::Found(manifest),
            Err(err) => Self::Unreadable(err),
        }
    }
}

/// Which rule selected the payload root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRootSource {
    /// The directory named by the manifest.
    Manifest,
    /// The conventional `bundle/` directory.
    ConventionalDir,
    /// The root of the bundle itself.
    ArchiveRoot,
}

impl fmt::Display for PayloadRootSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadRootSource::Manifest => write!(f, "manifest"),
            PayloadRootSource::ConventionalDir => write!(f, "{}/ directory", consts::BUNDLE_DIR),
            PayloadRootSource::ArchiveRoot => write!(f, "bundle root"),
        }
    }
}

/// The directory of an unpacked bundle that holds the content to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRoot {
    path: PathBuf,
    source: PayloadRootSource,
}

impl PayloadRoot {
    /// Selects the payload root: the manifest's source directory if it exists
    /// inside the bundle, else `bundle/` if present, else the bundle root.
    pub fn locate(bundle_root: &Path, lookup: &ManifestLookup) -> Self {
        if let ManifestLookup::Found(manifest) = lookup {
            match resolve_href(bundle_root, manifest.source_directory()) {
                Some(path) => {
                    return Self {
                        path,
                        source: PayloadRootSource::Manifest,
                    };
                }
                None => tracing::warn!(
                    "the manifest points at '{}' which is not a directory in the bundle",
                    manifest.source_directory()
                ),
            }
        }

        let conventional = bundle_root.join(consts::BUNDLE_DIR);
        if is_dir_within(bundle_root, &conventional) {
            Self {
                path: conventional,
                source: PayloadRootSource::ConventionalDir,
            }
        } else {
            Self {
                path: bundle_root.to_path_buf(),
                source: PayloadRootSource::ArchiveRoot,
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> PayloadRootSource {
        self.source
    }
}

/// Resolves a manifest href to a directory inside `bundle_root`.
///
/// Absolute hrefs, hrefs leaving the bundle, and hrefs that do not name an
/// existing directory inside it resolve to `None`.
fn resolve_href(bundle_root: &Path, href: &str) -> Option<PathBuf> {
    let href = percent_decode_str(href).decode_utf8().ok()?;
    let mut path = bundle_root.to_path_buf();
    for component in Path::new(href.as_ref()).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    is_dir_within(bundle_root, &path).then_some(path)
}

/// Whether `path` is a directory, not a symbolic link, that stays inside
/// `root` once every link on the way is resolved.
fn is_dir_within(root: &Path, path: &Path) -> bool {
    let is_dir = fs::symlink_metadata(path).is_ok_and(|meta| meta.is_dir());
    let within = match (fs::canonicalize(root), fs::canonicalize(path)) {
        (Ok(root), Ok(path)) => path.starts_with(root),
        _ => false,
    };
    is_dir && within
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest xmlns="https://manuscriptexchange.org/schema/manifest" version="2.0">
  <item id="a-pdf" item-type="article-pdf">
    <instance media-type="application/pdf" href="article.pdf"/>
  </item>
  <item id="a-src" item-type="article-source-directory">
    <instance media-type="application/x-directory" href="bundle/"/>
  </item>
</manifest>"#;

    fn bundle_with(dirs: &[&str]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for dir in dirs {
            fs::create_dir_all(root.path().join(dir)).unwrap();
        }
        root
    }

    #[test]
    fn parses_source_directory() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.source_directory(), "bundle/");
    }

    #[test]
    fn parses_xlink_href_and_type_attribute() {
        let xml = r#"<manifest xmlns:xlink="http://www.w3.org/1999/xlink">
  <item type="article-source-directory">
    <instance xlink:href="sources/"/>
  </item>
</manifest>"#;
        let manifest = Manifest::parse(xml).unwrap();
        assert_eq!(manifest.source_directory(), "sources/");
    }

    #[rstest]
    #[case::not_xml("this is not xml")]
    #[case::unclosed("<manifest><item>")]
    fn rejects_malformed_xml(#[case] xml: &str) {
        assert!(matches!(Manifest::parse(xml), Err(ManifestError::Xml(_))));
    }

    #[test]
    fn rejects_manifest_without_source_item() {
        let xml = r#"<manifest>
  <item item-type="article-pdf"><instance href="a.pdf"/></item>
</manifest>"#;
        assert!(matches!(Manifest::parse(xml), Err(ManifestError::MissingItem(_))));
    }

    #[test]
    fn rejects_source_item_without_href() {
        let xml = r#"<manifest>
  <item item-type="article-source-directory"><instance/></item>
</manifest>"#;
        assert!(matches!(Manifest::parse(xml), Err(ManifestError::MissingHref(_))));
    }

    #[test]
    fn lookup_reports_missing_and_unreadable() {
        let root = bundle_with(&[]);
        assert!(matches!(
            ManifestLookup::read(root.path()),
            ManifestLookup::Missing
        ));

        fs::write(root.path().join(consts::MANIFEST_FILE), "<manifest>").unwrap();
        assert!(matches!(
            ManifestLookup::read(root.path()),
            ManifestLookup::Unreadable(ManifestError::Xml(_))
        ));

        fs::write(root.path().join(consts::MANIFEST_FILE), MANIFEST).unwrap();
        assert!(matches!(
            ManifestLookup::read(root.path()),
            ManifestLookup::Found(_)
        ));
    }

    #[test]
    fn manifest_directory_wins() {
        let root = bundle_with(&["sources", "bundle"]);
        let lookup = ManifestLookup::Found(Manifest {
            source_directory: "sources/".to_string(),
        });
        let payload = PayloadRoot::locate(root.path(), &lookup);
        assert_eq!(payload.source(), PayloadRootSource::Manifest);
        assert_eq!(payload.path(), root.path().join("sources"));
    }

    #[test]
    fn missing_manifest_falls_back_to_bundle_dir() {
        let root = bundle_with(&["bundle"]);
        let payload = PayloadRoot::locate(root.path(), &ManifestLookup::Missing);
        assert_eq!(payload.source(), PayloadRootSource::ConventionalDir);
        assert_eq!(payload.path(), root.path().join("bundle"));
    }

    #[test]
    fn unreadable_manifest_falls_back_to_root() {
        let root = bundle_with(&["other"]);
        let lookup = ManifestLookup::Unreadable(ManifestError::MissingItem(
            consts::SOURCE_DIRECTORY_ITEM_TYPE,
        ));
        let payload = PayloadRoot::locate(root.path(), &lookup);
        assert_eq!(payload.source(), PayloadRootSource::ArchiveRoot);
        assert_eq!(payload.path(), root.path());
    }

    #[rstest]
    #[case::missing_dir("does-not-exist/")]
    #[case::escapes("../")]
    #[case::absolute("/etc")]
    fn unusable_href_falls_back(#[case] href: &str) {
        let root = bundle_with(&["bundle"]);
        let lookup = ManifestLookup::Found(Manifest {
            source_directory: href.to_string(),
        });
        let payload = PayloadRoot::locate(root.path(), &lookup);
        assert_eq!(payload.source(), PayloadRootSource::ConventionalDir);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_never_the_payload() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let root = bundle_with(&["real"]);
        std::os::unix::fs::symlink(outside.path(), root.path().join("bundle")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("real/linked")).unwrap();

        let payload = PayloadRoot::locate(root.path(), &ManifestLookup::Missing);
        assert_eq!(payload.source(), PayloadRootSource::ArchiveRoot);

        for href in ["bundle/", "real/linked/"] {
            let lookup = ManifestLookup::Found(Manifest {
                source_directory: href.to_string(),
            });
            let payload = PayloadRoot::locate(root.path(), &lookup);
            assert_eq!(payload.source(), PayloadRootSource::ArchiveRoot, "{href}");
        }
    }

    #[test]
    fn href_may_be_percent_encoded() {
        let root = bundle_with(&["my bundle"]);
        let lookup = ManifestLookup::Found(Manifest {
            source_directory: "./my%20bundle/".to_string(),
        });
        let payload = PayloadRoot::locate(root.path(), &lookup);
        assert_eq!(payload.source(), PayloadRootSource::Manifest);
        assert_eq!(payload.path(), root.path().join("my bundle"));
    }
}
