use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use fs_err as fs;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use indicatif::ProgressBar;
use meca_config::Config;
use meca_consts::consts;
use reqwest::header::ACCEPT;
use reqwest_middleware::ClientWithMiddleware;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};
use url::Url;

use crate::{
    error::{ExtractError, FetchError},
    extract,
    manifest::{ManifestLookup, PayloadRoot, PayloadRootSource},
    progress::{NoProgressHandler, ProgressHandler},
};

/// A bundle behind a URL that can be downloaded and unpacked into a
/// directory.
///
/// Every fetch works in its own temporary directory, which is removed when
/// the fetch finishes, fails, is cancelled, or its progress stream is dropped.
#[derive(Clone)]
pub struct BundleSource {
    url: Url,
    client: ClientWithMiddleware,
    strict: bool,
    temp_dir: Option<PathBuf>,
    progress: Arc<dyn ProgressHandler>,
    cancellation: CancellationToken,
}

impl BundleSource {
    /// Initialize a new bundle source.
    pub fn new(url: Url, client: ClientWithMiddleware, config: &Config) -> Self {
        Self {
            url,
            client,
            strict: config.validate_bundle(),
            temp_dir: config.temp_dir().map(Path::to_path_buf),
            progress: Arc::new(NoProgressHandler),
            cancellation: CancellationToken::new(),
        }
    }

    /// Set the [`ProgressHandler`] to use for downloads and extraction.
    #[must_use]
    pub fn with_progress_handler(mut self, handler: Arc<dyn ProgressHandler>) -> Self {
        self.progress = handler;
        self
    }

    /// Abort the fetch when the given token is cancelled.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Downloads the bundle and moves its payload into `output_dir`, which
    /// must already exist.
    ///
    /// Nothing happens until the returned stream is polled. Each item is a
    /// progress message for a completed stage, the stream ends after the last
    /// stage or after the first error:
    ///
    ///   - Create a temporary working directory.
    ///   - Stream the archive into it.
    ///   - Check that the archive is a well-formed zip file.
    ///   - Unpack it.
    ///   - Locate the payload through the manifest, falling back to `bundle/`
    ///     and then the bundle root.
    ///   - Move the top-level entries of the payload into `output_dir`.
    ///   - Remove the working directory.
    pub fn fetch(
        self,
        output_dir: impl Into<PathBuf>,
    ) -> BoxStream<'static, Result<String, FetchError>> {
        let span = tracing::debug_span!("fetch_bundle", url = %self.url);
        let pipeline = Pipeline {
            source: self,
            output_dir: output_dir.into(),
            stage: Stage::Start,
            span,
        };

        futures::stream::try_unfold(pipeline, |mut pipeline| async move {
            let span = pipeline.span.clone();
            let message = pipeline.advance().instrument(span).await?;
            Ok(message.map(|message| (message, pipeline)))
        })
        .boxed()
    }

    /// Drives a fetch to completion, returning the progress messages.
    pub async fn fetch_to_end(
        self,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Vec<String>, FetchError> {
        self.fetch(output_dir).try_collect().await
    }

    fn progress_bar(&self, prefix: &str, total: u64) -> ProgressBar {
        let bar = ProgressBar::new(total).with_style(self.progress.default_bytes_style());
        bar.set_prefix(prefix.to_string());
        self.progress.add_progress_bar(bar)
    }

    fn create_workdir(&self) -> Result<TempDir, FetchError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("meca-");
        let workdir = match &self.temp_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };
        Ok(workdir)
    }

    /// Streams the archive to `archive_path`, returning the number of bytes
    /// written.
    async fn download_archive(&self, archive_path: &Path) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, consts::BUNDLE_MEDIA_TYPE)
            .send()
            .await
            .map_err(|err| FetchError::download(&self.url, err))?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus {
                url: self.url.clone(),
                status: response.status(),
            });
        }

        let total = response.content_length().unwrap_or(0);
        let progress_bar = self.progress_bar("Downloading", total);

        let mut file = fs_err::tokio::File::create(archive_path).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| FetchError::download(&self.url, err))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress_bar.inc(chunk.len() as u64);
        }
        file.flush().await?;
        progress_bar.finish_with_message("Downloaded");

        Ok(written)
    }

    /// Checks that the downloaded file is a zip archive.
    async fn validate_archive(
        &self,
        workdir: TempDir,
        archive: PathBuf,
    ) -> Result<(TempDir, usize), FetchError> {
        let strict = self.strict;
        let url = self.url.clone();
        in_workdir(workdir, move || {
            extract::validate_zip(&archive, strict).map_err(|err| match err {
                ExtractError::Io(err) => FetchError::Io(err),
                err => FetchError::InvalidArchive {
                    url,
                    reason: err.to_string(),
                },
            })
        })
        .await
    }

    /// Unpacks the archive into `target` and removes the archive.
    async fn extract_archive(
        &self,
        workdir: TempDir,
        archive: PathBuf,
        target: PathBuf,
    ) -> Result<TempDir, FetchError> {
        let handler = self.progress.clone();
        let (workdir, ()) = in_workdir(workdir, move || {
            extract::extract_zip(&archive, &target, handler.as_ref())?;
            fs::remove_file(&archive)?;
            Ok(())
        })
        .await?;
        Ok(workdir)
    }
}

/// Runs blocking work on files inside `workdir`.
///
/// The working directory is owned by the blocking task until the work ends,
/// so it outlives the work even if the awaiting future is dropped.
async fn in_workdir<T, F>(workdir: TempDir, work: F) -> Result<(TempDir, T), FetchError>
where
    F: FnOnce() -> Result<T, FetchError> + Send + 'static,
    T: Send + 'static,
{
    let (workdir, result) = tokio::task::spawn_blocking(move || {
        let result = work();
        (workdir, result)
    })
    .await?;
    result.map(|value| (workdir, value))
}

/// The stages of a fetch, each carrying what the next one needs.
enum Stage {
    Start,
    Download { workdir: TempDir },
    Validate { workdir: TempDir, archive: PathBuf },
    Extract { workdir: TempDir, archive: PathBuf },
    Locate { workdir: TempDir, bundle_root: PathBuf },
    Move { workdir: TempDir, payload: PayloadRoot },
    Cleanup { workdir: TempDir },
    Finish,
    Done,
}

struct Pipeline {
    source: BundleSource,
    output_dir: PathBuf,
    stage: Stage,
    span: Span,
}

impl Pipeline {
    /// Runs the current stage, returning its progress message or `None` once
    /// all stages ran.
    async fn advance(&mut self) -> Result<Option<String>, FetchError> {
        let stage = std::mem::replace(&mut self.stage, Stage::Done);
        if !matches!(stage, Stage::Done) && self.source.cancellation.is_cancelled() {
            return Err(self.cancelled());
        }

        let (message, next) = match stage {
            Stage::Start => {
                if !self.output_dir.is_dir() {
                    return Err(FetchError::MissingOutputDir(self.output_dir.clone()));
                }
                let workdir = self.source.create_workdir()?;
                tracing::debug!("working in {}", workdir.path().display());
                (
                    format!("Fetching MECA bundle {}", self.source.url),
                    Stage::Download { workdir },
                )
            }
            Stage::Download { workdir } => {
                let archive = workdir.path().join(consts::ARCHIVE_FILE_NAME);
                let download = self.source.download_archive(&archive);
                let written = match self.source.cancellation.run_until_cancelled(download).await {
                    Some(result) => result?,
                    None => return Err(self.cancelled()),
                };
                (
                    format!("Downloaded {written} bytes to {}", archive.display()),
                    Stage::Validate { workdir, archive },
                )
            }
            Stage::Validate { workdir, archive } => {
                let (workdir, entries) =
                    self.source.validate_archive(workdir, archive.clone()).await?;
                (
                    format!("Validated bundle archive with {entries} entries"),
                    Stage::Extract { workdir, archive },
                )
            }
            Stage::Extract { workdir, archive } => {
                let bundle_root = workdir.path().join(consts::UNPACK_DIR);
                let workdir = self
                    .source
                    .extract_archive(workdir, archive.clone(), bundle_root.clone())
                    .await?;
                (
                    format!("Extracted {}", archive.display()),
                    Stage::Locate {
                        workdir,
                        bundle_root,
                    },
                )
            }
            Stage::Locate {
                workdir,
                bundle_root,
            } => {
                let lookup = ManifestLookup::read(&bundle_root);
                match &lookup {
                    ManifestLookup::Found(manifest) => tracing::debug!(
                        "manifest names '{}' as the source directory",
                        manifest.source_directory()
                    ),
                    ManifestLookup::Missing => {
                        tracing::warn!("the bundle has no {}", consts::MANIFEST_FILE)
                    }
                    ManifestLookup::Unreadable(err) => {
                        tracing::warn!("ignoring the manifest of the bundle: {err}")
                    }
                }
                let payload = PayloadRoot::locate(&bundle_root, &lookup);
                let message = match payload.source() {
                    PayloadRootSource::Manifest => format!(
                        "Found the source directory '{}' in the manifest",
                        payload
                            .path()
                            .strip_prefix(&bundle_root)
                            .unwrap_or(payload.path())
                            .display()
                    ),
                    PayloadRootSource::ConventionalDir => format!(
                        "No usable manifest source directory, found {}/ folder",
                        consts::BUNDLE_DIR
                    ),
                    PayloadRootSource::ArchiveRoot => format!(
                        "No usable manifest source directory and no {}/ folder, \
                         using the whole bundle",
                        consts::BUNDLE_DIR
                    ),
                };
                (message, Stage::Move { workdir, payload })
            }
            Stage::Move { workdir, payload } => {
                let payload_dir = payload.path().to_path_buf();
                let output_dir = self.output_dir.clone();
                let (workdir, moved) =
                    in_workdir(workdir, move || move_payload(&payload_dir, &output_dir)).await?;
                (
                    format!("Moved {moved} entries into {}", self.output_dir.display()),
                    Stage::Cleanup { workdir },
                )
            }
            Stage::Cleanup { workdir } => {
                let path = workdir.path().to_path_buf();
                if let Err(err) = workdir.close() {
                    tracing::warn!("failed to remove {}: {err}", path.display());
                }
                (format!("Removed {}", path.display()), Stage::Finish)
            }
            Stage::Finish => (
                format!("MECA bundle {} fetched and unpacked", self.source.url),
                Stage::Done,
            ),
            Stage::Done => return Ok(None),
        };

        tracing::debug!("{message}");
        self.stage = next;
        Ok(Some(message))
    }

    fn cancelled(&self) -> FetchError {
        FetchError::Cancelled {
            url: self.source.url.clone(),
        }
    }
}

/// Moves the top-level entries of `payload` into `output_dir`.
///
/// Fails before moving anything if one of the entries already exists in the
/// output directory.
fn move_payload(payload: &Path, output_dir: &Path) -> Result<usize, FetchError> {
    let mut entries = fs::read_dir(payload)?
        .map(|entry| entry.map(|entry| entry.file_name()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    if let Some(existing) = entries
        .iter()
        .map(|name| output_dir.join(name))
        .find(|dest| dest.symlink_metadata().is_ok())
    {
        return Err(FetchError::OutputCollision { path: existing });
    }

    for name in &entries {
        move_entry(&payload.join(name), output_dir, &output_dir.join(name))?;
    }

    Ok(entries.len())
}

/// Renames `src` to `dest`, copying instead when they are on different file
/// systems.
fn move_entry(src: &Path, output_dir: &Path, dest: &Path) -> Result<(), FetchError> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            tracing::debug!("copying {} across file systems", src.display());
            let options = fs_extra::dir::CopyOptions::new();
            fs_extra::move_items(&[src], output_dir, &options)?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
