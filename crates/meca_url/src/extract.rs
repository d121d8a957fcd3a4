//! Helpers to validate and extract zip archives.
use std::{
    io::{BufReader, Read},
    path::Path,
};

use fs_err as fs;
use fs_err::File;
use indicatif::{ProgressBar, ProgressFinish};

use crate::{error::ExtractError, progress::ProgressHandler};

/// Signatures a zip file may start with: a local file header, an empty
/// archive, or a spanned archive.
const ZIP_SIGNATURES: [[u8; 4]; 3] = [*b"PK\x03\x04", *b"PK\x05\x06", *b"PK\x07\x08"];

/// File type bits of a unix mode.
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Checks whether the file starts with a zip signature.
pub fn has_zip_signature(archive: impl AsRef<Path>) -> Result<bool, ExtractError> {
    let mut magic = [0u8; 4];
    let mut file = File::open(archive.as_ref())?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(ZIP_SIGNATURES.contains(&magic)),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Verifies that the file is a well-formed zip archive and returns the number
/// of entries it contains.
///
/// The signature and the central directory are always checked and symbolic
/// links are always rejected. With `strict` every entry is read back to verify
/// its checksum and rejected if its path would escape the extraction
/// directory.
pub fn validate_zip(archive: impl AsRef<Path>, strict: bool) -> Result<usize, ExtractError> {
    let archive = archive.as_ref();
    if !has_zip_signature(archive)? {
        return Err(ExtractError::InvalidZip(
            "the file does not start with a zip signature".to_string(),
        ));
    }

    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| ExtractError::InvalidZip(e.to_string()))?;

    reject_symlinks(&mut zip)?;

    if strict {
        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .map_err(|e| ExtractError::InvalidZip(e.to_string()))?;
            let name = entry.name().to_string();
            if entry.enclosed_name().is_none() {
                return Err(ExtractError::UnsafeEntry(name));
            }
            std::io::copy(&mut entry, &mut std::io::sink()).map_err(|e| {
                ExtractError::CorruptEntry {
                    name,
                    reason: e.to_string(),
                }
            })?;
        }
    }

    Ok(zip.len())
}

/// Fails on the first entry that is a symbolic link.
fn reject_symlinks<R: Read + std::io::Seek>(
    zip: &mut zip::ZipArchive<R>,
) -> Result<(), ExtractError> {
    for index in 0..zip.len() {
        let entry = zip
            .by_index_raw(index)
            .map_err(|e| ExtractError::InvalidZip(e.to_string()))?;
        if entry.unix_mode().is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
            return Err(ExtractError::SymlinkEntry(entry.name().to_string()));
        }
    }
    Ok(())
}

/// Extracts a zip archive into the target directory, keeping its layout.
///
/// Symbolic links and entries whose path would escape the target directory
/// make the extraction fail.
pub fn extract_zip(
    archive: impl AsRef<Path>,
    target_directory: impl AsRef<Path>,
    handler: &dyn ProgressHandler,
) -> Result<(), ExtractError> {
    let archive = archive.as_ref();
    let target_directory = target_directory.as_ref();
    fs::create_dir_all(target_directory)?;

    let len = archive.metadata().map(|m| m.len()).unwrap_or(1);
    let progress_bar = handler.add_progress_bar(
        ProgressBar::new(len)
            .with_finish(ProgressFinish::AndLeave)
            .with_prefix("Extracting bundle")
            .with_style(handler.default_bytes_style()),
    );

    let file = File::open(archive)?;
    let buf_reader = BufReader::with_capacity(1024 * 1024, file);
    let wrapped = progress_bar.wrap_read(buf_reader);
    let mut archive =
        zip::ZipArchive::new(wrapped).map_err(|e| ExtractError::InvalidZip(e.to_string()))?;
    reject_symlinks(&mut archive)?;

    archive
        .extract(target_directory)
        .map_err(|e| ExtractError::ZipExtractionError(e.to_string()))?;

    progress_bar.finish_with_message("Extracted...");
    Ok(())
}
