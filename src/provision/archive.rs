//! Release archive unpacking and extracted-binary lookup

use super::ProvisionError;
use flate2::read::GzDecoder;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Container format of a downloaded release asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    /// Detect the format from the asset name; `None` means a bare executable
    pub fn from_asset_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }
}

/// Bounds for the extracted-tree search
#[derive(Debug, Clone, Copy)]
pub struct SearchLimits {
    /// Directory levels below the root that may be entered
    pub max_depth: usize,
    /// Total directory entries that may be inspected
    pub max_entries: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_entries: 4096,
        }
    }
}

/// Unpack `archive` into `dest`, which must already exist
///
/// Entries whose paths would land outside `dest` are rejected.
pub fn extract(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), ProvisionError> {
    debug!("Extracting {} ({:?}) into {}", archive.display(), kind, dest.display());
    match kind {
        ArchiveKind::Zip => extract_zip(archive, dest),
        ArchiveKind::TarGz => extract_tar_gz(archive, dest),
    }
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ProvisionError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| extraction_failed(archive, e))?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| extraction_failed(archive, e))?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            ProvisionError::ArchiveExtraction(format!(
                "{}: entry {} escapes the extraction directory",
                archive.display(),
                entry.name()
            ))
        })?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), ProvisionError> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    let entries = tar.entries().map_err(|e| extraction_failed(archive, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extraction_failed(archive, e))?;
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| extraction_failed(archive, e))?;
        if !unpacked {
            let name = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(ProvisionError::ArchiveExtraction(format!(
                "{}: entry {} escapes the extraction directory",
                archive.display(),
                name
            )));
        }
    }

    Ok(())
}

fn extraction_failed(archive: &Path, err: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::ArchiveExtraction(format!("{}: {}", archive.display(), err))
}

/// Depth-first search for a regular file named exactly `file_name`
///
/// Symlinks are not followed. Entries are visited in name order so the
/// result is deterministic when several copies exist.
pub fn find_file(
    root: &Path,
    file_name: &str,
    limits: SearchLimits,
) -> io::Result<Option<PathBuf>> {
    let mut budget = limits.max_entries;
    search(root, OsStr::new(file_name), 0, limits.max_depth, &mut budget)
}

fn search(
    dir: &Path,
    file_name: &OsStr,
    depth: usize,
    max_depth: usize,
    budget: &mut usize,
) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if *budget == 0 {
            return Ok(None);
        }
        *budget -= 1;

        let file_type = entry.file_type()?;
        if file_type.is_file() && entry.file_name() == file_name {
            return Ok(Some(entry.path()));
        }
        if file_type.is_dir() && depth < max_depth {
            if let Some(found) = search(&entry.path(), file_name, depth + 1, max_depth, budget)? {
                return Ok(Some(found));
            }
        }
    }

    Ok(None)
}
