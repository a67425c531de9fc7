//! Zip packaging for artifact delivery

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{Error, Result};

/// Compress a single file into a zip archive at `target`
///
/// # Errors
///
/// Returns an error if the source cannot be read or the archive cannot be
/// written.
pub async fn compress_file(source: &Path, target: &Path) -> Result<()> {
    let source = source.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || compress_file_blocking(&source, &target))
        .await
        .map_err(|e| Error::Transfer(format!("archive task failed: {e}")))?
}

/// Compress a directory tree into a zip archive at `target`
///
/// # Errors
///
/// Returns an error if the tree cannot be walked or the archive cannot be
/// written.
pub async fn compress_dir(source: &Path, target: &Path) -> Result<()> {
    let source = source.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || compress_dir_blocking(&source, &target))
        .await
        .map_err(|e| Error::Transfer(format!("archive task failed: {e}")))?
}

/// Extract a zip archive into `dest_dir`
///
/// Entries that would escape the destination are skipped.
///
/// # Errors
///
/// Returns an error if the archive is unreadable or an entry cannot be
/// written.
pub async fn extract(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive_path, &dest_dir))
        .await
        .map_err(|e| Error::Transfer(format!("archive task failed: {e}")))?
}

fn compress_file_blocking(source: &Path, target: &Path) -> Result<()> {
    let entry_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Transfer(format!("source has no file name: {}", source.display())))?;

    let mut input = File::open(source)?;
    let mut writer = ZipWriter::new(File::create(target)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(entry_name, options)?;
    io::copy(&mut input, &mut writer)?;
    writer.finish()?;
    Ok(())
}

fn compress_dir_blocking(source: &Path, target: &Path) -> Result<()> {
    let mut writer = ZipWriter::new(File::create(target)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut stack = vec![source.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = path
                .strip_prefix(source)
                .map_err(|e| Error::Transfer(format!("entry outside archive root: {e}")))?
                .to_string_lossy()
                .replace('\\', "/");
            writer.start_file(name, options)?;
            let mut input = File::open(&path)?;
            io::copy(&mut input, &mut writer)?;
        }
    }
    writer.finish()?;
    Ok(())
}

fn extract_blocking(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out_path: PathBuf = dest_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&out_path)?;
        io::copy(&mut entry, &mut output)?;
    }
    Ok(())
}
