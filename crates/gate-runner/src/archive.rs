//! Archive creation and extraction.
//!
//! The format is chosen from the destination suffix only.

use crate::fsutil::ensure_dir;
use crate::GateError;
use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;
use walkdir::WalkDir;
use zip::write::FileOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if name.ends_with(".zip") || name.ends_with(".jar") {
            Ok(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Ok(ArchiveKind::Tar)
        } else {
            Err(GateError::config(format!(
                "unsupported archive kind: {}",
                path.display()
            )))
        }
    }
}

/// One method per format-specific operation.
pub trait ArchiveWriter {
    fn append_file(&mut self, name: &str, src: &Path, mode: u32) -> Result<()>;

    fn finish(self: Box<Self>) -> Result<()>;
}

struct ZipArchiveWriter {
    inner: zip::ZipWriter<BufWriter<File>>,
}

impl ArchiveWriter for ZipArchiveWriter {
    fn append_file(&mut self, name: &str, src: &Path, mode: u32) -> Result<()> {
        let options = FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(mode);
        self.inner.start_file(name, options)?;
        let mut file = File::open(src)?;
        io::copy(&mut file, &mut self.inner)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let mut out = self.inner.finish()?;
        out.flush()?;
        Ok(())
    }
}

/// Flushes a tar output stream, writing the gzip trailer when compressed.
trait FinishStream: Write {
    fn finish_stream(self) -> io::Result<()>;
}

impl FinishStream for BufWriter<File> {
    fn finish_stream(mut self) -> io::Result<()> {
        self.flush()
    }
}

impl FinishStream for GzEncoder<BufWriter<File>> {
    fn finish_stream(self) -> io::Result<()> {
        let mut out = self.finish()?;
        out.flush()
    }
}

struct TarArchiveWriter<W: FinishStream> {
    inner: tar::Builder<W>,
}

impl<W: FinishStream> ArchiveWriter for TarArchiveWriter<W> {
    fn append_file(&mut self, name: &str, src: &Path, mode: u32) -> Result<()> {
        let meta = fs::metadata(src)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(meta.len());
        header.set_mode(mode);
        header.set_mtime(
            meta.modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        );
        header.set_cksum();
        let file = File::open(src)?;
        self.inner.append_data(&mut header, name, file)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.inner.into_inner()?.finish_stream()?;
        Ok(())
    }
}

fn open_writer(kind: ArchiveKind, dest: &Path) -> Result<Box<dyn ArchiveWriter>> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    let file = File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let writer: Box<dyn ArchiveWriter> = match kind {
        ArchiveKind::Zip => Box::new(ZipArchiveWriter {
            inner: zip::ZipWriter::new(BufWriter::new(file)),
        }),
        ArchiveKind::Tar => Box::new(TarArchiveWriter {
            inner: tar::Builder::new(BufWriter::new(file)),
        }),
        ArchiveKind::TarGz => Box::new(TarArchiveWriter {
            inner: tar::Builder::new(GzEncoder::new(BufWriter::new(file), Compression::default())),
        }),
    };
    Ok(writer)
}

/// Group/other get read; they get execute too when the owner has it.
pub fn normalized_mode(mode: u32) -> u32 {
    let mut mode = mode | 0o044;
    if mode & 0o100 != 0 {
        mode |= 0o011;
    }
    mode & 0o7777
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32> {
    Ok(0o644)
}

/// Applies [`normalized_mode`] to every regular file under `root`.
pub fn normalize_permissions(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let current = file_mode(entry.path())?;
            let wanted = normalized_mode(current);
            if wanted != current & 0o7777 {
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(wanted))?;
            }
        }
    }
    Ok(())
}

/// Archives every file under `src` into `dest`, each entry named
/// `<prefix><relative path>`. Returns the entry names in write order.
pub fn create_archive(src: &Path, dest: &Path, prefix: &str) -> Result<Vec<String>> {
    let kind = ArchiveKind::from_path(dest)?;
    normalize_permissions(src)?;
    let mut writer = open_writer(kind, dest)?;
    let mut names = Vec::new();
    for entry in WalkDir::new(src).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| anyhow!("{} is outside {}", entry.path().display(), src.display()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let name = format!("{}{}", prefix, rel);
        let mode = normalized_mode(file_mode(entry.path())?);
        writer.append_file(&name, entry.path(), mode)?;
        names.push(name);
    }
    writer.finish()?;
    info!(archive = %dest.display(), entries = names.len(), "created archive");
    Ok(names)
}

/// Unpacks `archive` into `dest`. `.jar` files are read as zip.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    let file = File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    match ArchiveKind::from_path(archive)? {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file)?;
            zip.extract(dest)?;
        }
        ArchiveKind::Tar => tar::Archive::new(file).unpack(dest)?,
        ArchiveKind::TarGz => tar::Archive::new(GzDecoder::new(file)).unpack(dest)?,
    }
    Ok(())
}

/// Entry names stored in an archive, in archive order.
pub fn list_entries(archive: &Path) -> Result<Vec<String>> {
    let file = File::open(archive)?;
    let mut names = Vec::new();
    match ArchiveKind::from_path(archive)? {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file)?;
            for i in 0..zip.len() {
                names.push(zip.by_index(i)?.name().to_string());
            }
        }
        ArchiveKind::Tar => {
            for entry in tar::Archive::new(file).entries()? {
                names.push(entry?.path()?.to_string_lossy().into_owned());
            }
        }
        ArchiveKind::TarGz => {
            for entry in tar::Archive::new(GzDecoder::new(file)).entries()? {
                names.push(entry?.path()?.to_string_lossy().into_owned());
            }
        }
    }
    Ok(names)
}

/// Like [`list_entries`] without directory entries.
pub fn list_files(archive: &Path) -> Result<Vec<String>> {
    let file = File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    let mut names = Vec::new();
    match ArchiveKind::from_path(archive)? {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file)?;
            for i in 0..zip.len() {
                let entry = zip.by_index(i)?;
                if !entry.is_dir() {
                    names.push(entry.name().to_string());
                }
            }
        }
        ArchiveKind::Tar => collect_tar_files(tar::Archive::new(file), &mut names)?,
        ArchiveKind::TarGz => collect_tar_files(tar::Archive::new(GzDecoder::new(file)), &mut names)?,
    }
    Ok(names)
}

fn collect_tar_files<R: Read>(mut archive: tar::Archive<R>, names: &mut Vec<String>) -> Result<()> {
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(())
}
