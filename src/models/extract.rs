use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;
use tracing::debug;
use zip::{read::ZipArchive, result::ZipError};

use crate::error::ExtractError;

const SNIFF_LEN: u64 = 512;
const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarBz2,
    Tar,
}

impl ArchiveFormat {
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::Tar => "tar",
        }
    }

    /// Identifies an archive from its leading bytes.
    pub fn detect(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            Some(ArchiveFormat::Zip)
        } else if header.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::TarGz)
        } else if header.starts_with(b"BZh") {
            Some(ArchiveFormat::TarBz2)
        } else if header.len() >= 262 && &header[257..262] == b"ustar" {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

/// Unpacks `archive_path` into the existing directory `target_dir`.
///
/// The archive itself is left in place; removing it is up to the caller.
pub fn extract(archive_path: &Path, target_dir: &Path) -> Result<ArchiveFormat, ExtractError> {
    extract_with(archive_path, target_dir, 0)
}

/// Like [`extract`], dropping the first `strip_components` path components of
/// every entry. Entries left without a name are skipped.
pub fn extract_with(
    archive_path: &Path,
    target_dir: &Path,
    strip_components: u8,
) -> Result<ArchiveFormat, ExtractError> {
    if !target_dir.is_dir() {
        return Err(ExtractError::io(
            target_dir,
            io::Error::new(io::ErrorKind::NotFound, "target directory does not exist"),
        ));
    }

    let mut file = File::open(archive_path).map_err(|err| ExtractError::io(archive_path, err))?;
    let mut header = Vec::with_capacity(SNIFF_LEN as usize);
    (&mut file)
        .take(SNIFF_LEN)
        .read_to_end(&mut header)
        .map_err(|err| ExtractError::io(archive_path, err))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|err| ExtractError::io(archive_path, err))?;

    let format = ArchiveFormat::detect(&header)
        .ok_or_else(|| ExtractError::corrupt(archive_path, "unrecognized archive format"))?;
    debug!(archive = ?archive_path, format = format.extension(), "extracting archive");

    let plan = Unpack {
        archive: archive_path,
        destination: target_dir,
        strip_components,
    };
    match format {
        ArchiveFormat::Zip => extract_zip(&plan, file)?,
        ArchiveFormat::TarGz => extract_tar(&plan, GzDecoder::new(file))?,
        ArchiveFormat::TarBz2 => extract_tar(&plan, BzDecoder::new(file))?,
        ArchiveFormat::Tar => extract_tar(&plan, file)?,
    }
    Ok(format)
}

struct Unpack<'a> {
    archive: &'a Path,
    destination: &'a Path,
    strip_components: u8,
}

impl Unpack<'_> {
    /// Maps an entry name to its location under the destination, or `None`
    /// when nothing is left after stripping.
    fn target(&self, entry: &Path) -> Result<Option<PathBuf>, ExtractError> {
        let mut relative = PathBuf::new();
        for component in entry.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ExtractError::corrupt(
                        self.archive,
                        format!("entry {entry:?} escapes the target directory"),
                    ));
                }
            }
        }

        let stripped: PathBuf = relative
            .components()
            .skip(self.strip_components as usize)
            .collect();
        if stripped.as_os_str().is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.destination.join(stripped)))
        }
    }

    fn create_dir(&self, dir: &Path) -> Result<(), ExtractError> {
        fs::create_dir_all(dir).map_err(|err| ExtractError::io(dir, err))
    }

    /// Reads failures are blamed on the archive, write failures on the disk.
    fn write_file<R: Read>(&self, mut reader: R, dest: &Path) -> Result<(), ExtractError> {
        if let Some(parent) = dest.parent() {
            self.create_dir(parent)?;
        }
        let mut outfile = File::create(dest).map_err(|err| ExtractError::io(dest, err))?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = reader
                .read(&mut buffer)
                .map_err(|err| ExtractError::corrupt(self.archive, err.to_string()))?;
            if read == 0 {
                break;
            }
            outfile
                .write_all(&buffer[..read])
                .map_err(|err| ExtractError::io(dest, err))?;
        }
        outfile.flush().map_err(|err| ExtractError::io(dest, err))
    }
}

fn extract_tar<R: Read>(plan: &Unpack<'_>, reader: R) -> Result<(), ExtractError> {
    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| ExtractError::corrupt(plan.archive, err.to_string()))?;

    let mut seen = 0usize;
    for entry in entries {
        let entry = entry.map_err(|err| ExtractError::corrupt(plan.archive, err.to_string()))?;
        seen += 1;
        let path = entry
            .path()
            .map_err(|err| ExtractError::corrupt(plan.archive, err.to_string()))?
            .into_owned();
        let Some(dest) = plan.target(&path)? else {
            continue;
        };

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            plan.create_dir(&dest)?;
        } else if kind.is_file() {
            plan.write_file(entry, &dest)?;
        } else {
            debug!(entry = ?path, "skipping non-regular tar entry");
        }
    }

    if seen == 0 {
        return Err(ExtractError::corrupt(plan.archive, "archive has no entries"));
    }
    Ok(())
}

fn extract_zip(plan: &Unpack<'_>, file: File) -> Result<(), ExtractError> {
    let mut archive = ZipArchive::new(file).map_err(|err| zip_error(plan.archive, err))?;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|err| zip_error(plan.archive, err))?;
        let name = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            ExtractError::corrupt(
                plan.archive,
                format!("entry {:?} escapes the target directory", entry.name()),
            )
        })?;
        let Some(dest) = plan.target(&name)? else {
            continue;
        };

        if entry.is_dir() {
            plan.create_dir(&dest)?;
        } else {
            plan.write_file(entry, &dest)?;
        }
    }
    Ok(())
}

fn zip_error(archive: &Path, err: ZipError) -> ExtractError {
    match err {
        ZipError::Io(source) if source.kind() != io::ErrorKind::UnexpectedEof => {
            ExtractError::io(archive, source)
        }
        other => ExtractError::corrupt(archive, other.to_string()),
    }
}
