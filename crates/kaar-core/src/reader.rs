//! Kaarball reader
//!
//! Validates the header and top-level index against the real file size
//! before any section offset is used, then reads sections on demand.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, KaarError, Result};
use crate::format::{self, HEADER_LEN, ManifestIndex, TopIndex, sections};

/// Random access to the sections of one kaarball
#[derive(Debug)]
pub struct ArchiveReader {
    path: PathBuf,
    file: File,
    index: TopIndex,
    data_start: u64,
}

impl ArchiveReader {
    /// Open a kaarball and validate its framing
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).at(&path)?;
        let file_len = file.metadata().at(&path)?.len();

        if file_len < HEADER_LEN {
            return Err(KaarError::corrupt(format!(
                "{} bytes is too short for a kaarball header",
                file_len
            )));
        }
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header).at(&path)?;
        let index_len = format::decode_header(&header)?;

        let data_start = HEADER_LEN + u64::from(index_len);
        if data_start > file_len {
            return Err(KaarError::corrupt(format!(
                "top-level index ends at byte {} past end of file ({} bytes)",
                data_start, file_len
            )));
        }
        let mut raw_index = vec![0u8; index_len as usize];
        file.read_exact(&mut raw_index).at(&path)?;
        let index = format::decode_index(&raw_index)?;
        index.validate(file_len - data_start)?;

        tracing::debug!(path = %path.display(), sections = index.sections.len(), "kaarball opened");
        Ok(Self {
            path,
            file,
            index,
            data_start,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &TopIndex {
        &self.index
    }

    /// Read one section and verify its checksum
    pub fn section(&mut self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .index
            .section(name)
            .ok_or_else(|| KaarError::corrupt(format!("missing section '{}'", name)))?;

        let length = usize::try_from(entry.length)
            .map_err(|_| KaarError::corrupt(format!("section '{}' is too large", name)))?;
        let expected = entry.sha256.clone();
        self.file
            .seek(SeekFrom::Start(self.data_start + entry.offset))
            .at(&self.path)?;

        let mut data = vec![0u8; length];
        self.file.read_exact(&mut data).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                KaarError::corrupt(format!("section '{}' is truncated", name))
            } else {
                KaarError::io(&self.path, e)
            }
        })?;

        let actual = format::sha256_hex(&data);
        if actual != expected {
            return Err(KaarError::corrupt(format!(
                "section '{}' checksum mismatch (expected {}, got {})",
                name, expected, actual
            )));
        }
        Ok(data)
    }

    /// Read only the manifest index, without touching file or image data
    pub fn manifest_index(&mut self) -> Result<ManifestIndex> {
        let data = self.section(sections::MANIFESTS)?;
        format::decode_manifest_index(&data)
    }

    /// Check every section checksum
    pub fn verify(&mut self) -> Result<()> {
        for name in sections::ALL {
            self.section(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    use crate::cancel::CancelToken;
    use crate::writer::write_archive;
    use tempfile::TempDir;

    fn write_empty(dir: &Path) -> PathBuf {
        let dest = dir.join("empty.kaar");
        write_archive(
            &dest,
            &BTreeMap::new(),
            &BTreeSet::new(),
            &ManifestIndex::default(),
            &BTreeMap::new(),
            &CancelToken::never(),
        )
        .unwrap();
        dest
    }

    #[test]
    fn test_open_and_verify() {
        let temp = TempDir::new().unwrap();
        let path = write_empty(temp.path());

        let mut reader = ArchiveReader::open(&path).unwrap();
        reader.verify().unwrap();
        assert_eq!(reader.manifest_index().unwrap(), ManifestIndex::default());
    }

    #[test]
    fn test_short_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("short.kaar");
        std::fs::write(&path, b"KAAR").unwrap();

        let err = ArchiveReader::open(&path).unwrap_err();
        assert!(matches!(err, KaarError::CorruptArchive { .. }));
    }

    #[test]
    fn test_truncated_archive() {
        let temp = TempDir::new().unwrap();
        let path = write_empty(temp.path());
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

        let err = ArchiveReader::open(&path).unwrap_err();
        assert!(matches!(err, KaarError::CorruptArchive { .. }), "{}", err);
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let temp = TempDir::new().unwrap();
        let path = write_empty(temp.path());
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = ArchiveReader::open(&path).unwrap();
        let err = reader.verify().unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"), "{}", err);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let temp = TempDir::new().unwrap();
        let err = ArchiveReader::open(temp.path().join("nope.kaar")).unwrap_err();
        assert!(matches!(err, KaarError::Io { .. }));
    }
}
