//! Checksum utilities and the integrity check behind idempotent push

use std::io::{self, Read};
use std::path::Path;

use tracing::warn;

use crate::codec::StreamCodec;
use crate::error::{ArchiveError, Result};
use crate::location::{Location, LocationRouter};

// Buffer size for checksum reads
const CRC_BUF: usize = 64 * 1024;

/// Streaming CRC-32 of everything `reader` yields
pub fn crc32_reader<R: Read + ?Sized>(reader: &mut R) -> io::Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; CRC_BUF];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// One side of a comparison: where the file is and how it is encoded
#[derive(Debug, Clone, Copy)]
pub struct FileRef<'p> {
    pub location: Location,
    pub path: &'p Path,
    pub codec: StreamCodec,
}

impl<'p> FileRef<'p> {
    pub fn plain(location: Location, path: &'p Path) -> Self {
        Self {
            location,
            path,
            codec: StreamCodec::Identity,
        }
    }
}

/// CRC-32 of the decoded content of `file`.
///
/// Open failures are I/O errors. Read failures on a compressed file are
/// reported as codec errors.
pub fn file_crc32(router: &LocationRouter<'_>, file: FileRef<'_>) -> Result<u32> {
    let raw = router
        .at(file.location)
        .open_read(file.path)
        .map_err(|e| ArchiveError::io("open file for checksum", file.path, e))?;
    let mut reader = file.codec.reader(raw);
    crc32_reader(&mut reader).map_err(|e| {
        if file.codec.is_compressed() {
            ArchiveError::codec("read", file.path, e)
        } else {
            ArchiveError::io("read file for checksum", file.path, e)
        }
    })
}

/// Whether `a` and `b` hold the same decoded bytes.
///
/// A compressed side that cannot be decoded counts as different content
/// rather than an error, so a damaged archive copy can still be replaced
/// when overwrite is allowed.
pub fn files_equal(router: &LocationRouter<'_>, a: FileRef<'_>, b: FileRef<'_>) -> Result<bool> {
    let crc_b = match file_crc32(router, b) {
        Ok(crc) => crc,
        Err(ArchiveError::Codec { path, source, .. }) => {
            warn!(
                "Cannot compare WAL file \"{}\" with compressed \"{}\": {}",
                a.path.display(),
                path.display(),
                source
            );
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    let crc_a = file_crc32(router, a)?;
    Ok(crc_a == crc_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_crc32_known_value() {
        let mut data: &[u8] = b"123456789";
        assert_eq!(crc32_reader(&mut data).unwrap(), 0xCBF4_3926);
    }

    #[test]
    fn test_equal_plain_files() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::write(&a, b"segment").unwrap();
        std::fs::write(&b, b"segment").unwrap();
        let router = LocationRouter::local();
        assert!(files_equal(
            &router,
            FileRef::plain(Location::DbHost, &a),
            FileRef::plain(Location::BackupHost, &b)
        )
        .unwrap());

        std::fs::write(&b, b"segmenT").unwrap();
        assert!(!files_equal(
            &router,
            FileRef::plain(Location::DbHost, &a),
            FileRef::plain(Location::BackupHost, &b)
        )
        .unwrap());
    }

    #[test]
    fn test_compressed_side_is_decoded() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b.gz");
        let data = vec![0x5au8; 100_000];
        std::fs::write(&a, &data).unwrap();
        let mut enc = flate2::write::GzEncoder::new(
            std::fs::File::create(&b).unwrap(),
            flate2::Compression::default(),
        );
        enc.write_all(&data).unwrap();
        enc.finish().unwrap();

        let router = LocationRouter::local();
        let gz = FileRef {
            location: Location::BackupHost,
            path: &b,
            codec: StreamCodec::Gzip { level: 1 },
        };
        assert!(files_equal(&router, FileRef::plain(Location::DbHost, &a), gz).unwrap());
    }

    #[test]
    fn test_undecodable_compressed_side_is_mismatch() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b.gz");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"garbage").unwrap();
        let router = LocationRouter::local();
        let gz = FileRef {
            location: Location::BackupHost,
            path: &b,
            codec: StreamCodec::Gzip { level: 1 },
        };
        assert!(!files_equal(&router, FileRef::plain(Location::DbHost, &a), gz).unwrap());
    }

    #[test]
    fn test_missing_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let router = LocationRouter::local();
        let err = file_crc32(&router, FileRef::plain(Location::DbHost, &a)).unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
    }
}
