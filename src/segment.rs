//! WAL segment naming and the database system identifier

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};
use crate::location::{Location, LocationRouter};

/// Control file holding the system identifier, relative to the data directory
pub const CONTROL_FILE: &str = "global/pg_control";

/// True for plain segment names: timeline, log and segment as 24 uppercase
/// hex digits.
///
/// History files, backup labels and `.partial` segments do not match and
/// are archived uncompressed.
pub fn is_xlog_file_name(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F'))
}

/// Read the system identifier of the database in `pgdata`.
///
/// It is the first field of the control file, stored in the host's byte order.
pub fn read_system_identifier(router: &LocationRouter<'_>, pgdata: &Path) -> Result<u64> {
    let path: PathBuf = pgdata.join(CONTROL_FILE);
    let mut reader = router
        .at(Location::DbHost)
        .open_read(&path)
        .map_err(|e| ArchiveError::io("open control file", &path, e))?;
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|e| ArchiveError::io("read control file", &path, e))?;
    Ok(u64::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_xlog_names() {
        assert!(is_xlog_file_name("000000010000000000000001"));
        assert!(is_xlog_file_name("00000002000000A3000000FF"));
        assert!(!is_xlog_file_name("00000002.history"));
        assert!(!is_xlog_file_name("000000010000000000000001.partial"));
        assert!(!is_xlog_file_name(
            "000000010000000000000002.00000028.backup"
        ));
        assert!(!is_xlog_file_name("00000001000000000000000G"));
        assert!(!is_xlog_file_name("00000002000000a3000000ff"));
    }

    #[test]
    fn test_read_system_identifier() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("global")).unwrap();
        let mut control = 7_123_456_789_012_345_678u64.to_ne_bytes().to_vec();
        control.extend_from_slice(&[0u8; 100]);
        std::fs::write(tmp.path().join(CONTROL_FILE), control).unwrap();

        let router = LocationRouter::local();
        let id = read_system_identifier(&router, tmp.path()).unwrap();
        assert_eq!(id, 7_123_456_789_012_345_678);
    }

    #[test]
    fn test_short_control_file_is_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("global")).unwrap();
        std::fs::write(tmp.path().join(CONTROL_FILE), [1u8, 2, 3]).unwrap();
        let router = LocationRouter::local();
        assert!(read_system_identifier(&router, tmp.path()).is_err());
    }
}
