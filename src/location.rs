//! Location-transparent file primitives
//!
//! The pipelines never touch `std::fs` directly. They ask the router for the
//! filesystem of a [`Location`] and that filesystem is either the local disk
//! or a [`crate::remote::RemoteFs`] talking to an agent.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Which host a path lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// The host running the database (holds the data directory)
    DbHost,
    /// The host holding the WAL archive
    BackupHost,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::DbHost => f.write_str("db-host"),
            Location::BackupHost => f.write_str("backup-host"),
        }
    }
}

/// Subset of stat(2) the pipelines need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Permission bits (`st_mode & 0o7777`)
    pub mode: u32,
}

/// A file opened for writing whose close can fail.
///
/// `finish` flushes, syncs and closes; dropping without `finish` closes
/// silently and is only meant for error paths.
pub trait FileWriter: Write {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// File primitives for one location
pub trait FileSystem {
    fn open_read<'a>(&'a self, path: &Path) -> io::Result<Box<dyn Read + 'a>>;

    /// Create a new file, failing with `AlreadyExists` if anything is there.
    fn create_exclusive<'a>(&'a self, path: &Path) -> io::Result<Box<dyn FileWriter + 'a>>;

    fn exists(&self, path: &Path) -> io::Result<bool>;

    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Atomically move `from` onto `to`, replacing `to` if present.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn unlink(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

// Block size used for buffered local I/O (WAL block size)
const IO_BLOCK: usize = 8192;

/// Direct filesystem access on this host
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

pub struct LocalWriter {
    inner: BufWriter<File>,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl FileWriter for LocalWriter {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

impl FileSystem for LocalFs {
    fn open_read<'a>(&'a self, path: &Path) -> io::Result<Box<dyn Read + 'a>> {
        let file = File::open(path)?;
        Ok(Box::new(BufReader::with_capacity(IO_BLOCK, file)))
    }

    fn create_exclusive<'a>(&'a self, path: &Path) -> io::Result<Box<dyn FileWriter + 'a>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        Ok(Box::new(LocalWriter {
            inner: BufWriter::with_capacity(IO_BLOCK, file),
        }))
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        match fs::symlink_metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let md = fs::metadata(path)?;
        Ok(FileStat {
            size: md.len(),
            mode: md.permissions().mode() & 0o7777,
        })
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        if !path.is_dir() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }
}

/// Routes each location to the filesystem serving it
pub struct LocationRouter<'a> {
    db: Box<dyn FileSystem + 'a>,
    backup: Box<dyn FileSystem + 'a>,
}

impl<'a> LocationRouter<'a> {
    /// Both locations on this host
    pub fn local() -> Self {
        Self {
            db: Box::new(LocalFs),
            backup: Box::new(LocalFs),
        }
    }

    pub fn new(db: Box<dyn FileSystem + 'a>, backup: Box<dyn FileSystem + 'a>) -> Self {
        Self { db, backup }
    }

    /// Route `location` to `fs`, keeping the other location local
    pub fn with_remote(location: Location, fs: Box<dyn FileSystem + 'a>) -> Self {
        match location {
            Location::DbHost => Self::new(fs, Box::new(LocalFs)),
            Location::BackupHost => Self::new(Box::new(LocalFs), fs),
        }
    }

    pub fn at(&self, location: Location) -> &dyn FileSystem {
        match location {
            Location::DbHost => self.db.as_ref(),
            Location::BackupHost => self.backup.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_exclusive_refuses_existing() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("seg.part");
        let fs = LocalFs;

        let mut w = fs.create_exclusive(&p).unwrap();
        w.write_all(b"abc").unwrap();
        w.finish().unwrap();

        let err = fs.create_exclusive(&p).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&p).unwrap(), b"abc");
    }

    #[test]
    fn test_stat_and_mode() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("f");
        std::fs::write(&p, b"12345").unwrap();
        let fs = LocalFs;

        fs.set_mode(&p, 0o640).unwrap();
        let st = fs.stat(&p).unwrap();
        assert_eq!(st.size, 5);
        assert_eq!(st.mode, 0o640);
    }

    #[test]
    fn test_exists_and_unlink() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("f");
        let fs = LocalFs;
        assert!(!fs.exists(&p).unwrap());
        std::fs::write(&p, b"x").unwrap();
        assert!(fs.exists(&p).unwrap());
        fs.unlink(&p).unwrap();
        assert!(!fs.exists(&p).unwrap());
    }

    #[test]
    fn test_rename_replaces_target() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::write(&a, b"new").unwrap();
        std::fs::write(&b, b"old").unwrap();
        LocalFs.rename(&a, &b).unwrap();
        assert!(!a.exists());
        assert_eq!(std::fs::read(&b).unwrap(), b"new");
    }

    #[test]
    fn test_router_routes_by_location() {
        let router = LocationRouter::local();
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("x");
        std::fs::write(&p, b"1").unwrap();
        assert!(router.at(Location::DbHost).exists(&p).unwrap());
        assert!(router.at(Location::BackupHost).exists(&p).unwrap());
    }
}
