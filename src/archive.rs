//! archive-push and archive-get: single WAL segment transfer
//!
//! Both directions follow the same discipline: data only ever lands under
//! `<final>.part`, the temporary file is removed on every failure path, and
//! the final name appears through one atomic rename once the content,
//! close and permission copy have all succeeded.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::checksum::{files_equal, FileRef};
use crate::codec::{EncodedWriter, StreamCodec, GZ_SUFFIX};
use crate::config::{InstanceConfig, DEFAULT_COMPRESS_LEVEL};
use crate::error::{ArchiveError, Result};
use crate::location::{FileSystem, FileWriter, Location, LocationRouter};
use crate::logger::Logger;
use crate::partial::{part_path, PartialFile, StalePolicy};
use crate::segment::read_system_identifier;

/// Copy block size, one WAL page
pub const XLOG_BLCKSZ: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Segment written to `path`
    Archived { path: PathBuf, bytes: u64 },
    /// An identical copy was already at `path`; nothing written
    AlreadyArchived { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOutcome {
    /// Archive file actually read (plain or `.gz`)
    pub source: PathBuf,
    pub decompressed: bool,
    pub bytes: u64,
}

/// Appends `suffix` to the final path component
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Removes a temporary file we created unless the transfer completed
struct TempGuard<'f> {
    fs: &'f dyn FileSystem,
    path: PathBuf,
    armed: bool,
}

impl<'f> TempGuard<'f> {
    fn new(fs: &'f dyn FileSystem, path: PathBuf) -> Self {
        Self {
            fs,
            path,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.fs.unlink(&self.path) {
                warn!(
                    "Cannot remove temporary WAL file \"{}\": {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Runs segment transfers against a router
pub struct Archiver<'r, 'a> {
    router: &'r LocationRouter<'a>,
    logger: &'r dyn Logger,
    stale: StalePolicy,
}

impl<'r, 'a> Archiver<'r, 'a> {
    pub fn new(router: &'r LocationRouter<'a>, logger: &'r dyn Logger, stale: StalePolicy) -> Self {
        Self {
            router,
            logger,
            stale,
        }
    }

    /// Copy `from` on the database host into the archive as `to`
    /// (plus the codec suffix).
    pub fn push_wal_file(
        &self,
        from: &Path,
        to: &Path,
        codec: StreamCodec,
        overwrite: bool,
    ) -> Result<PushOutcome> {
        let to_final = with_suffix(to, codec.suffix());
        self.logger.start("push", from, &to_final);
        let started = Instant::now();
        let result = self.push_inner(from, &to_final, codec, overwrite);
        match &result {
            Ok(PushOutcome::Archived { path, bytes }) => {
                self.logger
                    .done("push", path, *bytes, started.elapsed().as_secs_f64());
            }
            Ok(PushOutcome::AlreadyArchived { path }) => self.logger.skip(from, path),
            Err(e) => self.logger.error("push", from, &e.to_string()),
        }
        result
    }

    fn push_inner(
        &self,
        from: &Path,
        to_final: &Path,
        codec: StreamCodec,
        overwrite: bool,
    ) -> Result<PushOutcome> {
        let db = self.router.at(Location::DbHost);
        let backup = self.router.at(Location::BackupHost);

        let input = db
            .open_read(from)
            .map_err(|e| ArchiveError::io("open source WAL file", from, e))?;

        let exists = backup
            .exists(to_final)
            .map_err(|e| ArchiveError::io("stat destination WAL file", to_final, e))?;
        if exists {
            let same = files_equal(
                self.router,
                FileRef::plain(Location::DbHost, from),
                FileRef {
                    location: Location::BackupHost,
                    path: to_final,
                    codec,
                },
            )?;
            if same {
                info!(
                    "WAL segment \"{}\" already archived with identical content",
                    to_final.display()
                );
                return Ok(PushOutcome::AlreadyArchived {
                    path: to_final.to_path_buf(),
                });
            }
            if !overwrite {
                return Err(ArchiveError::Conflict {
                    path: to_final.to_path_buf(),
                });
            }
            warn!(
                "WAL segment \"{}\" differs from the source, overwriting",
                to_final.display()
            );
        }

        let tmp = part_path(to_final);
        let out = self.create_temp(backup, &tmp)?;
        let guard = TempGuard::new(backup, tmp.clone());

        let bytes = copy_stream(
            input,
            Endpoint::new(from, StreamCodec::Identity),
            codec.writer(out),
            Endpoint::new(&tmp, codec),
        )?;

        copy_file_attributes(self.router, Location::DbHost, from, Location::BackupHost, &tmp)?;

        backup
            .rename(&tmp, to_final)
            .map_err(|e| ArchiveError::Rename {
                from: tmp.clone(),
                to: to_final.to_path_buf(),
                source: e,
            })?;
        guard.disarm();

        if codec.is_compressed() {
            info!("WAL file compressed to \"{}\"", to_final.display());
        }
        Ok(PushOutcome::Archived {
            path: to_final.to_path_buf(),
            bytes,
        })
    }

    /// Copy `from` (or `from.gz`) out of the archive onto `to` on the
    /// database host.
    pub fn get_wal_file(&self, from: &Path, to: &Path) -> Result<GetOutcome> {
        self.logger.start("get", from, to);
        let started = Instant::now();
        let result = self.get_inner(from, to);
        match &result {
            Ok(out) => self
                .logger
                .done("get", to, out.bytes, started.elapsed().as_secs_f64()),
            Err(e) => self.logger.error("get", from, &e.to_string()),
        }
        result
    }

    fn get_inner(&self, from: &Path, to: &Path) -> Result<GetOutcome> {
        let db = self.router.at(Location::DbHost);
        let backup = self.router.at(Location::BackupHost);

        let (source, codec) = self.locate_archived(backup, from)?;

        let raw = backup.open_read(&source).map_err(|e| {
            let op = if codec.is_compressed() {
                "open compressed WAL file"
            } else {
                "open source WAL file"
            };
            ArchiveError::io(op, &source, e)
        })?;

        let tmp = part_path(to);
        let out = self.create_temp(db, &tmp)?;
        let guard = TempGuard::new(db, tmp.clone());

        let bytes = copy_stream(
            codec.reader(raw),
            Endpoint::new(&source, codec),
            StreamCodec::Identity.writer(out),
            Endpoint::new(&tmp, StreamCodec::Identity),
        )?;

        copy_file_attributes(self.router, Location::BackupHost, &source, Location::DbHost, &tmp)?;

        db.rename(&tmp, to).map_err(|e| ArchiveError::Rename {
            from: tmp.clone(),
            to: to.to_path_buf(),
            source: e,
        })?;
        guard.disarm();

        if codec.is_compressed() {
            info!("WAL file decompressed from \"{}\"", source.display());
        }
        Ok(GetOutcome {
            source,
            decompressed: codec.is_compressed(),
            bytes,
        })
    }

    /// Plain name first, then the `.gz` variant.
    fn locate_archived(&self, backup: &dyn FileSystem, from: &Path) -> Result<(PathBuf, StreamCodec)> {
        let exists = |p: &Path| {
            backup
                .exists(p)
                .map_err(|e| ArchiveError::io("stat source WAL file", p, e))
        };
        if exists(from)? {
            return Ok((from.to_path_buf(), StreamCodec::Identity));
        }
        let gz = with_suffix(from, GZ_SUFFIX);
        if exists(&gz)? {
            return Ok((
                gz,
                StreamCodec::Gzip {
                    level: DEFAULT_COMPRESS_LEVEL,
                },
            ));
        }
        Err(ArchiveError::SourceMissing {
            path: from.to_path_buf(),
        })
    }

    /// Exclusively create `tmp`, reclaiming it first if a stale copy is
    /// in the way.
    fn create_temp<'f>(&self, fs: &'f dyn FileSystem, tmp: &Path) -> Result<Box<dyn FileWriter + 'f>> {
        match fs.create_exclusive(tmp) {
            Ok(w) => Ok(w),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(
                    "Cannot open destination temporary WAL file \"{}\": {}",
                    tmp.display(),
                    e
                );
                let mut partial = PartialFile::new(tmp.to_path_buf());
                self.stale.reclaim(fs, &mut partial)?;
                self.logger.stale(tmp);
                fs.create_exclusive(tmp)
                    .map_err(|e| ArchiveError::io("open destination temporary WAL file", tmp, e))
            }
            Err(e) => Err(ArchiveError::io(
                "open destination temporary WAL file",
                tmp,
                e,
            )),
        }
    }
}

/// Path plus codec, used to word copy errors
struct Endpoint<'p> {
    path: &'p Path,
    codec: StreamCodec,
}

impl<'p> Endpoint<'p> {
    fn new(path: &'p Path, codec: StreamCodec) -> Self {
        Self { path, codec }
    }

    fn read_error(&self, e: io::Error) -> ArchiveError {
        if self.codec.is_compressed() {
            ArchiveError::codec("read", self.path, e)
        } else {
            ArchiveError::io("read source WAL file", self.path, e)
        }
    }

    fn write_error(&self, e: io::Error) -> ArchiveError {
        if self.codec.is_compressed() {
            ArchiveError::codec("write to", self.path, e)
        } else {
            ArchiveError::io("write to WAL file", self.path, e)
        }
    }

    fn close_error(&self, e: io::Error) -> ArchiveError {
        if self.codec.is_compressed() {
            ArchiveError::codec("close", self.path, e)
        } else {
            ArchiveError::io("close WAL file", self.path, e)
        }
    }
}

/// Block copy from `input` into `output`, then finish `output`.
///
/// Consumes both streams so they are closed before the caller's temp-file
/// guard can run.
fn copy_stream(
    mut input: Box<dyn Read + '_>,
    src: Endpoint<'_>,
    mut output: EncodedWriter<'_>,
    dst: Endpoint<'_>,
) -> Result<u64> {
    let mut buf = vec![0u8; XLOG_BLCKSZ];
    let mut total = 0u64;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(src.read_error(e)),
        };
        output.write_all(&buf[..n]).map_err(|e| dst.write_error(e))?;
        total += n as u64;
    }
    drop(input);
    output.finish().map_err(|e| dst.close_error(e))?;
    Ok(total)
}

/// Copy permission bits of `from` onto `to`.
pub fn copy_file_attributes(
    router: &LocationRouter<'_>,
    from_location: Location,
    from: &Path,
    to_location: Location,
    to: &Path,
) -> Result<()> {
    let st = router
        .at(from_location)
        .stat(from)
        .map_err(|e| ArchiveError::io("stat file", from, e))?;
    router
        .at(to_location)
        .set_mode(to, st.mode)
        .map_err(|e| ArchiveError::io("change mode of file", to, e))
}

fn required(wal_file_path: Option<&str>, wal_file_name: Option<&str>) -> Result<(String, String)> {
    match (wal_file_path, wal_file_name) {
        (None, None) => Err(ArchiveError::config(
            "required parameters are not specified: --wal-file-name %f --wal-file-path %p",
        )),
        (_, None) => Err(ArchiveError::config(
            "required parameter not specified: --wal-file-name %f",
        )),
        (None, _) => Err(ArchiveError::config(
            "required parameter not specified: --wal-file-path %p",
        )),
        (Some(p), Some(n)) if p.is_empty() || n.is_empty() => Err(ArchiveError::config(
            "required parameters must not be empty: --wal-file-name %f --wal-file-path %p",
        )),
        (Some(p), Some(n)) => Ok((p.to_string(), n.to_string())),
    }
}

/// A push or get as issued by the database's archive/restore hook
#[derive(Debug, Clone)]
pub struct SegmentRequest<'p> {
    /// Data directory the `%p` path is relative to
    pub pgdata: &'p Path,
    /// `%p`
    pub wal_file_path: Option<&'p str>,
    /// `%f`
    pub wal_file_name: Option<&'p str>,
}

/// archive-push entry point: validate the request and the instance, then
/// push one segment.
pub fn do_archive_push(
    instance: &InstanceConfig,
    router: &LocationRouter<'_>,
    logger: &dyn Logger,
    req: &SegmentRequest<'_>,
    overwrite: bool,
) -> Result<PushOutcome> {
    let (wal_file_path, wal_file_name) = required(req.wal_file_path, req.wal_file_name)?;
    let archive_dir = instance.archive_dir()?;
    let expected = instance.system_identifier()?;

    let actual = read_system_identifier(router, req.pgdata)?;
    if actual != expected {
        return Err(ArchiveError::SystemIdMismatch {
            segment: wal_file_name,
            instance: instance.name.clone(),
            expected,
            actual,
        });
    }
    let codec = instance.push_codec(&wal_file_name)?;

    router
        .at(Location::BackupHost)
        .create_dir_all(archive_dir)
        .map_err(|e| ArchiveError::io("create archive directory", archive_dir, e))?;

    let from = req.pgdata.join(&wal_file_path);
    let to = archive_dir.join(&wal_file_name);
    info!("archive-push from {} to {}", from.display(), to.display());

    let archiver = Archiver::new(router, logger, instance.stale_policy());
    let outcome = archiver.push_wal_file(&from, &to, codec, overwrite)?;
    info!("archive-push completed successfully");
    Ok(outcome)
}

/// archive-get entry point.
pub fn do_archive_get(
    instance: &InstanceConfig,
    router: &LocationRouter<'_>,
    logger: &dyn Logger,
    req: &SegmentRequest<'_>,
) -> Result<GetOutcome> {
    let (wal_file_path, wal_file_name) = required(req.wal_file_path, req.wal_file_name)?;
    let archive_dir = instance.archive_dir()?;

    let from = archive_dir.join(&wal_file_name);
    let to = req.pgdata.join(&wal_file_path);
    info!("archive-get from {} to {}", from.display(), to.display());

    let archiver = Archiver::new(router, logger, instance.stale_policy());
    let outcome = archiver.get_wal_file(&from, &to)?;
    info!("archive-get completed successfully");
    Ok(outcome)
}
