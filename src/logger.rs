use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{ArchiveError, Result};

/// Operator event log for archive commands
pub trait Logger: Send + Sync {
    fn start(&self, _op: &str, _src: &Path, _dst: &Path) {}
    fn skip(&self, _src: &Path, _dst: &Path) {}
    fn stale(&self, _path: &Path) {}
    fn done(&self, _op: &str, _dst: &Path, _bytes: u64, _seconds: f64) {}
    fn error(&self, _op: &str, _path: &Path, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ArchiveError::io("open log file", path, e))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] pid={} {}", Utc::now().to_rfc3339(), std::process::id(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, op: &str, src: &Path, dst: &Path) {
        self.line(&format!(
            "{} src={} dst={}",
            op.to_uppercase(),
            src.display(),
            dst.display()
        ));
    }
    fn skip(&self, src: &Path, dst: &Path) {
        self.line(&format!(
            "SKIP src={} dst={} reason=identical",
            src.display(),
            dst.display()
        ));
    }
    fn stale(&self, path: &Path) {
        self.line(&format!("STALE path={}", path.display()));
    }
    fn done(&self, op: &str, dst: &Path, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE op={} dst={} bytes={bytes} seconds={seconds:.3}",
            op,
            dst.display()
        ));
    }
    fn error(&self, op: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR op={} path={} msg={}", op, path.display(), msg));
    }
}
