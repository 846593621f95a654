//! Error types shared by the archive pipelines, the transport and the agent.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Missing or invalid configuration.
    #[error("{0}")]
    Config(String),

    #[error(
        "Refuse to push WAL segment {segment} into archive. Instance parameters mismatch. \
         Instance '{instance}' should have SYSTEM_ID = {expected} instead of {actual}"
    )]
    SystemIdMismatch {
        segment: String,
        instance: String,
        expected: u64,
        actual: u64,
    },

    #[error("Too many options (limit is {limit})")]
    TooManyOptions { limit: usize },

    #[error("Unterminated {quote} quote in options string")]
    UnterminatedQuote { quote: char },

    /// Filesystem failure on either host.
    #[error("Cannot {op} \"{}\": {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot rename WAL file \"{}\" to \"{}\": {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Destination exists with different content and overwrite was not requested.
    #[error("WAL segment \"{}\" already exists", path.display())]
    Conflict { path: PathBuf },

    /// A temporary file is still growing, so another archiver owns it.
    #[error("Destination temporary WAL file \"{}\" is not stale", path.display())]
    NotStale { path: PathBuf },

    #[error("Source WAL file \"{}\" doesn't exist", path.display())]
    SourceMissing { path: PathBuf },

    /// Compression or decompression stream failure.
    #[error("Cannot {op} compressed WAL file \"{}\": {source}", path.display())]
    Codec {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot start transport \"{program}\": {source}")]
    Transport {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("agent protocol error: {0}")]
    Protocol(String),
}

impl ArchiveError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchiveError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn codec(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchiveError::Codec {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ArchiveError::Config(msg.into())
    }

    /// Whether this is one of the configuration-class errors.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ArchiveError::Config(_)
                | ArchiveError::SystemIdMismatch { .. }
                | ArchiveError::TooManyOptions { .. }
                | ArchiveError::UnterminatedQuote { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_path_and_cause() {
        let err = ArchiveError::io(
            "open source WAL file",
            "/pgdata/pg_wal/000000010000000000000001",
            io::Error::from_raw_os_error(libc::ENOENT),
        );
        let msg = err.to_string();
        assert!(msg.contains("/pgdata/pg_wal/000000010000000000000001"));
        assert!(msg.starts_with("Cannot open source WAL file"));
    }

    #[test]
    fn conflict_and_not_stale_are_distinct() {
        let conflict = ArchiveError::Conflict {
            path: "/a/seg".into(),
        }
        .to_string();
        let not_stale = ArchiveError::NotStale {
            path: "/a/seg.part".into(),
        }
        .to_string();
        assert!(conflict.contains("already exists"));
        assert!(not_stale.contains("is not stale"));
        assert!(!conflict.contains("Cannot"));
    }

    #[test]
    fn config_class() {
        assert!(ArchiveError::TooManyOptions { limit: 3 }.is_config());
        assert!(ArchiveError::UnterminatedQuote { quote: '\'' }.is_config());
        assert!(!ArchiveError::NotStale { path: "x".into() }.is_config());
    }
}
