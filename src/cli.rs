//! Command-line surface and flag overrides for the instance configuration

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{CompressAlgorithm, InstanceConfig};
use crate::error::Result;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Walarc - crash-safe WAL segment archive-push / archive-get"
)]
pub struct Cli {
    /// Instance configuration file (TOML)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level diagnostics on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub instance: InstanceOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Copy a WAL segment from the data directory into the archive
    ArchivePush(PushArgs),
    /// Restore a WAL segment from the archive into the data directory
    ArchiveGet(SegmentArgs),
    /// Serve file operations on stdin/stdout (started by the transport)
    Agent {
        /// Version the launching side expects
        version: String,
    },
}

/// `%p` / `%f` as passed by archive_command and restore_command
#[derive(Args, Debug, Clone)]
pub struct SegmentArgs {
    /// Segment path relative to the data directory (%p)
    #[arg(long = "wal-file-path")]
    pub wal_file_path: Option<String>,

    /// Segment file name (%f)
    #[arg(long = "wal-file-name")]
    pub wal_file_name: Option<String>,

    /// Data directory, defaults to the current directory
    #[arg(short = 'D', long)]
    pub pgdata: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct PushArgs {
    #[command(flatten)]
    pub segment: SegmentArgs,

    /// Replace an archived segment whose content differs
    #[arg(long)]
    pub overwrite: bool,
}

/// Flags that override values from the configuration file
#[derive(Args, Debug, Clone, Default)]
pub struct InstanceOpts {
    /// Instance name used in diagnostics
    #[arg(long, global = true)]
    pub instance: Option<String>,

    /// Archive directory for this instance's WAL
    #[arg(long = "archive-dir", global = true)]
    pub archive_dir: Option<PathBuf>,

    /// Expected database system identifier
    #[arg(long = "system-identifier", global = true)]
    pub system_identifier: Option<u64>,

    /// none | zlib | pglz
    #[arg(long = "compress-algorithm", global = true)]
    pub compress_algorithm: Option<String>,

    #[arg(long = "compress-level", global = true)]
    pub compress_level: Option<u32>,

    /// Worker count; above 1 the transport refuses password prompts
    #[arg(short = 'j', long = "threads", global = true)]
    pub num_threads: Option<u32>,

    /// Append operator events to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    #[arg(long = "remote-proto", global = true)]
    pub remote_proto: Option<String>,

    #[arg(long = "remote-host", global = true)]
    pub remote_host: Option<String>,

    #[arg(long = "remote-port", global = true)]
    pub remote_port: Option<String>,

    /// Directory of this binary on the remote host
    #[arg(long = "remote-path", global = true)]
    pub remote_path: Option<String>,

    #[arg(long = "ssh-config", global = true)]
    pub ssh_config: Option<PathBuf>,

    /// Extra transport options, quoted like a shell would
    #[arg(long = "ssh-options", global = true)]
    pub ssh_options: Option<String>,
}

impl InstanceOpts {
    /// Overlay the flags that were given onto `cfg`
    pub fn apply(&self, cfg: &mut InstanceConfig) -> Result<()> {
        if let Some(v) = &self.instance {
            cfg.name = v.clone();
        }
        if let Some(v) = &self.archive_dir {
            cfg.archive_dir = Some(v.clone());
        }
        if let Some(v) = self.system_identifier {
            cfg.system_identifier = Some(v);
        }
        if let Some(v) = &self.compress_algorithm {
            cfg.compress_algorithm = v.parse::<CompressAlgorithm>()?;
        }
        if let Some(v) = self.compress_level {
            cfg.compress_level = v;
        }
        if let Some(v) = self.num_threads {
            cfg.num_threads = v;
        }
        if let Some(v) = &self.log_file {
            cfg.log_file = Some(v.clone());
        }
        let r = &mut cfg.remote;
        if let Some(v) = &self.remote_proto {
            r.proto = Some(v.clone());
        }
        if let Some(v) = &self.remote_host {
            r.host = Some(v.clone());
        }
        if let Some(v) = &self.remote_port {
            r.port = Some(v.clone());
        }
        if let Some(v) = &self.remote_path {
            r.path = Some(v.clone());
        }
        if let Some(v) = &self.ssh_config {
            r.ssh_config = Some(v.clone());
        }
        if let Some(v) = &self.ssh_options {
            r.ssh_options = Some(v.clone());
        }
        Ok(())
    }
}
