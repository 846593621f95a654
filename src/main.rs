//! Walarc - crash-safe WAL archive-push / archive-get
//!
//! Invoked by the database as archive_command / restore_command. With a
//! remote host configured, one side of the copy is reached through a
//! transport that runs `walarc agent` on the other host.

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use walarc::agent;
use walarc::archive::{do_archive_get, do_archive_push, PushOutcome, SegmentRequest};
use walarc::cli::{Cli, Commands, PushArgs, SegmentArgs};
use walarc::config::InstanceConfig;
use walarc::location::LocationRouter;
use walarc::logger::{Logger, NoopLogger, TextLogger};
use walarc::remote::RemoteFs;
use walarc::transport::TransportSession;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // stdout belongs to the agent protocol; diagnostics go to stderr only
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn load_instance(cli: &Cli) -> Result<InstanceConfig> {
    let mut cfg = match &cli.config {
        Some(path) => InstanceConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => InstanceConfig::default(),
    };
    cli.instance.apply(&mut cfg)?;
    cfg.validate()?;
    Ok(cfg)
}

fn pgdata_dir(seg: &SegmentArgs) -> Result<PathBuf> {
    match &seg.pgdata {
        Some(p) => Ok(p.clone()),
        None => std::env::current_dir().context("resolving current directory"),
    }
}

enum Job<'c> {
    Push(&'c PushArgs),
    Get(&'c SegmentArgs),
}

fn run_archive(job: Job<'_>, cfg: &InstanceConfig) -> Result<()> {
    let logger: Box<dyn Logger> = match &cfg.log_file {
        Some(path) => Box::new(TextLogger::new(path)?),
        None => Box::new(NoopLogger),
    };

    // Session outlives the router borrowing its channel
    let session = if cfg.remote.is_enabled() {
        Some(TransportSession::establish(&cfg.remote, cfg.num_threads)?)
    } else {
        None
    };
    let router = match &session {
        Some(s) => {
            debug!("transport pid {}", s.id());
            LocationRouter::with_remote(
                cfg.remote.target.into(),
                Box::new(RemoteFs::new(s.channel())),
            )
        }
        None => LocationRouter::local(),
    };

    match job {
        Job::Push(args) => {
            let pgdata = pgdata_dir(&args.segment)?;
            let req = SegmentRequest {
                pgdata: &pgdata,
                wal_file_path: args.segment.wal_file_path.as_deref(),
                wal_file_name: args.segment.wal_file_name.as_deref(),
            };
            match do_archive_push(cfg, &router, logger.as_ref(), &req, args.overwrite)? {
                PushOutcome::Archived { path, bytes } => {
                    debug!("archived {} ({} bytes)", path.display(), bytes)
                }
                PushOutcome::AlreadyArchived { path } => {
                    debug!("{} already archived", path.display())
                }
            }
        }
        Job::Get(seg) => {
            let pgdata = pgdata_dir(seg)?;
            let req = SegmentRequest {
                pgdata: &pgdata,
                wal_file_path: seg.wal_file_path.as_deref(),
                wal_file_name: seg.wal_file_name.as_deref(),
            };
            let got = do_archive_get(cfg, &router, logger.as_ref(), &req)?;
            debug!(
                "restored {} bytes from {}{}",
                got.bytes,
                got.source.display(),
                if got.decompressed { " (decompressed)" } else { "" }
            );
        }
    }
    Ok(())
}

fn run_agent(version: &str) -> Result<()> {
    agent::check_version(version)?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    agent::serve(stdin.lock(), stdout.lock())?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let job = match &cli.command {
        Commands::Agent { version } => return run_agent(version),
        Commands::ArchivePush(args) => Job::Push(args),
        Commands::ArchiveGet(seg) => Job::Get(seg),
    };
    let cfg = load_instance(&cli)?;
    run_archive(job, &cfg)
}
