//! Transport bootstrap: run this binary in agent mode on the remote host
//!
//! The transport (normally `ssh`) is spawned once per process with its
//! stdin/stdout piped back to us. The resulting [`TransportSession`] owns
//! the child and the [`Channel`]; dropping it closes the child's stdin,
//! waits briefly for it to exit and only then falls back to SIGTERM.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::{ArchiveError, Result};
use crate::options::{split_options, MAX_CMDLINE_OPTIONS};
use crate::remote::Channel;

/// How long the transport gets to exit on its own after its stdin closes
pub const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Remote command line: `[<path>/]<program> agent <version>`
pub fn agent_command(remote_path: Option<&str>, program: &str, version: &str) -> String {
    match remote_path {
        Some(dir) => {
            let base = Path::new(program)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| program.to_string());
            format!("{}/{} agent {}", dir.trim_end_matches('/'), base, version)
        }
        None => format!("{} agent {}", program, version),
    }
}

/// Build the full transport argument vector.
///
/// Order: program, `-p port`, `-F config`, user options, hardening when
/// running with several workers, fixed `Compression=no` and
/// `LogLevel=error`, host, remote command.
pub fn build_transport_args(
    remote: &RemoteConfig,
    num_threads: u32,
    program: &str,
    version: &str,
) -> Result<Vec<String>> {
    let host = remote
        .host
        .as_deref()
        .ok_or_else(|| ArchiveError::config("required parameter not specified: remote-host"))?;

    let mut args = vec![remote.proto().to_string()];
    if let Some(port) = &remote.port {
        args.push("-p".into());
        args.push(port.clone());
    }
    if let Some(cfg) = &remote.ssh_config {
        args.push("-F".into());
        args.push(cfg.to_string_lossy().into_owned());
    }
    if let Some(opts) = &remote.ssh_options {
        split_options(&mut args, opts, MAX_CMDLINE_OPTIONS)?;
    }
    if num_threads > 1 {
        args.push("-o".into());
        args.push("PasswordAuthentication=no".into());
    }
    args.push("-o".into());
    args.push("Compression=no".into());
    args.push("-o".into());
    args.push("LogLevel=error".into());
    args.push(host.to_string());
    args.push(agent_command(remote.path.as_deref(), program, version));

    if args.len() >= MAX_CMDLINE_OPTIONS {
        return Err(ArchiveError::TooManyOptions {
            limit: MAX_CMDLINE_OPTIONS,
        });
    }
    Ok(args)
}

/// A spawned child with both standard streams piped to us
pub struct DuplexChild {
    pub child: Child,
    pub channel: Channel,
}

/// Spawn `argv` with stdin/stdout piped; stderr stays ours.
///
/// All other descriptors are close-on-exec, so the child only inherits the
/// three standard streams.
pub fn spawn_duplex(argv: &[String]) -> Result<DuplexChild> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| ArchiveError::config("empty transport command"))?;
    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| ArchiveError::Transport {
            program: program.clone(),
            source: e,
        })?;

    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(i), Some(o)) => (i, o),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ArchiveError::Protocol("transport pipes unavailable".into()));
        }
    };
    Ok(DuplexChild {
        child,
        channel: Channel::new(Box::new(stdout), Box::new(stdin)),
    })
}

/// Live connection to a remote agent
pub struct TransportSession {
    child: Child,
    channel: Channel,
}

impl TransportSession {
    /// Launch the transport described by `remote` and wire up the channel.
    pub fn establish(remote: &RemoteConfig, num_threads: u32) -> Result<Self> {
        let program = std::env::args()
            .next()
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        let argv = build_transport_args(remote, num_threads, &program, env!("CARGO_PKG_VERSION"))?;
        debug!("launching transport: {:?}", argv);
        Ok(Self::from_duplex(spawn_duplex(&argv)?))
    }

    pub fn from_duplex(d: DuplexChild) -> Self {
        Self {
            child: d.child,
            channel: d.channel,
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Close our end of the channel, give the child `grace` to exit on
    /// EOF, then SIGTERM it if it is still running and reap it.
    pub fn shutdown(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        if let Err(e) = self.channel.close() {
            debug!("flushing transport stdin on close: {}", e);
        }
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        debug!("transport {} still running, terminating", self.child.id());
        terminate(&self.child);
        self.child.wait()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        match self.shutdown(EXIT_GRACE) {
            Ok(status) => debug!("transport exited: {}", status),
            Err(e) => warn!("cannot reap transport process {}: {}", self.child.id(), e),
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    // SAFETY: kill(2) on a pid we spawned and have not reaped yet
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}
