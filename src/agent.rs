//! Agent mode: serve file primitives for a remote peer
//!
//! Launched on the far host as `walarc agent <version>` with its stdin and
//! stdout wired to the transport. Reads one request frame at a time,
//! executes it against the local filesystem and writes exactly one reply.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{ArchiveError, Result};
use crate::location::{FileSystem, FileWriter, LocalFs};
use crate::protocol::{self, frame, Decoder, Encoder, MAX_IO_CHUNK};

enum Handle<'a> {
    Reader(Box<dyn Read + 'a>),
    Writer(Box<dyn FileWriter + 'a>),
}

/// Per-connection agent state
struct Session<'a> {
    fs: &'a LocalFs,
    handles: HashMap<u32, Handle<'a>>,
    next_handle: u32,
}

/// A reply to send back: frame type and payload
type Reply = (u8, Vec<u8>);

fn ok() -> Reply {
    (frame::OK, Vec::new())
}

fn io_reply(res: io::Result<Reply>) -> Reply {
    match res {
        Ok(r) => r,
        Err(e) => (frame::ERROR, protocol::encode_error(&e)),
    }
}

fn bad_handle(h: u32) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such handle {}", h))
}

impl<'a> Session<'a> {
    fn new(fs: &'a LocalFs) -> Self {
        Self {
            fs,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    fn register(&mut self, h: Handle<'a>) -> Reply {
        let id = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.handles.insert(id, h);
        (frame::HANDLE, Encoder::new().u32(id).finish())
    }

    fn dispatch(&mut self, t: u8, payload: &[u8]) -> Result<Reply> {
        let mut d = Decoder::new(payload);
        let fs = self.fs;
        let reply = match t {
            frame::OPEN_READ => {
                let path = Path::new(d.str()?);
                match fs.open_read(path) {
                    Ok(r) => self.register(Handle::Reader(r)),
                    Err(e) => io_reply(Err(e)),
                }
            }
            frame::CREATE_EXCL => {
                let path = Path::new(d.str()?);
                match fs.create_exclusive(path) {
                    Ok(w) => self.register(Handle::Writer(w)),
                    Err(e) => io_reply(Err(e)),
                }
            }
            frame::READ => {
                let h = d.u32()?;
                let want = (d.u32()? as usize).min(MAX_IO_CHUNK);
                io_reply(match self.handles.get_mut(&h) {
                    Some(Handle::Reader(r)) => read_chunk(r.as_mut(), want),
                    _ => Err(bad_handle(h)),
                })
            }
            frame::WRITE => {
                let h = d.u32()?;
                let data = d.bytes()?;
                io_reply(match self.handles.get_mut(&h) {
                    Some(Handle::Writer(w)) => w.write_all(data).map(|_| ok()),
                    _ => Err(bad_handle(h)),
                })
            }
            frame::CLOSE => {
                let h = d.u32()?;
                io_reply(match self.handles.remove(&h) {
                    Some(Handle::Writer(w)) => w.finish().map(|_| ok()),
                    Some(Handle::Reader(_)) => Ok(ok()),
                    None => Err(bad_handle(h)),
                })
            }
            frame::EXISTS => {
                let path = Path::new(d.str()?);
                io_reply(
                    fs.exists(path)
                        .map(|b| (frame::BOOL, Encoder::new().u8(b as u8).finish())),
                )
            }
            frame::STAT => {
                let path = Path::new(d.str()?);
                io_reply(fs.stat(path).map(|st| {
                    (
                        frame::STAT_RESP,
                        Encoder::new().u64(st.size).u32(st.mode).finish(),
                    )
                }))
            }
            frame::CHMOD => {
                let path = Path::new(d.str()?);
                let mode = d.u32()?;
                io_reply(fs.set_mode(path, mode).map(|_| ok()))
            }
            frame::RENAME => {
                let from = Path::new(d.str()?);
                let to = Path::new(d.str()?);
                io_reply(fs.rename(from, to).map(|_| ok()))
            }
            frame::UNLINK => {
                let path = Path::new(d.str()?);
                io_reply(fs.unlink(path).map(|_| ok()))
            }
            frame::MKDIR => {
                let path = Path::new(d.str()?);
                io_reply(fs.create_dir_all(path).map(|_| ok()))
            }
            other => io_reply(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown request type {}", other),
            ))),
        };
        Ok(reply)
    }
}

fn read_chunk<R: Read + ?Sized>(r: &mut R, want: usize) -> io::Result<Reply> {
    let mut buf = vec![0u8; want];
    let n = loop {
        match r.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    buf.truncate(n);
    Ok((frame::DATA, buf))
}

/// Serve requests until the peer closes `input`.
///
/// Malformed payloads get an ERROR reply; only framing errors (bad magic,
/// version mismatch, truncation) end the session with an error.
pub fn serve<R: Read, W: Write>(mut input: R, mut output: W) -> Result<()> {
    let fs = LocalFs;
    let mut session = Session::new(&fs);
    while let Some((t, payload)) = protocol::read_frame(&mut input)? {
        let (rt, body) = match session.dispatch(t, &payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("bad request type {}: {}", t, e);
                let err = io::Error::new(io::ErrorKind::InvalidData, e.to_string());
                (frame::ERROR, protocol::encode_error(&err))
            }
        };
        protocol::write_frame(&mut output, rt, &body)
            .map_err(|e| ArchiveError::Protocol(format!("reply write failed: {}", e)))?;
    }
    debug!(
        "agent input closed, {} handle(s) left open",
        session.handles.len()
    );
    Ok(())
}

/// Refuse to serve a peer built from a different release.
pub fn check_version(requested: &str) -> Result<()> {
    let ours = env!("CARGO_PKG_VERSION");
    if requested != ours {
        return Err(ArchiveError::config(format!(
            "Agent version mismatch: remote side requested {} but this is {}",
            requested, ours
        )));
    }
    Ok(())
}
