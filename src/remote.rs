//! Client side of the agent protocol
//!
//! [`RemoteFs`] implements [`FileSystem`] by forwarding each call as a
//! request frame over a [`Channel`]. Calls are strictly request/reply and
//! serialize on the channel lock; no multiplexing.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{ArchiveError, Result};
use crate::location::{FileStat, FileSystem, FileWriter};
use crate::protocol::{self, frame, Decoder, Encoder, MAX_IO_CHUNK};

struct ChannelIo {
    reader: BufReader<Box<dyn Read + Send>>,
    // None once closed
    writer: Option<BufWriter<Box<dyn Write + Send>>>,
}

/// Duplex byte channel to an agent
pub struct Channel {
    io: Mutex<ChannelIo>,
}

impl Channel {
    pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            io: Mutex::new(ChannelIo {
                reader: BufReader::new(reader),
                writer: Some(BufWriter::new(writer)),
            }),
        }
    }

    /// Send one request and wait for its reply.
    pub fn call(&self, t: u8, payload: &[u8]) -> Result<(u8, Vec<u8>)> {
        let mut guard = self.io.lock();
        let io = &mut *guard;
        let writer = io
            .writer
            .as_mut()
            .ok_or_else(|| ArchiveError::Protocol("channel is closed".into()))?;
        protocol::write_frame(writer, t, payload)
            .map_err(|e| ArchiveError::Protocol(format!("channel write failed: {}", e)))?;
        protocol::read_frame(&mut io.reader)?
            .ok_or_else(|| ArchiveError::Protocol("agent closed the channel".into()))
    }

    /// Flush and drop the write side so the agent sees EOF.
    ///
    /// Later calls fail with a protocol error.
    pub fn close(&self) -> io::Result<()> {
        match self.io.lock().writer.take() {
            Some(mut w) => w.flush(),
            None => Ok(()),
        }
    }
}

// Protocol failures surface to the pipelines as I/O errors on the path
fn to_io(err: ArchiveError) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err.to_string())
}

fn path_str(path: &Path) -> io::Result<&str> {
    path.to_str().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path is not valid UTF-8: {}", path.display()),
        )
    })
}

/// Forwarding filesystem backed by an agent
pub struct RemoteFs<'a> {
    chan: &'a Channel,
}

impl<'a> RemoteFs<'a> {
    pub fn new(chan: &'a Channel) -> Self {
        Self { chan }
    }

    /// Issue a request and turn ERROR replies into `io::Error`
    fn request(&self, t: u8, payload: Vec<u8>) -> io::Result<(u8, Vec<u8>)> {
        let (rt, body) = self.chan.call(t, &payload).map_err(to_io)?;
        if rt == frame::ERROR {
            return Err(protocol::decode_error(&body).map_err(to_io)?);
        }
        Ok((rt, body))
    }

    fn expect(&self, t: u8, payload: Vec<u8>, want: u8) -> io::Result<Vec<u8>> {
        let (rt, body) = self.request(t, payload)?;
        if rt != want {
            return Err(to_io(ArchiveError::Protocol(format!(
                "unexpected reply type {} (wanted {})",
                rt, want
            ))));
        }
        Ok(body)
    }

    fn handle(&self, t: u8, path: &Path) -> io::Result<u32> {
        let body = self.expect(t, Encoder::new().str(path_str(path)?).finish(), frame::HANDLE)?;
        Decoder::new(&body).u32().map_err(to_io)
    }

    fn close(&self, handle: u32) -> io::Result<()> {
        self.expect(frame::CLOSE, Encoder::new().u32(handle).finish(), frame::OK)
            .map(|_| ())
    }
}

struct RemoteReader<'a> {
    fs: &'a RemoteFs<'a>,
    handle: u32,
    open: bool,
}

impl Read for RemoteReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(MAX_IO_CHUNK) as u32;
        let data = self.fs.expect(
            frame::READ,
            Encoder::new().u32(self.handle).u32(want).finish(),
            frame::DATA,
        )?;
        if data.len() > buf.len() {
            return Err(to_io(ArchiveError::Protocol("oversized DATA reply".into())));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Drop for RemoteReader<'_> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.fs.close(self.handle);
        }
    }
}

struct RemoteWriter<'a> {
    fs: &'a RemoteFs<'a>,
    handle: u32,
    open: bool,
}

impl Write for RemoteWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(MAX_IO_CHUNK);
        self.fs.expect(
            frame::WRITE,
            Encoder::new().u32(self.handle).bytes(&buf[..n]).finish(),
            frame::OK,
        )?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileWriter for RemoteWriter<'_> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.open = false;
        self.fs.close(self.handle)
    }
}

impl Drop for RemoteWriter<'_> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.fs.close(self.handle);
        }
    }
}

impl FileSystem for RemoteFs<'_> {
    fn open_read<'s>(&'s self, path: &Path) -> io::Result<Box<dyn Read + 's>> {
        let handle = self.handle(frame::OPEN_READ, path)?;
        Ok(Box::new(RemoteReader {
            fs: self,
            handle,
            open: true,
        }))
    }

    fn create_exclusive<'s>(&'s self, path: &Path) -> io::Result<Box<dyn FileWriter + 's>> {
        let handle = self.handle(frame::CREATE_EXCL, path)?;
        Ok(Box::new(RemoteWriter {
            fs: self,
            handle,
            open: true,
        }))
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        let body = self.expect(
            frame::EXISTS,
            Encoder::new().str(path_str(path)?).finish(),
            frame::BOOL,
        )?;
        Ok(Decoder::new(&body).u8().map_err(to_io)? != 0)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let body = self.expect(
            frame::STAT,
            Encoder::new().str(path_str(path)?).finish(),
            frame::STAT_RESP,
        )?;
        let mut d = Decoder::new(&body);
        let size = d.u64().map_err(to_io)?;
        let mode = d.u32().map_err(to_io)?;
        Ok(FileStat { size, mode })
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.expect(
            frame::CHMOD,
            Encoder::new().str(path_str(path)?).u32(mode).finish(),
            frame::OK,
        )
        .map(|_| ())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.expect(
            frame::RENAME,
            Encoder::new()
                .str(path_str(from)?)
                .str(path_str(to)?)
                .finish(),
            frame::OK,
        )
        .map(|_| ())
    }

    fn unlink(&self, path: &Path) -> io::Result<()> {
        self.expect(
            frame::UNLINK,
            Encoder::new().str(path_str(path)?).finish(),
            frame::OK,
        )
        .map(|_| ())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.expect(
            frame::MKDIR,
            Encoder::new().str(path_str(path)?).finish(),
            frame::OK,
        )
        .map(|_| ())
    }
}
