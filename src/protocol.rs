//! Framed request/reply protocol spoken between the local process and the agent
//!
//! Every frame is `MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4) | payload`.
//! The local side sends one request frame and reads exactly one reply frame.

use std::io::{self, Read, Write};

use crate::error::{ArchiveError, Result};

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"WALA";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 11;

// Maximum frame payload size (16MB) - bounds agent memory per request
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Largest READ/WRITE chunk carried in one frame
pub const MAX_IO_CHUNK: usize = 1024 * 1024;

// Frame type IDs (keep numeric stable, local and agent binaries must agree)
pub mod frame {
    // Requests
    pub const OPEN_READ: u8 = 1;
    pub const CREATE_EXCL: u8 = 2;
    pub const READ: u8 = 3;
    pub const WRITE: u8 = 4;
    pub const CLOSE: u8 = 5;
    pub const EXISTS: u8 = 6;
    pub const STAT: u8 = 7;
    pub const CHMOD: u8 = 8;
    pub const RENAME: u8 = 9;
    pub const UNLINK: u8 = 10;
    pub const MKDIR: u8 = 11;

    // Replies
    pub const OK: u8 = 32;
    pub const ERROR: u8 = 33;
    pub const HANDLE: u8 = 34;
    pub const DATA: u8 = 35;
    pub const BOOL: u8 = 36;
    pub const STAT_RESP: u8 = 37;
}

/// Build frame header (11 bytes)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, usize)> {
    if &header[0..4] != MAGIC {
        return Err(ArchiveError::Protocol("invalid magic in frame header".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(ArchiveError::Protocol(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }
    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    validate_frame_size(payload_len)?;
    Ok((frame_type, payload_len))
}

pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(ArchiveError::Protocol(format!(
            "frame payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

pub fn write_frame<W: Write + ?Sized>(w: &mut W, t: u8, payload: &[u8]) -> io::Result<()> {
    validate_frame_size(payload.len())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    w.write_all(&build_frame_header(t, payload.len() as u32))?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// before a new frame started.
pub fn read_frame<R: Read + ?Sized>(r: &mut R) -> Result<Option<(u8, Vec<u8>)>> {
    let mut hdr = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match r.read(&mut hdr[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ArchiveError::Protocol("truncated frame header".into()));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArchiveError::Protocol(format!("channel read failed: {}", e))),
        }
    }
    let (typ, len) = parse_frame_header(&hdr)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .map_err(|e| ArchiveError::Protocol(format!("truncated frame payload: {}", e)))?;
    Ok(Some((typ, payload)))
}

/// Little-endian payload builder
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Length-prefixed (u32) byte string
    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(v);
        self
    }

    pub fn str(self, v: &str) -> Self {
        self.bytes(v.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received payload
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| ArchiveError::Protocol("payload too short".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn str(&mut self) -> Result<&'a str> {
        let b = self.bytes()?;
        std::str::from_utf8(b).map_err(|_| ArchiveError::Protocol("utf8 path".into()))
    }
}

// io::ErrorKind is not stable across versions as a number, so map the ones
// the pipelines branch on.
pub fn kind_to_code(kind: io::ErrorKind) -> u8 {
    match kind {
        io::ErrorKind::NotFound => 1,
        io::ErrorKind::AlreadyExists => 2,
        io::ErrorKind::PermissionDenied => 3,
        io::ErrorKind::InvalidInput => 4,
        io::ErrorKind::InvalidData => 5,
        io::ErrorKind::UnexpectedEof => 6,
        _ => 0,
    }
}

pub fn code_to_kind(code: u8) -> io::ErrorKind {
    match code {
        1 => io::ErrorKind::NotFound,
        2 => io::ErrorKind::AlreadyExists,
        3 => io::ErrorKind::PermissionDenied,
        4 => io::ErrorKind::InvalidInput,
        5 => io::ErrorKind::InvalidData,
        6 => io::ErrorKind::UnexpectedEof,
        _ => io::ErrorKind::Other,
    }
}

/// ERROR payload: raw errno (-1 when absent) | kind code | message
pub fn encode_error(err: &io::Error) -> Vec<u8> {
    Encoder::new()
        .i32(err.raw_os_error().unwrap_or(-1))
        .u8(kind_to_code(err.kind()))
        .str(&err.to_string())
        .finish()
}

pub fn decode_error(payload: &[u8]) -> Result<io::Error> {
    let mut d = Decoder::new(payload);
    let errno = d.i32()?;
    let kind = d.u8()?;
    let msg = d.str()?;
    if errno >= 0 {
        Ok(io::Error::from_raw_os_error(errno))
    } else {
        Ok(io::Error::new(code_to_kind(kind), msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_round_trip() {
        let header = build_frame_header(frame::STAT, 12345);
        let (parsed_type, parsed_len) = parse_frame_header(&header).unwrap();
        assert_eq!(parsed_type, frame::STAT);
        assert_eq!(parsed_len, 12345);
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = build_frame_header(frame::OK, 0);
        header[0..4].copy_from_slice(b"WRNG");
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        let mut header = build_frame_header(frame::OK, 0);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_parse_frame_header_oversize() {
        let header = build_frame_header(frame::DATA, (MAX_FRAME_SIZE + 1) as u32);
        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_read_frame_clean_eof_and_truncation() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).unwrap().is_none());

        let header = build_frame_header(frame::OK, 4);
        let mut short: &[u8] = &header[..5];
        assert!(read_frame(&mut short).is_err());

        let mut missing_payload = header.to_vec();
        missing_payload.extend_from_slice(&[1, 2]);
        assert!(read_frame(&mut missing_payload.as_slice()).is_err());
    }

    #[test]
    fn test_write_then_read_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame::WRITE, b"payload").unwrap();
        let (t, p) = read_frame(&mut wire.as_slice()).unwrap().unwrap();
        assert_eq!(t, frame::WRITE);
        assert_eq!(p, b"payload");
    }

    #[test]
    fn test_decoder_rejects_short_payload() {
        let payload = Encoder::new().u32(10).finish();
        let mut d = Decoder::new(&payload);
        assert!(d.bytes().is_err());
    }

    #[test]
    fn test_error_keeps_errno() {
        let err = io::Error::from_raw_os_error(libc::EEXIST);
        let back = decode_error(&encode_error(&err)).unwrap();
        assert_eq!(back.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(back.raw_os_error(), Some(libc::EEXIST));

        let synthetic = io::Error::new(io::ErrorKind::NotFound, "no such handle");
        let back = decode_error(&encode_error(&synthetic)).unwrap();
        assert_eq!(back.kind(), io::ErrorKind::NotFound);
        assert!(back.to_string().contains("no such handle"));
    }
}
