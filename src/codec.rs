//! Stream codecs applied on top of the location primitives
//!
//! Compression runs in this process; only already-encoded bytes cross the
//! transport.

use std::io::{self, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::location::FileWriter;

/// Suffix used for gzip-compressed segments in the archive
pub const GZ_SUFFIX: &str = ".gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCodec {
    Identity,
    Gzip { level: u32 },
}

impl StreamCodec {
    pub fn is_compressed(&self) -> bool {
        matches!(self, StreamCodec::Gzip { .. })
    }

    /// File name suffix for data written with this codec
    pub fn suffix(&self) -> &'static str {
        match self {
            StreamCodec::Identity => "",
            StreamCodec::Gzip { .. } => GZ_SUFFIX,
        }
    }

    /// Wrap a raw source so reads yield decoded bytes
    pub fn reader<'a>(&self, inner: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        match self {
            StreamCodec::Identity => inner,
            StreamCodec::Gzip { .. } => Box::new(MultiGzDecoder::new(inner)),
        }
    }

    /// Wrap a destination so writes are encoded
    pub fn writer<'a>(&self, inner: Box<dyn FileWriter + 'a>) -> EncodedWriter<'a> {
        match *self {
            StreamCodec::Identity => EncodedWriter::Plain(inner),
            StreamCodec::Gzip { level } => {
                EncodedWriter::Gzip(GzEncoder::new(inner, Compression::new(level.min(9))))
            }
        }
    }
}

/// Writer produced by [`StreamCodec::writer`]
pub enum EncodedWriter<'a> {
    Plain(Box<dyn FileWriter + 'a>),
    Gzip(GzEncoder<Box<dyn FileWriter + 'a>>),
}

impl EncodedWriter<'_> {
    /// Finish the encoding (gzip trailer) then close the file.
    pub fn finish(self) -> io::Result<()> {
        match self {
            EncodedWriter::Plain(w) => w.finish(),
            EncodedWriter::Gzip(enc) => enc.finish()?.finish(),
        }
    }
}

impl Write for EncodedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EncodedWriter::Plain(w) => w.write(buf),
            EncodedWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EncodedWriter::Plain(w) => w.flush(),
            EncodedWriter::Gzip(w) => w.flush(),
        }
    }
}
