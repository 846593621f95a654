//! Walarc library
//!
//! Crash-safe WAL segment archiving (archive-push / archive-get) over a
//! location-transparent file layer that can tunnel to a remote agent.

pub mod agent;
pub mod archive;
pub mod checksum;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod location;
pub mod logger;
pub mod options;
pub mod partial;
pub mod protocol;
pub mod remote;
pub mod segment;
pub mod transport;

pub use error::{ArchiveError, Result};
