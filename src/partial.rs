//! Handling of leftover `.part` files
//!
//! There is no lock shared between archivers, possibly on different hosts.
//! A temporary file is judged abandoned if its size does not grow while we
//! watch it for a while; a growing file belongs to a live writer.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ArchiveError, Result};
use crate::location::FileSystem;

/// Suffix of in-flight files
pub const PART_SUFFIX: &str = ".part";

/// `<final>.part`
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut s = final_path.as_os_str().to_owned();
    s.push(PART_SUFFIX);
    PathBuf::from(s)
}

/// How a later sample is compared against the first one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthRule {
    /// Live if the size increased
    Grew,
    /// Live if the size changed in either direction
    Changed,
}

impl GrowthRule {
    pub fn is_live(&self, first: u64, current: u64) -> bool {
        match self {
            GrowthRule::Grew => current > first,
            GrowthRule::Changed => current != first,
        }
    }
}

/// Sampling policy for deciding whether a partial file is stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalePolicy {
    pub interval: Duration,
    pub rounds: u32,
    pub growth: GrowthRule,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            rounds: 5,
            growth: GrowthRule::Grew,
        }
    }
}

/// Observation state for one temporary file
#[derive(Debug)]
pub struct PartialFile {
    pub path: PathBuf,
    pub samples: u32,
    pub first_size: Option<u64>,
    pub last_size: Option<u64>,
}

impl PartialFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            samples: 0,
            first_size: None,
            last_size: None,
        }
    }

    /// Record one size sample; returns true when the writer looks alive.
    fn observe(&mut self, size: u64, rule: GrowthRule) -> bool {
        self.samples += 1;
        self.last_size = Some(size);
        let first = *self.first_size.get_or_insert(size);
        rule.is_live(first, size)
    }
}

impl StalePolicy {
    /// A zero window would reclaim a live writer's file unobserved.
    pub fn check(&self) -> Result<()> {
        if self.rounds == 0 {
            return Err(ArchiveError::config("stale rounds must be at least 1"));
        }
        if self.interval.is_zero() {
            return Err(ArchiveError::config("stale interval must be greater than 0"));
        }
        Ok(())
    }

    /// Watch `partial` for the configured window and remove it if stale.
    ///
    /// Fails with [`ArchiveError::NotStale`] when the file grows (the file
    /// is left alone) and with an I/O error if it cannot be stat'ed, which
    /// includes it disappearing mid-watch.
    pub fn reclaim(&self, fs: &dyn FileSystem, partial: &mut PartialFile) -> Result<()> {
        self.check()?;
        for round in 0..self.rounds {
            let st = fs.stat(&partial.path).map_err(|e| {
                ArchiveError::io("stat destination temporary WAL file", &partial.path, e)
            })?;
            if partial.observe(st.size, self.growth) {
                return Err(ArchiveError::NotStale {
                    path: partial.path.clone(),
                });
            }
            debug!(
                "partial {} round {}/{} size {}",
                partial.path.display(),
                round + 1,
                self.rounds,
                st.size
            );
            if round + 1 < self.rounds {
                thread::sleep(self.interval);
            }
        }

        warn!(
            "Reusing stale destination temporary WAL file \"{}\"",
            partial.path.display()
        );
        fs.unlink(&partial.path).map_err(|e| {
            ArchiveError::io("remove stale temporary WAL file", &partial.path, e)
        })
    }
}
