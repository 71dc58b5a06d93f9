//! Cache block identity
//!
//! A block is identified by `(volume, inode, fixed_file_offset, version)`,
//! rendered textually as `volume "/" inode "#" offset "#" version`. The
//! text form doubles as the block file's path relative to the store root,
//! so it is collision-free by construction.

use std::fmt;
use std::str::FromStr;

use crate::error::CacheError;
use crate::proto::CacheRequest;

/// Identity of one materialized cache block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    volume: String,
    inode: u64,
    offset: u64,
    version: u32,
}

impl BlockKey {
    /// Create a new block key
    pub fn new(volume: impl Into<String>, inode: u64, offset: u64, version: u32) -> Self {
        Self {
            volume: volume.into(),
            inode,
            offset,
            version,
        }
    }

    /// Key for the block a cache request describes
    pub fn from_request(req: &CacheRequest) -> Self {
        Self::new(
            req.volume.clone(),
            req.inode,
            req.fixed_file_offset,
            req.version,
        )
    }

    /// Volume name
    #[inline]
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// Inode within the volume
    #[inline]
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Block-aligned file offset
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Data version
    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}#{}",
            self.volume, self.inode, self.offset, self.version
        )
    }
}

impl FromStr for BlockKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CacheError::InvalidKey(s.to_string());

        // Volume names may themselves contain '/'; the numeric tail starts
        // after the last one.
        let (volume, tail) = s.rsplit_once('/').ok_or_else(invalid)?;
        if volume.is_empty() {
            return Err(invalid());
        }

        let mut parts = tail.split('#');
        let inode = parts.next().ok_or_else(invalid)?;
        let offset = parts.next().ok_or_else(invalid)?;
        let version = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            volume: volume.to_string(),
            inode: inode.parse().map_err(|_| invalid())?,
            offset: offset.parse().map_err(|_| invalid())?,
            version: version.parse().map_err(|_| invalid())?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
