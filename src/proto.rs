//! Wire-level types shared with the datanode protocol layer.
//!
//! The engine treats these shapes as opaque beyond the fields below; the
//! RPC surface that produces them is an external collaborator. Field names
//! follow the platform's JSON casing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One segment of backing storage contributing bytes to a cache block.
///
/// A source occupies the block range starting at the prefix sum of the
/// preceding sources' `size_in_block`; fetch order across sources is
/// unconstrained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// Data partition holding the extent
    pub partition_id: u64,
    /// Extent within the partition
    pub extent_id: u64,
    /// Byte offset of the segment within the extent
    pub extent_offset: u64,
    /// Bytes this source contributes to the logical block
    pub size_in_block: u32,
    /// Bytes addressable at `extent_offset` on the remote side
    pub size: u32,
    /// Replica hosts able to serve the segment
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// A prepare/read-source descriptor for one logical block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRequest {
    /// Volume name
    pub volume: String,
    /// Inode within the volume
    pub inode: u64,
    /// Block-aligned offset of the region within the file
    pub fixed_file_offset: u64,
    /// Data version; stale versions are evicted explicitly by the caller
    pub version: u32,
    /// Entry TTL in seconds; values <= 0 select the engine default
    pub ttl: i64,
    /// Backing segments, in block order
    pub sources: Vec<DataSource>,
}

/// Monitoring action codes emitted through the host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheAction {
    CacheHit,
    CacheMiss,
    CacheExpire,
    CacheEvict,
}

/// Engine status snapshot returned by `CacheEngine::status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Byte budget available to cache entries (total * max-use ratio)
    pub max_alloc: u64,
    /// Bytes currently allocated to live entries
    pub has_alloc: u64,
    /// Total size of the backing filesystem
    pub total: u64,
    /// Bytes consumed on the backing filesystem
    pub used: u64,
    /// Live entry count
    pub num: usize,
    /// Hit rate rounded to 1e-4
    pub hit_rate: f64,
    /// Bytes evicted since the previous status poll
    pub evicts: u64,
    /// Maximum live entry count
    pub capacity: usize,
}

/// Host-supplied extent reader.
///
/// Invoked once per `(block, source)` pair during materialization. The
/// writer argument persists `data` at `offset` bytes into the source's
/// range of the block; the callback owns its own timeouts.
pub type ReadExtentFn = Arc<
    dyn Fn(&DataSource, &mut dyn FnMut(&[u8], u64) -> Result<()>) -> Result<usize> + Send + Sync,
>;

/// Host-supplied monitoring sink: `(volume, action, size_bytes)`.
pub type MonitorFn = Arc<dyn Fn(&str, CacheAction, u64) + Send + Sync>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_names() {
        let req = CacheRequest {
            volume: "vol".to_string(),
            inode: 42,
            fixed_file_offset: 1 << 20,
            version: 3,
            ttl: -1,
            sources: vec![DataSource {
                partition_id: 7,
                extent_id: 11,
                extent_offset: 4096,
                size_in_block: 65536,
                size: 65536,
                hosts: vec!["10.0.0.1:17030".to_string()],
            }],
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["fixedFileOffset"], 1 << 20);
        assert_eq!(json["sources"][0]["partitionId"], 7);
        assert_eq!(json["sources"][0]["sizeInBlock"], 65536);
    }

    #[test]
    fn test_sources_default_hosts() {
        let src: DataSource = serde_json::from_str(
            r#"{"partitionId":1,"extentId":2,"extentOffset":0,"sizeInBlock":128,"size":128}"#,
        )
        .unwrap();
        assert!(src.hosts.is_empty());
    }

    #[test]
    fn test_status_wire_names() {
        let status = CacheStatus {
            max_alloc: 100,
            has_alloc: 50,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["maxAlloc"], 100);
        assert_eq!(json["hasAlloc"], 50);
        assert_eq!(json["hitRate"], 0.0);
    }
}
