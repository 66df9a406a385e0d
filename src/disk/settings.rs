use serde_derive::{Deserialize, Serialize};

/// The tunables of the disk core.
///
/// A settings value is immutable once published: updates go through
/// `Disk::set_settings`, which swaps in a fresh snapshot atomically. Workers
/// load the current snapshot at the top of each job, so a job observes one
/// coherent configuration for its whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSettings {
    /// The total block buffer budget of the cache, in blocks. 0 disables
    /// caching entirely, routing every read and write straight to storage.
    pub cache_size: usize,
    /// Whether blocks read from storage are retained in the read cache.
    pub use_read_cache: bool,
    /// Whether blocks written by peers are staged in the write cache.
    pub use_write_cache: bool,
    /// Seconds a dirty piece may sit unused in the write cache before the
    /// periodic sweep force-flushes it.
    pub cache_expiry: u64,
    /// The number of contiguous hashed blocks required before a write piece
    /// is flushed. Larger values produce larger vectored writes.
    pub write_cache_line_size: usize,
    /// Read requests are padded out to this many blocks, so neighboring
    /// requests are served from cache instead of separate storage calls.
    pub read_cache_line_size: usize,
    /// When the write cache line spans several pieces, permit flushing the
    /// stripe piece by piece instead of waiting for every member to fill up.
    pub allow_partial_disk_writes: bool,
    /// Skip piece digests entirely. Dirty blocks are flushed as soon as the
    /// contiguity floor is met, whether or not they have been hashed.
    pub disable_hash_checks: bool,
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            cache_size: 1024,
            use_read_cache: true,
            use_write_cache: true,
            cache_expiry: 300,
            write_cache_line_size: 16,
            read_cache_line_size: 32,
            allow_partial_disk_writes: false,
            disable_hash_checks: false,
        }
    }
}

impl DiskSettings {
    /// Whether the write path stages blocks in the cache.
    pub(crate) fn write_cache_enabled(&self) -> bool {
        self.use_write_cache && self.cache_size > 0
    }

    /// Whether the read path consults and populates the cache.
    pub(crate) fn read_cache_enabled(&self) -> bool {
        self.use_read_cache && self.cache_size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let settings: DiskSettings =
            serde_json::from_str(r#"{ "cache_size": 64 }"#).unwrap();
        assert_eq!(settings.cache_size, 64);
        assert_eq!(settings.cache_expiry, DiskSettings::default().cache_expiry);
        assert!(settings.use_read_cache);
    }

    #[test]
    fn test_zero_cache_disables_both_directions() {
        let settings = DiskSettings {
            cache_size: 0,
            ..Default::default()
        };
        assert!(!settings.read_cache_enabled());
        assert!(!settings.write_cache_enabled());
    }
}
