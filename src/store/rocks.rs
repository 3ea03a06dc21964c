//! RocksDB wrapper for registry storage

use std::path::Path;
use std::sync::Arc;

use crate::models::{HubError, HubResult};

/// Column family holding peer hub rows
pub const CF_HUBS: &str = "hubs";
/// Column family holding project catalog rows
pub const CF_PROJECTS: &str = "projects";
/// Column family holding monitored services
pub const CF_SERVICES: &str = "services";
/// Column family holding the append-only check history
pub const CF_HEALTH_RESULTS: &str = "health_results";

const COLUMN_FAMILIES: [&str; 4] = [CF_HUBS, CF_PROJECTS, CF_SERVICES, CF_HEALTH_RESULTS];

/// RocksDB storage backend
pub struct RocksStore {
    db: Arc<rocksdb::DB>,
}

impl RocksStore {
    /// Open or create a RocksDB database
    pub fn open<P: AsRef<Path>>(path: P) -> HubResult<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = rocksdb::DB::open_cf(&opts, path, COLUMN_FAMILIES)
            .map_err(|e| HubError::DatabaseError(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Open with custom options
    pub fn open_with_opts<P: AsRef<Path>>(
        path: P,
        cache_size_mb: usize,
        compression: bool,
    ) -> HubResult<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Set block cache
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&rocksdb::Cache::new_lru_cache(cache_size_mb * 1024 * 1024));
        opts.set_block_based_table_factory(&block_opts);

        if compression {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let db = rocksdb::DB::open_cf(&opts, path, COLUMN_FAMILIES)
            .map_err(|e| HubError::DatabaseError(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a reference to the underlying database
    pub fn db(&self) -> &rocksdb::DB {
        &self.db
    }

    /// Get a column family handle
    pub fn cf(&self, name: &str) -> HubResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| HubError::DatabaseError(format!("Column family not found: {}", name)))
    }

    /// Cheap reachability probe used by health aggregation
    pub fn ping(&self) -> HubResult<()> {
        let cf = self.cf(CF_HUBS)?;
        self.db.get_cf(cf, b"__ping__")?;
        Ok(())
    }
}

impl Clone for RocksStore {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore").finish()
    }
}
