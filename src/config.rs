//! The enumerated config surface of the storage core, expressed as a builder
//! in the teacher's `OpenOptions` style rather than a parsed config file —
//! parsing import paths/extensions into a concrete archive discovery job is
//! the outer layer's job, not this crate's.

use crate::error::{Result, StorageError};

/// Smallest page size accepted by [`MemoryPool`](crate::memory_pool::MemoryPool): 4 KiB.
pub const MIN_PAGE_SIZE: usize = 4096;
/// Largest page size accepted by [`MemoryPool`](crate::memory_pool::MemoryPool): 256 KiB.
pub const MAX_PAGE_SIZE: usize = 256 * 1024;
/// Default page size used when none is configured: 64 KiB.
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Floor for [`StorageOptions::maximum_pool_size`]: 10 MiB.
pub const MINIMUM_POOL_FLOOR: u64 = 10 * 1024 * 1024;
/// Absolute ceiling for the pool regardless of system memory: 124 GiB.
pub const POOL_CEILING_CAP: u64 = 124 * 1024 * 1024 * 1024;
/// Reserve subtracted from total system memory when deriving the pool ceiling: 8 GiB.
pub const POOL_CEILING_RESERVE: u64 = 8 * 1024 * 1024 * 1024;

/// Target utilization policy tag driving the pool's collection thresholds
/// (see [`UtilizationLevel::thresholds`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UtilizationLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// The five fractional thresholds of `maximum` at which the pool escalates
/// its collection level, ordered none < low < normal < high < very high.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationThresholds {
    pub none: f64,
    pub low: f64,
    pub normal: f64,
    pub high: f64,
    pub very_high: f64,
}

impl UtilizationLevel {
    /// Compute the absolute byte thresholds for a given pool `maximum`.
    pub fn thresholds(self, maximum: u64) -> UtilizationThresholds {
        let f = match self {
            UtilizationLevel::Low => [0.10, 0.25, 0.50, 0.75, 0.90],
            UtilizationLevel::Medium => [0.25, 0.50, 0.75, 0.85, 0.95],
            UtilizationLevel::High => [0.50, 0.75, 0.85, 0.95, 0.97],
        };
        let m = maximum as f64;
        UtilizationThresholds {
            none: f[0] * m,
            low: f[1] * m,
            normal: f[2] * m,
            high: f[3] * m,
            very_high: f[4] * m,
        }
    }
}

/// Derive the pool's allocation ceiling from total system memory, per §4.1:
/// `min(max(totalMem/2, totalMem - 8 GiB), 124 GiB)`.
pub fn pool_ceiling_from_system_memory() -> u64 {
    let total_kib = sys_info::mem_info().map(|m| m.total).unwrap_or(0);
    let total = total_kib.saturating_mul(1024);
    let half = total / 2;
    let minus_reserve = total.saturating_sub(POOL_CEILING_RESERVE);
    half.max(minus_reserve).min(POOL_CEILING_CAP)
}

/// Builder for the storage core's configuration surface (§6).
#[derive(Debug, Clone)]
pub struct StorageOptions {
    page_size: usize,
    maximum_pool_size: Option<u64>,
    utilization_level: UtilizationLevel,
    file_structure_block_size: usize,
    header_block_count: u8,
    import_paths: Vec<std::path::PathBuf>,
    import_extensions: Vec<String>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            maximum_pool_size: None,
            utilization_level: UtilizationLevel::default(),
            file_structure_block_size: DEFAULT_PAGE_SIZE,
            header_block_count: 10,
            import_paths: Vec::new(),
            import_extensions: Vec::new(),
        }
    }
}

impl StorageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool's page size. Must be a power of two in
    /// `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`.
    pub fn page_size(&mut self, page_size: usize) -> Result<&mut Self> {
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(StorageError::Other(
                "page size must be a power of two between 4 KiB and 256 KiB",
            ));
        }
        self.page_size = page_size;
        Ok(self)
    }

    pub fn page_size_get(&self) -> usize {
        self.page_size
    }

    /// Set the maximum pool size in bytes. `None` (the default) means derive
    /// it from total system memory at construction time. Clamped to
    /// `[MINIMUM_POOL_FLOOR, ceiling]`.
    pub fn maximum_pool_size(&mut self, bytes: Option<u64>) -> &mut Self {
        self.maximum_pool_size = bytes;
        self
    }

    /// Resolve the configured maximum pool size, applying the floor/ceiling
    /// clamp of §4.1.
    pub fn resolve_maximum_pool_size(&self) -> u64 {
        let ceiling = pool_ceiling_from_system_memory();
        let requested = self.maximum_pool_size.unwrap_or(ceiling);
        requested.clamp(MINIMUM_POOL_FLOOR, ceiling.max(MINIMUM_POOL_FLOOR))
    }

    pub fn utilization_level(&mut self, level: UtilizationLevel) -> &mut Self {
        self.utilization_level = level;
        self
    }

    pub fn utilization_level_get(&self) -> UtilizationLevel {
        self.utilization_level
    }

    /// Set the on-disk block size used by `FileHeaderBlock`/`DiskIoSession`.
    /// Must be a power of two and no larger than the pool's page size.
    pub fn file_structure_block_size(&mut self, size: usize) -> Result<&mut Self> {
        if !size.is_power_of_two() || size > self.page_size {
            return Err(StorageError::Other(
                "file structure block size must be a power of two no larger than the page size",
            ));
        }
        self.file_structure_block_size = size;
        Ok(self)
    }

    pub fn file_structure_block_size_get(&self) -> usize {
        self.file_structure_block_size
    }

    /// Set the number of header slots. Canonical value is 10; any value in
    /// `1..=10` is accepted.
    pub fn header_block_count(&mut self, count: u8) -> Result<&mut Self> {
        if !(1..=10).contains(&count) {
            return Err(StorageError::Other("header block count must be 1..=10"));
        }
        self.header_block_count = count;
        Ok(self)
    }

    pub fn header_block_count_get(&self) -> u8 {
        self.header_block_count
    }

    /// Add a directory the outer archive-discovery layer should scan.
    /// Validated only for basic path syntax; discovery itself is out of
    /// scope for this crate.
    pub fn add_import_path(&mut self, path: impl Into<std::path::PathBuf>) -> Result<&mut Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(StorageError::Other("import path must not be empty"));
        }
        self.import_paths.push(path);
        Ok(self)
    }

    pub fn add_import_extension(&mut self, ext: impl Into<String>) -> Result<&mut Self> {
        let ext = ext.into();
        if ext.is_empty() || ext.contains('.') {
            return Err(StorageError::Other(
                "import extension must be non-empty and without a leading dot",
            ));
        }
        self.import_extensions.push(ext);
        Ok(self)
    }

    pub fn import_paths(&self) -> &[std::path::PathBuf] {
        &self.import_paths
    }

    pub fn import_extensions(&self) -> &[String] {
        &self.import_extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_ordered() {
        for level in [UtilizationLevel::Low, UtilizationLevel::Medium, UtilizationLevel::High] {
            let t = level.thresholds(1_000_000);
            assert!(t.none < t.low);
            assert!(t.low < t.normal);
            assert!(t.normal < t.high);
            assert!(t.high < t.very_high);
        }
    }

    #[test]
    fn page_size_rejects_non_power_of_two() {
        let mut opts = StorageOptions::new();
        assert!(opts.page_size(5000).is_err());
        assert!(opts.page_size(8192).is_ok());
    }

    #[test]
    fn file_structure_block_size_rejects_larger_than_page() {
        let mut opts = StorageOptions::new();
        opts.page_size(4096).unwrap();
        assert!(opts.file_structure_block_size(8192).is_err());
        assert!(opts.file_structure_block_size(4096).is_ok());
    }

    #[test]
    fn header_block_count_bounds() {
        let mut opts = StorageOptions::new();
        assert!(opts.header_block_count(0).is_err());
        assert!(opts.header_block_count(11).is_err());
        assert!(opts.header_block_count(10).is_ok());
    }

    #[test]
    fn resolve_pool_size_respects_floor() {
        let mut opts = StorageOptions::new();
        opts.maximum_pool_size(Some(1));
        assert_eq!(opts.resolve_maximum_pool_size(), MINIMUM_POOL_FLOOR);
    }
}
