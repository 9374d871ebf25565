use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheBound {
    /// Tiles stay resident until the cache is closed.
    #[default]
    Unbounded,
    /// At most this many tiles stay resident; the least recently used one is evicted first.
    MaxTiles(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub num_io_threads: usize,
    pub max_io_queue_size: usize,
    /// Per-axis tile extent; the last entry is repeated for missing axes, extra entries are ignored.
    pub tile_extent_override: Option<Vec<usize>>,
    pub dirty_accesses: bool,
    pub initialize_as_dirty: bool,
    pub persist_on_load: bool,
    pub cache_bound: CacheBound,
}
impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            num_io_threads: 1,
            max_io_queue_size: 10,
            tile_extent_override: None,
            dirty_accesses: true,
            initialize_as_dirty: false,
            persist_on_load: false,
            cache_bound: CacheBound::Unbounded,
        }
    }
}
impl CacheOptions {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let options: CacheOptions = serde_json::from_str(json).context("Failed to parse cache options")?;
        options.validated()
    }
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json)
    }

    fn validated(self) -> Result<Self, Error> {
        anyhow::ensure!(self.num_io_threads > 0, "num_io_threads must be at least 1");
        anyhow::ensure!(self.max_io_queue_size > 0, "max_io_queue_size must be at least 1");
        if let CacheBound::MaxTiles(n) = self.cache_bound {
            anyhow::ensure!(n > 0, "cache_bound must allow at least one tile");
        }
        Ok(self)
    }
}
