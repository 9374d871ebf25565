use crate::axis::AxisMap;
use crate::cache::{CacheStatsSnapshot, Initializer, IoPool, Tile, TileCache, WriteHandle};
use crate::codec::{Encoding, PixelCodec};
use crate::config::CacheOptions;
use crate::error::{Error, Result};
use crate::grid::{derive_tile_extent, TileGrid, TileKey};
use crate::store::{VolumeStore, AXIS_C};
use derive_more::Debug;
use log::info;
use std::sync::Arc;

/// One tile cache per resolution level of a store, all sharing one I/O pool.
///
/// Only level 0 is writable. Coarser levels are read-only views of whatever the store serves.
#[derive(Debug)]
pub struct ResolutionPyramid {
    encoding: Encoding,
    axis_map: AxisMap,
    codec: Arc<PixelCodec>,
    #[debug(skip)]
    store: Arc<dyn VolumeStore>,
    #[debug(skip)]
    pool: Arc<IoPool>,
    levels: Vec<TileCache>,
    scales: Vec<Vec<f64>>,
}

impl ResolutionPyramid {
    pub fn open(
        store: Arc<dyn VolumeStore>,
        encoding: Encoding,
        options: &CacheOptions,
        initializer: Option<Initializer>,
    ) -> Result<Self> {
        let external = store.pyramid_extents(0);
        let axis_map = encoding.axis_map(&external, &encoding.internal_dims(&external))?;
        let codec = Arc::new(PixelCodec::new(
            encoding,
            axis_map.clone(),
            store.sample_kind(),
            external[AXIS_C],
        ));
        let pool = Arc::new(IoPool::new(options.num_io_threads, options.max_io_queue_size)?);

        let num_levels = store.pyramid_level_count().max(1);
        let mut levels = Vec::with_capacity(num_levels);
        for l in 0..num_levels {
            let grid = build_grid(&*store, &axis_map, &codec, l, options)?;
            levels.push(TileCache::new(
                l,
                grid,
                codec.clone(),
                store.clone(),
                pool.clone(),
                num_levels - l - 1,
                options,
                if l == 0 { initializer.clone() } else { None },
                l == 0,
            ));
        }
        let dims: Vec<&[u64]> = levels.iter().map(|c| c.grid().dims()).collect();
        let scales = derive_scales(&dims);

        info!(
            "opened {:?} pyramid with {} levels, level 0 {:?} in tiles of {:?}, {} i/o threads",
            encoding,
            num_levels,
            levels[0].grid().dims(),
            levels[0].grid().tile_extent(),
            options.num_io_threads
        );
        Ok(ResolutionPyramid {
            encoding,
            axis_map,
            codec,
            store,
            pool,
            levels,
            scales,
        })
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }
    pub fn axis_map(&self) -> &AxisMap {
        &self.axis_map
    }
    pub fn codec(&self) -> &PixelCodec {
        &self.codec
    }
    pub fn store(&self) -> &Arc<dyn VolumeStore> {
        &self.store
    }
    pub fn pool(&self) -> &Arc<IoPool> {
        &self.pool
    }
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> Result<&TileCache> {
        self.levels.get(level).ok_or_else(|| {
            Error::InvalidGeometry(format!("no pyramid level {} of {}", level, self.levels.len()))
        })
    }
    pub fn levels(&self) -> &[TileCache] {
        &self.levels
    }

    /// Per internal axis, the size of one voxel of `level` in level-0 voxels.
    pub fn scale(&self, level: usize) -> &[f64] {
        &self.scales[level]
    }

    pub fn tile_bounds(&self, level: usize, index: u64) -> Result<(Vec<u64>, Vec<usize>)> {
        let grid = self.level(level)?.grid();
        if index >= grid.num_tiles() {
            return Err(Error::InvalidGeometry(format!(
                "tile {} outside of the {} tiles of level {}",
                index,
                grid.num_tiles(),
                level
            )));
        }
        Ok(grid.tile_bounds(index))
    }

    pub fn get(&self, key: TileKey) -> Result<Arc<Tile>> {
        self.level(key.level)?.get(key.index)
    }

    pub fn persist_all(&self) -> Result<Vec<WriteHandle>> {
        self.levels[0].persist_all()
    }
    pub fn persist_all_and_wait(&self) -> Result<()> {
        self.levels[0].persist_all_and_wait()
    }

    pub fn stats(&self) -> Vec<CacheStatsSnapshot> {
        self.levels.iter().map(|c| c.stats()).collect()
    }

    /// Writes back every tile that needs it, waits for the writes and shuts the I/O pool down.
    pub fn close(&self) -> Result<()> {
        if self.pool.is_shut_down() {
            return Ok(());
        }
        let persisted = self.persist_all_and_wait();
        for cache in &self.levels {
            info!("level {} closed: {:?}", cache.level(), cache.stats());
        }
        self.pool.shutdown();
        persisted
    }
}

fn build_grid(
    store: &dyn VolumeStore,
    axis_map: &AxisMap,
    codec: &PixelCodec,
    level: usize,
    options: &CacheOptions,
) -> Result<TileGrid> {
    let dims = axis_map.internal_dims_for(&store.pyramid_extents(level));
    let extent = derive_tile_extent(
        &dims,
        &store.pyramid_block_size(level),
        axis_map,
        options.tile_extent_override.as_deref(),
        codec.internal_kind(),
        1,
    )?;
    TileGrid::new(dims, extent)
}

/// `scale[l][d]` doubles the previous level's factor along `d` exactly when the extent halves.
pub fn derive_scales(dims: &[&[u64]]) -> Vec<Vec<f64>> {
    let mut scales: Vec<Vec<f64>> = Vec::with_capacity(dims.len());
    for (l, level) in dims.iter().enumerate() {
        let scale = match l {
            0 => vec![1.0; level.len()],
            _ => scales[l - 1]
                .iter()
                .zip(dims[l - 1].iter().zip(level.iter()))
                .map(|(&s, (&prev, &cur))| if prev == 2 * cur { s * 2.0 } else { s })
                .collect(),
        };
        scales.push(scale);
    }
    scales
}
