use crate::cache::{Initializer, TileCache, WriteHandle};
use crate::codec::{check_len, Encoding};
use crate::config::CacheOptions;
use crate::error::{Error, Result};
use crate::grid::TileGrid;
use crate::pyramid::ResolutionPyramid;
use crate::store::{SampleBuffer, VolumeStore};
use itertools::Itertools;
use std::sync::Arc;

/// Full-resolution, writable view of a store, backed by the level-0 tile cache of a pyramid.
#[derive(Debug)]
pub struct CachedVolume {
    pyramid: Arc<ResolutionPyramid>,
}

impl CachedVolume {
    pub fn open(
        store: Arc<dyn VolumeStore>,
        encoding: Encoding,
        options: &CacheOptions,
        initializer: Option<Initializer>,
    ) -> Result<Self> {
        let pyramid = ResolutionPyramid::open(store, encoding, options, initializer)?;
        Ok(CachedVolume {
            pyramid: Arc::new(pyramid),
        })
    }

    pub fn pyramid(&self) -> &Arc<ResolutionPyramid> {
        &self.pyramid
    }
    pub fn cache(&self) -> &TileCache {
        &self.pyramid.levels()[0]
    }
    pub fn tile_grid(&self) -> &TileGrid {
        self.cache().grid()
    }
    pub fn dimensions(&self) -> &[u64] {
        self.tile_grid().dims()
    }

    fn check_region(&self, min: &[u64], extent: &[usize]) -> Result<()> {
        let dims = self.dimensions();
        let fits = min.len() == dims.len()
            && extent.len() == dims.len()
            && (0..dims.len()).all(|d| min[d] + extent[d] as u64 <= dims[d]);
        if !fits {
            return Err(Error::InvalidGeometry(format!(
                "region {:?}+{:?} outside of image {:?}",
                min, extent, dims
            )));
        }
        Ok(())
    }

    pub fn get(&self, pos: &[u64]) -> Result<f64> {
        self.check_region(pos, &vec![1; pos.len()])?;
        let tile = self.cache().get(self.tile_grid().tile_index_of(pos))?;
        Ok(tile.get(pos))
    }

    /// Sets one sample, rounding and clamping to the internal sample kind; the tile becomes dirty.
    pub fn set(&self, pos: &[u64], value: f64) -> Result<()> {
        self.check_region(pos, &vec![1; pos.len()])?;
        let tile = self.cache().get(self.tile_grid().tile_index_of(pos))?;
        tile.set(pos, value);
        Ok(())
    }

    /// Copies the samples of `[min, min + extent)` out of all tiles it touches.
    pub fn read_region(&self, min: &[u64], extent: &[usize]) -> Result<SampleBuffer> {
        self.check_region(min, extent)?;
        let kind = self.pyramid.codec().internal_kind();
        let mut out = SampleBuffer::zeros(kind, extent.iter().product());
        for index in self.tile_grid().tiles_intersecting(min, extent) {
            let tile = self.cache().get(index)?;
            let data = tile.data();
            for (pos, len) in rows_of_overlap(min, extent, tile.min(), tile.extent()) {
                out.copy_from(region_index(min, extent, &pos), &data, tile.local_index(&pos), len)?;
            }
        }
        Ok(out)
    }

    /// Copies `data` into `[min, min + extent)`, marking every touched tile dirty.
    pub fn write_region(&self, min: &[u64], extent: &[usize], data: &SampleBuffer) -> Result<()> {
        self.check_region(min, extent)?;
        check_len(data, extent)?;
        let kind = self.pyramid.codec().internal_kind();
        if data.kind() != kind {
            return Err(Error::InvalidGeometry(format!(
                "cannot write {:?} samples into a {:?} image",
                data.kind(),
                kind
            )));
        }
        for index in self.tile_grid().tiles_intersecting(min, extent) {
            let tile = self.cache().get(index)?;
            let rows = rows_of_overlap(min, extent, tile.min(), tile.extent());
            tile.update(|buffer| {
                rows.iter().try_for_each(|(pos, len)| {
                    buffer.copy_from(tile.local_index(pos), data, region_index(min, extent, pos), *len)
                })
            })?;
        }
        Ok(())
    }

    pub fn persist_all(&self) -> Result<Vec<WriteHandle>> {
        self.pyramid.persist_all()
    }
    pub fn persist_all_and_wait(&self) -> Result<()> {
        self.pyramid.persist_all_and_wait()
    }
    pub fn close(&self) -> Result<()> {
        self.pyramid.close()
    }
}

/// Start positions and lengths of the axis-0 runs shared by a region and a tile.
fn rows_of_overlap(min: &[u64], extent: &[usize], tile_min: &[u64], tile_extent: &[usize]) -> Vec<(Vec<u64>, usize)> {
    let ranges: Vec<_> = (0..min.len())
        .map(|d| {
            let lo = min[d].max(tile_min[d]);
            let hi = (min[d] + extent[d] as u64).min(tile_min[d] + tile_extent[d] as u64);
            lo..hi.max(lo)
        })
        .collect();
    let row_len = (ranges[0].end - ranges[0].start) as usize;
    if row_len == 0 {
        return vec![];
    }
    let first = ranges[0].start;
    ranges[1..]
        .iter()
        .cloned()
        .multi_cartesian_product()
        .map(|rest| {
            let mut pos = Vec::with_capacity(min.len());
            pos.push(first);
            pos.extend(rest);
            (pos, row_len)
        })
        .collect()
}

fn region_index(min: &[u64], extent: &[usize], pos: &[u64]) -> usize {
    pos.iter()
        .zip(min.iter())
        .zip(extent.iter())
        .rev()
        .fold(0, |acc, ((&p, &m), &e)| acc * e + (p - m) as usize)
}
