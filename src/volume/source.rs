use super::{AffineTransform, VoxelVolume};
use crate::cache::TileCache;
use crate::codec::Encoding;
use crate::error::{Error, Result};
use crate::pyramid::ResolutionPyramid;
use crate::store::{AXIS_C, AXIS_T, AXIS_X, AXIS_Y, AXIS_Z};
use log::warn;
use std::sync::Arc;

/// Multi-resolution read views of one channel of a pyramid, as consumed by a viewer.
#[derive(Clone, Debug)]
pub struct PyramidSource {
    pyramid: Arc<ResolutionPyramid>,
    channel: u64,
}

impl PyramidSource {
    /// `channel` indexes the store channels for direct images and the internal channels (0 being the
    /// background) for probability images. Label images have a single channel.
    pub fn new(pyramid: Arc<ResolutionPyramid>, channel: usize) -> Result<Self> {
        let channels = match pyramid.encoding() {
            Encoding::Label => 1,
            Encoding::Direct => pyramid.store().pyramid_extents(0)[AXIS_C],
            Encoding::Probability => pyramid.codec().channels() + 1,
        };
        if channel >= channels {
            return Err(Error::InvalidGeometry(format!(
                "channel {} of an image with {} channels",
                channel, channels
            )));
        }
        Ok(PyramidSource {
            pyramid,
            channel: channel as u64,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.pyramid.num_levels()
    }
    pub fn num_timepoints(&self) -> usize {
        self.pyramid.store().pyramid_extents(0)[AXIS_T]
    }

    fn check(&self, timepoint: usize, level: usize) -> Result<()> {
        if timepoint >= self.num_timepoints() || level >= self.num_levels() {
            return Err(Error::InvalidGeometry(format!(
                "no time point {} at level {} ({} time points, {} levels)",
                timepoint,
                level,
                self.num_timepoints(),
                self.num_levels()
            )));
        }
        Ok(())
    }

    /// Read view of `level` at `timepoint`. Missing tiles fall back to coarser resident levels.
    pub fn source(&self, timepoint: usize, level: usize) -> Result<SourceView> {
        self.check(timepoint, level)?;
        let map = self.pyramid.axis_map();
        let mut fixed = vec![];
        if let Some(t) = map.internal_axis(AXIS_T) {
            fixed.push((t, timepoint as u64));
        }
        let channel_axis = match self.pyramid.encoding() {
            Encoding::Probability => map.probability_channel_axis(),
            Encoding::Direct => map.internal_axis(AXIS_C),
            Encoding::Label => None,
        };
        if let Some(c) = channel_axis {
            fixed.push((c, self.channel));
        }
        let levels = (level..self.num_levels())
            .map(|l| (self.pyramid.levels()[l].clone(), self.spatial_scale(l)))
            .collect();
        Ok(SourceView {
            spatial: [AXIS_X, AXIS_Y, AXIS_Z].map(|a| map.internal_axis(a)),
            fixed,
            levels,
        })
    }

    /// Maps voxels of `level` onto level-0 voxels.
    pub fn source_transform(&self, timepoint: usize, level: usize) -> Result<AffineTransform> {
        self.check(timepoint, level)?;
        Ok(AffineTransform::for_level_scale(self.spatial_scale(level)))
    }

    fn spatial_scale(&self, level: usize) -> [f64; 3] {
        let scale = self.pyramid.scale(level);
        [AXIS_X, AXIS_Y, AXIS_Z].map(|a| match self.pyramid.axis_map().internal_axis(a) {
            Some(d) => scale[d],
            None => 1.0,
        })
    }
}

/// One level of a [`PyramidSource`] at a fixed time point and channel, addressed in XYZ voxels of
/// that level.
#[derive(Clone, Debug)]
pub struct SourceView {
    spatial: [Option<usize>; 3],
    fixed: Vec<(usize, u64)>,
    /// the requested level first, then every coarser one with its spatial scale
    levels: Vec<(TileCache, [f64; 3])>,
}

impl SourceView {
    pub fn level(&self) -> usize {
        self.levels[0].0.level()
    }

    /// Internal position of the voxel nearest to `xyz` in `cache`'s level, if inside the image.
    fn position(&self, cache: &TileCache, xyz: [f64; 3]) -> Option<Vec<u64>> {
        let dims = cache.grid().dims();
        let mut pos = vec![0u64; dims.len()];
        for (axis, &coord) in self.spatial.iter().zip(xyz.iter()) {
            let rounded = coord.round();
            match axis {
                Some(d) if rounded >= 0.0 && (rounded as u64) < dims[*d] => pos[*d] = rounded as u64,
                Some(_) => return None,
                None if rounded == 0.0 => {}
                None => return None,
            }
        }
        for &(d, v) in &self.fixed {
            pos[d] = v;
        }
        Some(pos)
    }

    /// The value at `xyz`, loading the tile if needed.
    pub fn try_get(&self, xyz: [f64; 3]) -> Result<f64> {
        let cache = &self.levels[0].0;
        let Some(pos) = self.position(cache, xyz) else {
            return Ok(0.0);
        };
        let tile = cache.get(cache.grid().tile_index_of(&pos))?;
        Ok(tile.get(&pos))
    }

    /// The value at `xyz` without blocking: a tile that is not resident is queued for loading and the
    /// value is taken from the next coarser level that has its tile resident, or 0 if none has.
    pub fn get_volatile(&self, xyz: [f64; 3]) -> f64 {
        let (requested, own_scale) = &self.levels[0];
        let Some(pos) = self.position(requested, xyz) else {
            return 0.0;
        };
        let index = requested.grid().tile_index_of(&pos);
        if let Some(tile) = requested.get_if_present(index) {
            return tile.get(&pos);
        }
        if let Err(e) = requested.prefetch(index) {
            warn!("could not schedule tile {} of level {}: {}", index, requested.level(), e);
        }

        // level-0 voxel coordinates, then down to each coarser level
        let full = [0, 1, 2].map(|i| own_scale[i] * xyz[i] + (own_scale[i] - 1.0) / 2.0);
        for (cache, scale) in &self.levels[1..] {
            let coarse = [0, 1, 2].map(|i| (full[i] - (scale[i] - 1.0) / 2.0) / scale[i]);
            let Some(pos) = self.position(cache, coarse) else {
                continue;
            };
            if let Some(tile) = cache.get_if_present(cache.grid().tile_index_of(&pos)) {
                return tile.get(&pos);
            }
        }
        0.0
    }
}

impl VoxelVolume for SourceView {
    fn get(&self, xyz: [f64; 3]) -> f64 {
        self.get_volatile(xyz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheBound, CacheOptions};
    use crate::store::{InMemoryStore, SampleKind};
    use approx::assert_relative_eq;

    fn pyramid(encoding: Encoding, dims: [usize; 5]) -> Arc<ResolutionPyramid> {
        let store = InMemoryStore::new(SampleKind::U16, dims, [4, 4, 2]);
        store.fill_with(|[x, y, z, c, t]| (x + 16 * y + 256 * z) as f64 + 1000.0 * c as f64 + 5000.0 * t as f64);
        Arc::new(ResolutionPyramid::open(Arc::new(store), encoding, &CacheOptions::default(), None).unwrap())
    }

    #[test]
    fn blocking_reads_select_channel_and_time_point() {
        let source = PyramidSource::new(pyramid(Encoding::Direct, [8, 8, 4, 2, 3]), 1).unwrap();
        assert_eq!(source.num_timepoints(), 3);
        let view = source.source(2, 0).unwrap();
        assert_eq!(view.try_get([3.0, 2.0, 1.0]).unwrap(), (3 + 32 + 256 + 1000 + 10000) as f64);
        assert_eq!(view.try_get([3.2, 1.6, 0.9]).unwrap(), (3 + 32 + 256 + 1000 + 10000) as f64);
        assert_eq!(view.try_get([8.0, 0.0, 0.0]).unwrap(), 0.0);
        assert!(PyramidSource::new(source.pyramid.clone(), 2).is_err());
        assert!(source.source(3, 0).is_err());
    }

    #[test]
    fn volatile_reads_fall_back_to_coarser_levels() {
        let pyramid = pyramid(Encoding::Direct, [16, 16, 2, 1, 1]);
        let source = PyramidSource::new(pyramid.clone(), 0).unwrap();
        let fine = source.source(0, 0).unwrap();
        let coarse = source.source(0, 1).unwrap();

        assert_eq!(fine.get([5.0, 6.0, 1.0]), 0.0);
        coarse.try_get([2.0, 3.0, 0.0]).unwrap();
        pyramid.pool().wait_idle();

        // the fine tile was prefetched by the first read
        assert_eq!(fine.get([5.0, 6.0, 1.0]), (5 + 16 * 6 + 256) as f64);
        // neither this fine tile nor a coarser one covering it is resident yet
        assert_eq!(fine.get([10.0, 13.0, 1.0]), 0.0);
        pyramid.pool().wait_idle();
        assert_eq!(fine.get([10.0, 13.0, 1.0]), (10 + 16 * 13 + 256) as f64);
    }

    #[test]
    fn volatile_reads_stay_within_the_cache_bound() {
        let store = InMemoryStore::new(SampleKind::U16, [16, 16, 2, 1, 1], [4, 4, 2]);
        store.fill_with(|[x, y, z, ..]| (x + 16 * y + 256 * z) as f64);
        let options = CacheOptions {
            cache_bound: CacheBound::MaxTiles(2),
            ..Default::default()
        };
        let pyramid = Arc::new(ResolutionPyramid::open(Arc::new(store), Encoding::Direct, &options, None).unwrap());
        let fine = PyramidSource::new(pyramid.clone(), 0).unwrap().source(0, 0).unwrap();
        assert_eq!(pyramid.levels()[0].grid().num_tiles(), 16);

        for y in 0..16 {
            for x in 0..16 {
                fine.get([x as f64, y as f64, 0.0]);
                pyramid.pool().wait_idle();
                assert!(pyramid.levels()[0].resident_tiles() <= 2);
            }
        }
        assert_eq!(fine.get([15.0, 15.0, 0.0]), (15 + 16 * 15) as f64);
        // every row of voxels crosses four tiles, of which only two stay resident
        assert_eq!(pyramid.levels()[0].stats().evictions, 62);
    }

    #[test]
    fn coarse_values_stand_in_for_missing_fine_tiles() {
        let pyramid = pyramid(Encoding::Direct, [16, 16, 2, 1, 1]);
        let source = PyramidSource::new(pyramid.clone(), 0).unwrap();
        let coarse = source.source(0, 1).unwrap();
        coarse.try_get([5.0, 6.0, 0.0]).unwrap();
        pyramid.pool().shutdown();

        let fine = source.source(0, 0).unwrap();
        assert_eq!(fine.get([10.0, 12.0, 0.0]), (10 + 16 * 12) as f64);
        assert_eq!(fine.get([11.0, 13.0, 1.0]), (10 + 16 * 12 + 256) as f64);
    }

    #[test]
    fn transforms_scale_levels_to_full_resolution() {
        let source = PyramidSource::new(pyramid(Encoding::Direct, [16, 16, 8, 1, 1]), 0).unwrap();
        assert_eq!(source.num_levels(), 3);
        let t = source.source_transform(0, 2).unwrap();
        assert_eq!(t.matrix[0], [4.0, 0.0, 0.0, 1.5]);
        assert_eq!(t.matrix[2], [0.0, 0.0, 4.0, 1.5]);
        assert_eq!(source.source_transform(0, 0).unwrap(), AffineTransform::identity());
    }

    #[test]
    fn probability_sources_include_the_background() {
        let store = InMemoryStore::new(SampleKind::F32, [4, 4, 1, 2, 1], [4, 4, 1]);
        store.fill_with(|[x, _, _, c, _]| if c == 0 { 0.25 } else { 0.125 * x as f64 });
        let pyramid = Arc::new(
            ResolutionPyramid::open(Arc::new(store), Encoding::Probability, &CacheOptions::default(), None).unwrap(),
        );
        let background = PyramidSource::new(pyramid.clone(), 0).unwrap().source(0, 0).unwrap();
        let second = PyramidSource::new(pyramid.clone(), 2).unwrap().source(0, 0).unwrap();
        assert_relative_eq!(background.try_get([2.0, 1.0, 0.0]).unwrap(), 0.5);
        assert_relative_eq!(second.try_get([2.0, 1.0, 0.0]).unwrap(), 0.25);
        assert_relative_eq!(second.get_interpolated([1.5, 1.0, 0.0]), 0.1875);
        assert!(PyramidSource::new(pyramid, 3).is_err());
    }
}
