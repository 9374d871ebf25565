use crate::axis::AxisMap;
use crate::error::{Error, Result};
use crate::store::{ExternalDims, SampleKind};
use itertools::Itertools;
use std::fmt;

/// Largest tile buffer, in bytes, a single tile may address.
pub const MAX_TILE_BYTES: u64 = i32::MAX as u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub level: usize,
    pub index: u64,
}
impl TileKey {
    pub fn new(level: usize, index: u64) -> Self {
        TileKey { level, index }
    }
}
impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}/{}", self.level, self.index)
    }
}

/// Partition of an internal image into equally sized tiles; the last tile along an axis may be
/// smaller. Tiles are numbered with axis 0 varying fastest, the same order as samples inside a tile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileGrid {
    dims: Vec<u64>,
    tile_extent: Vec<usize>,
    grid_dims: Vec<u64>,
}

impl TileGrid {
    pub fn new(dims: Vec<u64>, tile_extent: Vec<usize>) -> Result<Self> {
        if dims.len() != tile_extent.len() {
            return Err(Error::InvalidGeometry(format!(
                "tile extent {:?} does not match image dimensions {:?}",
                tile_extent, dims
            )));
        }
        if tile_extent.iter().any(|&e| e == 0) || dims.iter().any(|&d| d == 0) {
            return Err(Error::InvalidGeometry(format!(
                "empty tiles or images are not supported: {:?} / {:?}",
                dims, tile_extent
            )));
        }
        let grid_dims = dims
            .iter()
            .zip(tile_extent.iter())
            .map(|(&d, &e)| d.div_ceil(e as u64))
            .collect();
        Ok(TileGrid {
            dims,
            tile_extent,
            grid_dims,
        })
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }
    pub fn tile_extent(&self) -> &[usize] {
        &self.tile_extent
    }
    /// Number of tiles along each axis.
    pub fn grid_dims(&self) -> &[u64] {
        &self.grid_dims
    }
    pub fn num_axes(&self) -> usize {
        self.dims.len()
    }
    pub fn num_tiles(&self) -> u64 {
        self.grid_dims.iter().product()
    }

    pub fn tile_grid_position(&self, index: u64) -> Vec<u64> {
        let mut rest = index;
        self.grid_dims
            .iter()
            .map(|&g| {
                let p = rest % g;
                rest /= g;
                p
            })
            .collect()
    }

    /// Origin and extent of the tile with the given linear index.
    pub fn tile_bounds(&self, index: u64) -> (Vec<u64>, Vec<usize>) {
        let pos = self.tile_grid_position(index);
        let min: Vec<u64> = pos
            .iter()
            .zip(self.tile_extent.iter())
            .map(|(&p, &e)| p * e as u64)
            .collect();
        let extent = min
            .iter()
            .enumerate()
            .map(|(d, &m)| (self.dims[d] - m).min(self.tile_extent[d] as u64) as usize)
            .collect();
        (min, extent)
    }

    /// Linear index of the tile containing the sample at `pos`.
    pub fn tile_index_of(&self, pos: &[u64]) -> u64 {
        pos.iter()
            .zip(self.tile_extent.iter())
            .zip(self.grid_dims.iter())
            .rev()
            .fold(0, |acc, ((&p, &e), &g)| acc * g + p / e as u64)
    }

    /// Linear indices of all tiles overlapping the region `[min, min + extent)`.
    pub fn tiles_intersecting(&self, min: &[u64], extent: &[usize]) -> Vec<u64> {
        if extent.iter().any(|&e| e == 0) {
            return vec![];
        }
        (0..self.num_axes())
            .map(|d| {
                let first = min[d] / self.tile_extent[d] as u64;
                let last = (min[d] + extent[d] as u64 - 1).min(self.dims[d] - 1) / self.tile_extent[d] as u64;
                first..=last
            })
            .multi_cartesian_product()
            .map(|pos| self.linear_index(&pos))
            .sorted()
            .collect()
    }

    fn linear_index(&self, grid_pos: &[u64]) -> u64 {
        grid_pos
            .iter()
            .zip(self.grid_dims.iter())
            .rev()
            .fold(0, |acc, (&p, &g)| acc * g + p)
    }
}

/// Chooses the tile extent of an internal image.
///
/// Without an override, mapped axes use the store's native block size and all other axes extent 1.
/// An override is replicated (its last entry) or truncated to the internal dimensionality; axes with
/// no external counterpart are forced to 1. The probability channel axis always spans all channels.
pub fn derive_tile_extent(
    dims: &[u64],
    store_block_size: &ExternalDims,
    axis_map: &AxisMap,
    tile_extent_override: Option<&[usize]>,
    kind: SampleKind,
    entities_per_sample: usize,
) -> Result<Vec<usize>> {
    if tile_extent_override.is_some_and(|o| o.is_empty()) {
        return Err(Error::InvalidGeometry("tile extent override is empty".to_string()));
    }
    let extent: Vec<usize> = (0..dims.len())
        .map(|d| {
            let full = dims[d].min(usize::MAX as u64) as usize;
            if axis_map.probability_channel_axis() == Some(d) {
                return full;
            }
            let Some(e) = axis_map.external_axis(d) else {
                return 1;
            };
            let wanted = match tile_extent_override {
                Some(o) => o[d.min(o.len() - 1)],
                None => store_block_size[e],
            };
            wanted.clamp(1, full.max(1))
        })
        .collect();

    let bytes = extent
        .iter()
        .try_fold(kind.bytes_per_sample() as u64 * entities_per_sample as u64, |acc, &e| {
            acc.checked_mul(e as u64)
        });
    match bytes {
        Some(b) if b <= MAX_TILE_BYTES => Ok(extent),
        _ => Err(Error::InvalidGeometry(format!(
            "tiles of extent {:?} ({:?}, {} entities per sample) exceed {} bytes",
            extent, kind, entities_per_sample, MAX_TILE_BYTES
        ))),
    }
}
