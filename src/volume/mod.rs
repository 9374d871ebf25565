mod cached;
mod interpolated;
mod source;
mod transform;

pub use cached::CachedVolume;
pub use interpolated::{trilinear, TrilinearInterpolatedVolume};
pub use source::{PyramidSource, SourceView};
pub use transform::AffineTransform;

/// Read access to a volume in XYZ voxel coordinates.
pub trait VoxelVolume {
    /// The value of the voxel nearest to `xyz`.
    fn get(&self, xyz: [f64; 3]) -> f64;

    fn get_interpolated(&self, xyz: [f64; 3]) -> f64 {
        trilinear(self, xyz)
    }
}
