use super::VoxelVolume;
use libm::modf;

/// Trilinear interpolation over the eight voxels around `xyz`.
pub fn trilinear<V: VoxelVolume + ?Sized>(base: &V, xyz: [f64; 3]) -> f64 {
    let (dx, x0) = modf(xyz[0]);
    let x1 = x0 + 1.0;
    let (dy, y0) = modf(xyz[1]);
    let y1 = y0 + 1.0;
    let (dz, z0) = modf(xyz[2]);
    let z1 = z0 + 1.0;

    let c00 = base.get([x0, y0, z0]) * (1.0 - dx) + base.get([x1, y0, z0]) * dx;
    let c10 = base.get([x0, y1, z0]) * (1.0 - dx) + base.get([x1, y1, z0]) * dx;
    let c01 = base.get([x0, y0, z1]) * (1.0 - dx) + base.get([x1, y0, z1]) * dx;
    let c11 = base.get([x0, y1, z1]) * (1.0 - dx) + base.get([x1, y1, z1]) * dx;

    let c0 = c00 * (1.0 - dy) + c10 * dy;
    let c1 = c01 * (1.0 - dy) + c11 * dy;

    c0 * (1.0 - dz) + c1 * dz
}

/// Wraps a volume so that plain `get` interpolates.
pub struct TrilinearInterpolatedVolume<V> {
    pub base: V,
}

impl<V: VoxelVolume> VoxelVolume for TrilinearInterpolatedVolume<V> {
    fn get(&self, xyz: [f64; 3]) -> f64 {
        trilinear(&self.base, xyz)
    }
}
