use crate::error::{Error, Result};
use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    /// 3x4 affine transformation matrix in xyz coordinate order
    pub matrix: [[f64; 4]; 3],
}
impl AffineTransform {
    pub fn identity() -> Self {
        Self::scale_and_translate([1.0; 3], [0.0; 3])
    }

    pub fn scale_and_translate(scale: [f64; 3], offset: [f64; 3]) -> Self {
        let mut matrix = [[0.0; 4]; 3];
        for i in 0..3 {
            matrix[i][i] = scale[i];
            matrix[i][3] = offset[i];
        }
        AffineTransform { matrix }
    }

    /// Maps voxels of a pyramid level with per-axis `scale` onto full-resolution voxels, keeping
    /// voxel centers aligned.
    pub fn for_level_scale(scale: [f64; 3]) -> Self {
        Self::scale_and_translate(scale, scale.map(|s| (s - 1.0) / 2.0))
    }

    fn homogeneous(&self) -> Matrix4<f64> {
        let m = &self.matrix;
        Matrix4::new(
            m[0][0], m[0][1], m[0][2], m[0][3], //
            m[1][0], m[1][1], m[1][2], m[1][3], //
            m[2][0], m[2][1], m[2][2], m[2][3], //
            0.0, 0.0, 0.0, 1.0,
        )
    }

    pub fn apply(&self, xyz: [f64; 3]) -> [f64; 3] {
        let v = self.homogeneous() * Vector4::new(xyz[0], xyz[1], xyz[2], 1.0);
        [v[0], v[1], v[2]]
    }

    /// Invert this affine transformation matrix
    pub fn invert(&self) -> Result<Self> {
        let inv = self
            .homogeneous()
            .try_inverse()
            .ok_or_else(|| Error::InvalidGeometry(format!("transform {:?} is not invertible", self.matrix)))?;
        let mut matrix = [[0.0; 4]; 3];
        for (r, row) in matrix.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = inv[(r, c)];
            }
        }
        Ok(AffineTransform { matrix })
    }
}
