mod memory;

pub use memory::InMemoryStore;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;
pub const AXIS_Z: usize = 2;
pub const AXIS_C: usize = 3;
pub const AXIS_T: usize = 4;

/// Extent of the store along its five fixed axes, in X, Y, Z, C, T order.
pub type ExternalDims = [usize; 5];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    U8,
    U16,
    F32,
}
impl SampleKind {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleKind::U8 => 1,
            SampleKind::U16 => 2,
            SampleKind::F32 => 4,
        }
    }
    /// Largest representable value, used to map integer samples onto `[0, 1]`.
    pub fn max_value(&self) -> f64 {
        match self {
            SampleKind::U8 => u8::MAX as f64,
            SampleKind::U16 => u16::MAX as f64,
            SampleKind::F32 => 1.0,
        }
    }
    pub fn is_float(&self) -> bool {
        matches!(self, SampleKind::F32)
    }
}

/// A flat buffer of samples of one primitive kind.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}
impl SampleBuffer {
    pub fn zeros(kind: SampleKind, len: usize) -> Self {
        match kind {
            SampleKind::U8 => SampleBuffer::U8(vec![0; len]),
            SampleKind::U16 => SampleBuffer::U16(vec![0; len]),
            SampleKind::F32 => SampleBuffer::F32(vec![0.0; len]),
        }
    }
    pub fn kind(&self) -> SampleKind {
        match self {
            SampleBuffer::U8(_) => SampleKind::U8,
            SampleBuffer::U16(_) => SampleKind::U16,
            SampleBuffer::F32(_) => SampleKind::F32,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::U8(v) => v.len(),
            SampleBuffer::U16(v) => v.len(),
            SampleBuffer::F32(v) => v.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn slice(&self, offset: usize, len: usize) -> SampleBuffer {
        match self {
            SampleBuffer::U8(v) => SampleBuffer::U8(v[offset..offset + len].to_vec()),
            SampleBuffer::U16(v) => SampleBuffer::U16(v[offset..offset + len].to_vec()),
            SampleBuffer::F32(v) => SampleBuffer::F32(v[offset..offset + len].to_vec()),
        }
    }
    pub fn get_f64(&self, index: usize) -> f64 {
        match self {
            SampleBuffer::U8(v) => v[index] as f64,
            SampleBuffer::U16(v) => v[index] as f64,
            SampleBuffer::F32(v) => v[index] as f64,
        }
    }
    /// Stores `value`, saturating to the range of integer kinds.
    pub fn set_f64(&mut self, index: usize, value: f64) {
        match self {
            SampleBuffer::U8(v) => v[index] = value.round().clamp(0.0, u8::MAX as f64) as u8,
            SampleBuffer::U16(v) => v[index] = value.round().clamp(0.0, u16::MAX as f64) as u16,
            SampleBuffer::F32(v) => v[index] = value as f32,
        }
    }
    pub fn is_nonzero(&self, index: usize) -> bool {
        match self {
            SampleBuffer::U8(v) => v[index] != 0,
            SampleBuffer::U16(v) => v[index] != 0,
            SampleBuffer::F32(v) => v[index] != 0.0,
        }
    }
    /// Copies `len` samples from `src[src_offset..]` to `self[dst_offset..]`; kinds must agree.
    pub fn copy_from(&mut self, dst_offset: usize, src: &SampleBuffer, src_offset: usize, len: usize) -> Result<()> {
        match (self, src) {
            (SampleBuffer::U8(d), SampleBuffer::U8(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len])
            }
            (SampleBuffer::U16(d), SampleBuffer::U16(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len])
            }
            (SampleBuffer::F32(d), SampleBuffer::F32(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len])
            }
            (d, s) => {
                return Err(Error::InvalidGeometry(format!(
                    "cannot copy {:?} samples into a {:?} buffer",
                    s.kind(),
                    d.kind()
                )))
            }
        }
        Ok(())
    }
}

/// The remote five-axis volumetric store.
///
/// Sub-volume calls always address a single channel and time point: `origin` is `[x, y, z, c, t]`
/// and `size` is `[sx, sy, sz]`. Buffers are flat with X varying fastest.
pub trait VolumeStore: Send + Sync {
    fn sample_kind(&self) -> SampleKind;
    fn extent(&self, axis: usize) -> usize;
    fn pyramid_level_count(&self) -> usize;
    fn pyramid_extents(&self, level: usize) -> ExternalDims;
    fn pyramid_block_size(&self, level: usize) -> ExternalDims;
    fn read_sub_volume(&self, origin: [usize; 5], level: usize, size: [usize; 3]) -> Result<SampleBuffer>;
    fn write_sub_volume(&self, buffer: &SampleBuffer, origin: [usize; 5], size: [usize; 3]) -> Result<()>;

    fn extents(&self) -> ExternalDims {
        [
            self.extent(AXIS_X),
            self.extent(AXIS_Y),
            self.extent(AXIS_Z),
            self.extent(AXIS_C),
            self.extent(AXIS_T),
        ]
    }
}
