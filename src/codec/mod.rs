//! Conversion between the store's per-channel sub-volumes and internal tile buffers.
//!
//! The store only ever exchanges single Z-stacks of one channel at one time point. A tile that spans
//! several time points (or, for direct images, several channels) is assembled from several calls.
//! Within a tile buffer axis 0 varies fastest; since internal axes keep the external order, each
//! Z-stack lands in one contiguous run of the buffer.

mod direct;
mod label;
mod probability;

pub use direct::DirectCodec;
pub use label::{decode_labels, encode_label_channel, LabelCodec};
pub use probability::{decode_probabilities, encode_probability_channel, ProbabilityCodec};

use crate::axis::{self, AxisMap};
use crate::error::Result;
use crate::store::{ExternalDims, SampleBuffer, SampleKind, VolumeStore, AXIS_C, AXIS_T, AXIS_X, AXIS_Y, AXIS_Z};
use serde::{Deserialize, Serialize};

/// How samples of the store are interpreted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Samples are passed through unchanged.
    #[default]
    Direct,
    /// Each store channel is a binary mask of one label; internally one label per sample.
    Label,
    /// Each store channel holds one class probability; internally an extra background channel.
    Probability,
}
impl Encoding {
    /// The internal extents this encoding exposes for a store of the given extents.
    pub fn internal_dims(&self, external: &ExternalDims) -> Vec<u64> {
        match self {
            Encoding::Direct => axis::default_internal_dims(external),
            Encoding::Label => axis::label_internal_dims(external),
            Encoding::Probability => axis::probability_internal_dims(external),
        }
    }
    pub fn axis_map(&self, external: &ExternalDims, internal: &[u64]) -> Result<AxisMap> {
        match self {
            Encoding::Direct => AxisMap::build(external, internal),
            Encoding::Label => AxisMap::build_label(external, internal),
            Encoding::Probability => AxisMap::build_probability(external, internal),
        }
    }
}

/// Store coordinates covered by an internal region. Axes without an internal counterpart get
/// origin 0 and size 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExternalRegion {
    pub origin: [usize; 5],
    pub size: [usize; 5],
}
impl ExternalRegion {
    pub fn of(axis_map: &AxisMap, min: &[u64], extent: &[usize]) -> Self {
        let mut origin = [0; 5];
        let mut size = [1; 5];
        for (d, e) in axis_map.invert().into_iter().enumerate() {
            if let Some(e) = e {
                origin[e] = min[d] as usize;
                size[e] = extent[d];
            }
        }
        ExternalRegion { origin, size }
    }
    pub fn stack_size(&self) -> [usize; 3] {
        [self.size[AXIS_X], self.size[AXIS_Y], self.size[AXIS_Z]]
    }
    pub fn stack_len(&self) -> usize {
        self.size[AXIS_X] * self.size[AXIS_Y] * self.size[AXIS_Z]
    }
    /// Origin of the Z-stack for store channel `c` at the `t`-th time point of the region.
    pub fn stack_origin(&self, c: usize, t: usize) -> [usize; 5] {
        [
            self.origin[AXIS_X],
            self.origin[AXIS_Y],
            self.origin[AXIS_Z],
            c,
            self.origin[AXIS_T] + t,
        ]
    }
    pub fn time_points(&self) -> usize {
        self.size[AXIS_T]
    }
}

pub(crate) fn read_stack(
    store: &dyn VolumeStore,
    region: &ExternalRegion,
    c: usize,
    t: usize,
    level: usize,
) -> Result<SampleBuffer> {
    let stack = store.read_sub_volume(region.stack_origin(c, t), level, region.stack_size())?;
    if stack.len() != region.stack_len() {
        return Err(crate::error::Error::store_io(format!(
            "store returned {} samples for a sub-volume of {:?}",
            stack.len(),
            region.stack_size()
        )));
    }
    Ok(stack)
}

/// The three ways of translating between store samples and tile buffers, fixed per image.
#[derive(Clone, Debug)]
pub enum PixelCodec {
    Direct(DirectCodec),
    Label(LabelCodec),
    Probability(ProbabilityCodec),
}

impl PixelCodec {
    pub fn new(encoding: Encoding, axis_map: AxisMap, external_kind: SampleKind, channels: usize) -> Self {
        match encoding {
            Encoding::Direct => PixelCodec::Direct(DirectCodec::new(axis_map, external_kind)),
            Encoding::Label => PixelCodec::Label(LabelCodec::new(axis_map, external_kind, channels)),
            Encoding::Probability => {
                PixelCodec::Probability(ProbabilityCodec::new(axis_map, external_kind, channels))
            }
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            PixelCodec::Direct(_) => Encoding::Direct,
            PixelCodec::Label(_) => Encoding::Label,
            PixelCodec::Probability(_) => Encoding::Probability,
        }
    }

    pub fn axis_map(&self) -> &AxisMap {
        match self {
            PixelCodec::Direct(c) => &c.axis_map,
            PixelCodec::Label(c) => &c.axis_map,
            PixelCodec::Probability(c) => &c.axis_map,
        }
    }

    /// Sample kind of tile buffers produced by this codec.
    pub fn internal_kind(&self) -> SampleKind {
        match self {
            PixelCodec::Direct(c) => c.external_kind,
            PixelCodec::Label(c) => c.label_kind(),
            PixelCodec::Probability(_) => SampleKind::F32,
        }
    }

    /// Number of store channels behind one internal sample (1 for direct images).
    pub fn channels(&self) -> usize {
        match self {
            PixelCodec::Direct(_) => 1,
            PixelCodec::Label(c) => c.channels,
            PixelCodec::Probability(c) => c.channels,
        }
    }

    pub fn read(
        &self,
        store: &dyn VolumeStore,
        level: usize,
        min: &[u64],
        extent: &[usize],
    ) -> Result<SampleBuffer> {
        match self {
            PixelCodec::Direct(c) => c.read(store, level, min, extent),
            PixelCodec::Label(c) => c.read(store, level, min, extent),
            PixelCodec::Probability(c) => c.read(store, level, min, extent),
        }
    }

    pub fn write(&self, store: &dyn VolumeStore, buffer: &SampleBuffer, min: &[u64], extent: &[usize]) -> Result<()> {
        match self {
            PixelCodec::Direct(c) => c.write(store, buffer, min, extent),
            PixelCodec::Label(c) => c.write(store, buffer, min, extent),
            PixelCodec::Probability(c) => c.write(store, buffer, min, extent),
        }
    }
}

pub(crate) fn check_len(buffer: &SampleBuffer, extent: &[usize]) -> Result<()> {
    let expected: usize = extent.iter().product();
    if buffer.len() != expected {
        return Err(crate::error::Error::InvalidGeometry(format!(
            "tile buffer holds {} samples but extent {:?} needs {}",
            buffer.len(),
            extent,
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_of_a_tile() {
        let ext = [64, 32, 1, 3, 4];
        let internal = Encoding::Direct.internal_dims(&ext);
        let map = Encoding::Direct.axis_map(&ext, &internal).unwrap();
        let region = ExternalRegion::of(&map, &[16, 8, 1, 2], &[16, 8, 2, 1]);
        assert_eq!(region.origin, [16, 8, 0, 1, 2]);
        assert_eq!(region.size, [16, 8, 1, 2, 1]);
        assert_eq!(region.stack_origin(2, 0), [16, 8, 0, 2, 2]);
        assert_eq!(region.stack_len(), 128);
    }

    #[test]
    fn codec_kinds() {
        let ext = [8, 8, 1, 3, 1];
        let label_map = Encoding::Label.axis_map(&ext, &Encoding::Label.internal_dims(&ext)).unwrap();
        let codec = PixelCodec::new(Encoding::Label, label_map, SampleKind::F32, 3);
        assert_eq!(codec.internal_kind(), SampleKind::U8);
        assert_eq!(codec.encoding(), Encoding::Label);

        let prob_map = Encoding::Probability
            .axis_map(&ext, &Encoding::Probability.internal_dims(&ext))
            .unwrap();
        let codec = PixelCodec::new(Encoding::Probability, prob_map, SampleKind::U16, 3);
        assert_eq!(codec.internal_kind(), SampleKind::F32);
        assert_eq!(codec.channels(), 3);
    }
}
