use super::{check_len, read_stack, ExternalRegion};
use crate::axis::AxisMap;
use crate::error::Result;
use crate::store::{SampleBuffer, SampleKind, VolumeStore, AXIS_C};

/// Passes samples through: one store call per channel and time point of the tile.
#[derive(Clone, Debug)]
pub struct DirectCodec {
    pub(super) axis_map: AxisMap,
    pub(super) external_kind: SampleKind,
}
impl DirectCodec {
    pub fn new(axis_map: AxisMap, external_kind: SampleKind) -> Self {
        DirectCodec {
            axis_map,
            external_kind,
        }
    }

    pub fn read(&self, store: &dyn VolumeStore, level: usize, min: &[u64], extent: &[usize]) -> Result<SampleBuffer> {
        let region = ExternalRegion::of(&self.axis_map, min, extent);
        let stack_len = region.stack_len();
        let channels = region.size[AXIS_C];
        let mut out = SampleBuffer::zeros(self.external_kind, extent.iter().product());
        for t in 0..region.time_points() {
            for c in 0..channels {
                let stack = read_stack(store, &region, region.origin[AXIS_C] + c, t, level)?;
                out.copy_from((c + channels * t) * stack_len, &stack, 0, stack_len)?;
            }
        }
        Ok(out)
    }

    pub fn write(&self, store: &dyn VolumeStore, buffer: &SampleBuffer, min: &[u64], extent: &[usize]) -> Result<()> {
        check_len(buffer, extent)?;
        let region = ExternalRegion::of(&self.axis_map, min, extent);
        let stack_len = region.stack_len();
        let channels = region.size[AXIS_C];
        for t in 0..region.time_points() {
            for c in 0..channels {
                let stack = buffer.slice((c + channels * t) * stack_len, stack_len);
                store.write_sub_volume(&stack, region.stack_origin(region.origin[AXIS_C] + c, t), region.stack_size())?;
            }
        }
        Ok(())
    }
}
