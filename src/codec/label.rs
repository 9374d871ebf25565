use super::{check_len, read_stack, ExternalRegion};
use crate::axis::AxisMap;
use crate::error::Result;
use crate::store::{SampleBuffer, SampleKind, VolumeStore};

/// One-hot labels: store channel `c` is nonzero wherever the label is `c + 1`.
#[derive(Clone, Debug)]
pub struct LabelCodec {
    pub(super) axis_map: AxisMap,
    pub(super) external_kind: SampleKind,
    pub(super) channels: usize,
}
impl LabelCodec {
    pub fn new(axis_map: AxisMap, external_kind: SampleKind, channels: usize) -> Self {
        LabelCodec {
            axis_map,
            external_kind,
            channels,
        }
    }

    /// Smallest unsigned kind that holds every label including background.
    pub fn label_kind(&self) -> SampleKind {
        if self.channels <= u8::MAX as usize {
            SampleKind::U8
        } else {
            SampleKind::U16
        }
    }

    pub fn read(&self, store: &dyn VolumeStore, level: usize, min: &[u64], extent: &[usize]) -> Result<SampleBuffer> {
        let region = ExternalRegion::of(&self.axis_map, min, extent);
        let stack_len = region.stack_len();
        let mut out = SampleBuffer::zeros(self.label_kind(), extent.iter().product());
        for t in 0..region.time_points() {
            let stacks = (0..self.channels)
                .map(|c| read_stack(store, &region, c, t, level))
                .collect::<Result<Vec<_>>>()?;
            decode_labels(&stacks, &mut out, t * stack_len);
        }
        Ok(out)
    }

    pub fn write(&self, store: &dyn VolumeStore, buffer: &SampleBuffer, min: &[u64], extent: &[usize]) -> Result<()> {
        check_len(buffer, extent)?;
        let region = ExternalRegion::of(&self.axis_map, min, extent);
        let stack_len = region.stack_len();
        for t in 0..region.time_points() {
            for c in 0..self.channels {
                let stack = encode_label_channel(buffer, t * stack_len, stack_len, c, self.external_kind);
                store.write_sub_volume(&stack, region.stack_origin(c, t), region.stack_size())?;
            }
        }
        Ok(())
    }
}

/// Writes into `out[offset..]` the label of every position: `c + 1` for the lowest channel `c` that is
/// nonzero there, 0 if none is. Overlapping channels resolve to the lowest channel index.
pub fn decode_labels(channels: &[SampleBuffer], out: &mut SampleBuffer, offset: usize) {
    let len = channels.first().map(|c| c.len()).unwrap_or(0);
    for i in 0..len {
        let label = channels
            .iter()
            .position(|c| c.is_nonzero(i))
            .map(|c| c + 1)
            .unwrap_or(0);
        out.set_f64(offset + i, label as f64);
    }
}

/// The binary mask of `channel` for `labels[offset..offset + len]`.
///
/// Labels above the channel count have no mask and end up as background.
pub fn encode_label_channel(
    labels: &SampleBuffer,
    offset: usize,
    len: usize,
    channel: usize,
    kind: SampleKind,
) -> SampleBuffer {
    let mut mask = SampleBuffer::zeros(kind, len);
    let wanted = (channel + 1) as f64;
    for i in 0..len {
        if labels.get_f64(offset + i) == wanted {
            mask.set_f64(i, 1.0);
        }
    }
    mask
}
