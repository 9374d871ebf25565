use super::{check_len, read_stack, ExternalRegion};
use crate::axis::AxisMap;
use crate::error::{Error, Result};
use crate::store::{SampleBuffer, SampleKind, VolumeStore, AXIS_C};

/// Class probabilities. The store holds `K` channels; tiles hold `K + 1` along the last axis, where
/// channel 0 is the background `1 - sum(p)` and is never written back.
///
/// Integer stores quantize to `round(p * max)`, so a write/read cycle is exact only for `F32` stores.
#[derive(Clone, Debug)]
pub struct ProbabilityCodec {
    pub(super) axis_map: AxisMap,
    pub(super) external_kind: SampleKind,
    pub(super) channels: usize,
}
impl ProbabilityCodec {
    pub fn new(axis_map: AxisMap, external_kind: SampleKind, channels: usize) -> Self {
        ProbabilityCodec {
            axis_map,
            external_kind,
            channels,
        }
    }

    fn region(&self, min: &[u64], extent: &[usize]) -> Result<ExternalRegion> {
        let region = ExternalRegion::of(&self.axis_map, min, extent);
        if region.origin[AXIS_C] != 0 || region.size[AXIS_C] != self.channels + 1 {
            return Err(Error::InvalidGeometry(format!(
                "probability tiles must span all {} channels, got {}+{}",
                self.channels + 1,
                region.origin[AXIS_C],
                region.size[AXIS_C]
            )));
        }
        Ok(region)
    }

    pub fn read(&self, store: &dyn VolumeStore, level: usize, min: &[u64], extent: &[usize]) -> Result<SampleBuffer> {
        let region = self.region(min, extent)?;
        let stack_len = region.stack_len();
        let time_points = region.time_points();
        let mut out = vec![0.0f32; extent.iter().product()];
        for t in 0..time_points {
            let stacks = (0..self.channels)
                .map(|c| read_stack(store, &region, c, t, level))
                .collect::<Result<Vec<_>>>()?;
            // internal channel `ch` of time point `t` starts at `(t + time_points * ch) * stack_len`
            let mut planes: Vec<&mut [f32]> = out.chunks_mut(stack_len).collect();
            let mut per_channel: Vec<&mut [f32]> = Vec::with_capacity(self.channels + 1);
            for (i, plane) in planes.iter_mut().enumerate() {
                if i % time_points == t {
                    per_channel.push(std::mem::take(plane));
                }
            }
            decode_probabilities(&stacks, &mut per_channel);
        }
        Ok(SampleBuffer::F32(out))
    }

    pub fn write(&self, store: &dyn VolumeStore, buffer: &SampleBuffer, min: &[u64], extent: &[usize]) -> Result<()> {
        check_len(buffer, extent)?;
        let region = self.region(min, extent)?;
        let stack_len = region.stack_len();
        let time_points = region.time_points();
        for t in 0..time_points {
            for c in 0..self.channels {
                let offset = (t + time_points * (c + 1)) * stack_len;
                let stack = encode_probability_channel(buffer, offset, stack_len, self.external_kind);
                store.write_sub_volume(&stack, region.stack_origin(c, t), region.stack_size())?;
            }
        }
        Ok(())
    }
}

/// Fills `out[0]` with the background and `out[c + 1]` with channel `c` of `channels` as values
/// in `[0, 1]`. Integer samples are divided by the maximum of their kind.
pub fn decode_probabilities(channels: &[SampleBuffer], out: &mut [&mut [f32]]) {
    let len = out.first().map(|o| o.len()).unwrap_or(0);
    for i in 0..len {
        let mut sum = 0.0f32;
        for (c, stack) in channels.iter().enumerate() {
            let p = (stack.get_f64(i) / stack.kind().max_value()) as f32;
            out[c + 1][i] = p;
            sum += p;
        }
        out[0][i] = 1.0 - sum;
    }
}

/// Quantizes `probabilities[offset..offset + len]` to `kind`; float kinds are copied as is.
pub fn encode_probability_channel(probabilities: &SampleBuffer, offset: usize, len: usize, kind: SampleKind) -> SampleBuffer {
    let mut stack = SampleBuffer::zeros(kind, len);
    let max = kind.max_value();
    for i in 0..len {
        let p = probabilities.get_f64(offset + i);
        let v = if kind.is_float() { p } else { (p * max).round().clamp(0.0, max) };
        stack.set_f64(i, v);
    }
    stack
}
