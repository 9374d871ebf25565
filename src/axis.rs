//! Correspondence between the store's fixed X, Y, Z, C, T axes and the axes of an internal image.
//!
//! Internal images drop external axes of extent 1, but keep the remaining axes in external order.
//! Two encodings use a different correspondence: label images never map the external channel axis
//! (the channel count is folded into the sample value), and probability images always place the
//! channel axis last, with one more entry than the store has channels.

use crate::error::{Error, Result};
use crate::store::{ExternalDims, AXIS_C, AXIS_T, AXIS_X, AXIS_Y, AXIS_Z};

const MIN_INTERNAL_AXES: usize = 2;
const MAX_INTERNAL_AXES: usize = 5;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AxisMapKind {
    Default,
    Label,
    Probability,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AxisMap {
    kind: AxisMapKind,
    external_to_internal: [Option<usize>; 5],
    internal_to_external: Vec<Option<usize>>,
}

impl AxisMap {
    /// Matches every external axis against the next unconsumed internal axis, eliding external axes
    /// of extent 1 that do not match.
    pub fn build(external: &ExternalDims, internal: &[u64]) -> Result<Self> {
        check_internal_len(internal)?;
        let map = match_in_order(external, internal, None)?;
        Ok(Self::from_map(AxisMapKind::Default, map, internal.len()))
    }

    /// Like [`AxisMap::build`], but the external channel axis is always elided.
    pub fn build_label(external: &ExternalDims, internal: &[u64]) -> Result<Self> {
        check_internal_len(internal)?;
        let map = match_in_order(external, internal, Some(AXIS_C))?;
        Ok(Self::from_map(AxisMapKind::Label, map, internal.len()))
    }

    /// The last internal axis is the channel axis and holds the implicit background channel in
    /// addition to the store's channels. All other axes are matched in order.
    pub fn build_probability(external: &ExternalDims, internal: &[u64]) -> Result<Self> {
        check_internal_len(internal)?;
        let channel_axis = internal.len() - 1;
        let expected = external[AXIS_C] as u64 + 1;
        if internal[channel_axis] != expected {
            return Err(Error::DimensionMismatch(format!(
                "probability channel axis has extent {} but the store has {} channels (expected {})",
                internal[channel_axis], external[AXIS_C], expected
            )));
        }
        let mut map = match_in_order(external, &internal[..channel_axis], Some(AXIS_C))?;
        map[AXIS_C] = Some(channel_axis);
        Ok(Self::from_map(AxisMapKind::Probability, map, internal.len()))
    }

    fn from_map(kind: AxisMapKind, external_to_internal: [Option<usize>; 5], n: usize) -> Self {
        let mut internal_to_external = vec![None; n];
        for (e, d) in external_to_internal.iter().enumerate() {
            if let Some(d) = d {
                internal_to_external[*d] = Some(e);
            }
        }
        AxisMap {
            kind,
            external_to_internal,
            internal_to_external,
        }
    }

    pub fn kind(&self) -> AxisMapKind {
        self.kind
    }
    pub fn num_internal_axes(&self) -> usize {
        self.internal_to_external.len()
    }
    pub fn external_to_internal(&self) -> &[Option<usize>; 5] {
        &self.external_to_internal
    }
    /// The reverse map, one entry per internal axis, `None` where no external axis maps to it.
    pub fn invert(&self) -> Vec<Option<usize>> {
        self.internal_to_external.clone()
    }
    pub fn internal_axis(&self, external_axis: usize) -> Option<usize> {
        self.external_to_internal[external_axis]
    }
    pub fn external_axis(&self, internal_axis: usize) -> Option<usize> {
        self.internal_to_external[internal_axis]
    }
    /// Index of the internal axis that holds probability channels.
    pub fn probability_channel_axis(&self) -> Option<usize> {
        match self.kind {
            AxisMapKind::Probability => Some(self.num_internal_axes() - 1),
            _ => None,
        }
    }

    /// Internal extents for another set of external extents with the same axis layout, e.g. a
    /// coarser pyramid level.
    pub fn internal_dims_for(&self, external: &ExternalDims) -> Vec<u64> {
        self.internal_to_external
            .iter()
            .enumerate()
            .map(|(d, e)| match (*e, self.probability_channel_axis()) {
                (_, Some(c)) if c == d => external[AXIS_C] as u64 + 1,
                (Some(e), _) => external[e] as u64,
                (None, _) => 1,
            })
            .collect()
    }
}

fn check_internal_len(internal: &[u64]) -> Result<()> {
    if internal.len() < MIN_INTERNAL_AXES || internal.len() > MAX_INTERNAL_AXES {
        return Err(Error::DimensionMismatch(format!(
            "internal images need between {} and {} axes, got {}",
            MIN_INTERNAL_AXES,
            MAX_INTERNAL_AXES,
            internal.len()
        )));
    }
    Ok(())
}

fn match_in_order(external: &ExternalDims, internal: &[u64], skip: Option<usize>) -> Result<[Option<usize>; 5]> {
    let mut map = [None; 5];
    let mut next = 0;
    for (e, &extent) in external.iter().enumerate() {
        if Some(e) == skip {
            continue;
        }
        if next < internal.len() && internal[next] == extent as u64 {
            map[e] = Some(next);
            next += 1;
        } else if extent != 1 {
            return Err(Error::DimensionMismatch(format!(
                "external axis {} of extent {} matches no internal axis in {:?}",
                e, extent, internal
            )));
        }
    }
    if next != internal.len() {
        return Err(Error::DimensionMismatch(format!(
            "internal axes {:?} are left unmatched by external extents {:?}",
            &internal[next..],
            external
        )));
    }
    Ok(map)
}

/// Internal extents for a store: X and Y are always kept, Z, C and T only if larger than 1.
pub fn default_internal_dims(external: &ExternalDims) -> Vec<u64> {
    keep_axes(external, &[AXIS_Z, AXIS_C, AXIS_T])
}

/// Internal extents of a label image: like [`default_internal_dims`] without the channel axis.
pub fn label_internal_dims(external: &ExternalDims) -> Vec<u64> {
    keep_axes(external, &[AXIS_Z, AXIS_T])
}

/// Internal extents of a probability image: channels (plus background) always come last.
pub fn probability_internal_dims(external: &ExternalDims) -> Vec<u64> {
    let mut dims = keep_axes(external, &[AXIS_Z, AXIS_T]);
    dims.push(external[AXIS_C] as u64 + 1);
    dims
}

fn keep_axes(external: &ExternalDims, optional: &[usize]) -> Vec<u64> {
    let mut dims = vec![external[AXIS_X] as u64, external[AXIS_Y] as u64];
    dims.extend(optional.iter().filter(|&&a| external[a] > 1).map(|&a| external[a] as u64));
    dims
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elides_axes_of_extent_one() {
        let ext = [64, 32, 1, 3, 1];
        let map = AxisMap::build(&ext, &[64, 32, 3]).unwrap();
        assert_eq!(map.external_to_internal(), &[Some(0), Some(1), None, Some(2), None]);
        assert_eq!(map.invert(), vec![Some(0), Some(1), Some(3)]);
    }

    #[test]
    fn invert_reproduces_mapping() {
        let cases: Vec<ExternalDims> = vec![
            [10, 20, 30, 4, 5],
            [10, 20, 1, 1, 5],
            [10, 20, 30, 1, 1],
            [10, 1, 30, 1, 7],
            [1, 20, 1, 4, 1],
        ];
        for ext in cases {
            let internal: Vec<u64> = ext.iter().filter(|&&e| e > 1).map(|&e| e as u64).collect();
            let map = AxisMap::build(&ext, &internal).unwrap();
            let inverse = map.invert();
            assert_eq!(inverse.len(), internal.len());
            for (e, d) in map.external_to_internal().iter().enumerate() {
                match d {
                    Some(d) => assert_eq!(inverse[*d], Some(e)),
                    None => assert_eq!(ext[e], 1),
                }
            }
            for (d, e) in inverse.iter().enumerate() {
                assert_eq!(map.internal_axis(e.unwrap()), Some(d));
            }
        }
    }

    #[test]
    fn matching_extent_one_prefers_mapping() {
        let map = AxisMap::build(&[5, 1, 1, 1, 1], &[5, 1]).unwrap();
        assert_eq!(map.external_to_internal(), &[Some(0), Some(1), None, None, None]);
    }

    #[test]
    fn rejects_mismatch() {
        assert!(matches!(
            AxisMap::build(&[64, 32, 5, 1, 1], &[64, 32, 6]),
            Err(Error::DimensionMismatch(_))
        ));
        assert!(matches!(
            AxisMap::build(&[64, 32, 1, 1, 1], &[64, 32, 4]),
            Err(Error::DimensionMismatch(_))
        ));
        assert!(matches!(AxisMap::build(&[64, 1, 1, 1, 1], &[64]), Err(Error::DimensionMismatch(_))));
    }

    #[test]
    fn label_map_ignores_channels() {
        let ext = [16, 16, 4, 3, 2];
        let internal = label_internal_dims(&ext);
        assert_eq!(internal, vec![16, 16, 4, 2]);
        let map = AxisMap::build_label(&ext, &internal).unwrap();
        assert_eq!(map.internal_axis(AXIS_C), None);
        assert_eq!(map.internal_axis(AXIS_T), Some(3));
        assert!(AxisMap::build(&ext, &internal).is_err());
    }

    #[test]
    fn probability_map_reserves_last_axis() {
        let ext = [16, 8, 1, 3, 1];
        let internal = probability_internal_dims(&ext);
        assert_eq!(internal, vec![16, 8, 4]);
        let map = AxisMap::build_probability(&ext, &internal).unwrap();
        assert_eq!(map.internal_axis(AXIS_C), Some(2));
        assert_eq!(map.probability_channel_axis(), Some(2));
        assert_eq!(map.internal_dims_for(&[8, 4, 1, 3, 1]), vec![8, 4, 4]);

        assert!(matches!(
            AxisMap::build_probability(&ext, &[16, 8, 3]),
            Err(Error::DimensionMismatch(_))
        ));
    }

    #[test]
    fn default_dims_keep_xy() {
        assert_eq!(default_internal_dims(&[7, 1, 1, 1, 1]), vec![7, 1]);
        assert_eq!(default_internal_dims(&[7, 9, 1, 2, 3]), vec![7, 9, 2, 3]);
    }
}
