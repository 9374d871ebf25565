use super::{ExternalDims, SampleBuffer, SampleKind, VolumeStore, AXIS_C, AXIS_T, AXIS_X, AXIS_Y, AXIS_Z};
use crate::error::{Error, Result};
use derive_more::Debug;
use log::debug;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Condvar, Mutex, RwLock,
};

struct Level {
    dims: ExternalDims,
    /// one XYZ buffer per (channel, time point), indexed `c + t * channels`
    stacks: Vec<RwLock<SampleBuffer>>,
}
impl Level {
    fn new(kind: SampleKind, dims: ExternalDims) -> Self {
        let xyz = dims[AXIS_X] * dims[AXIS_Y] * dims[AXIS_Z];
        let stacks = (0..dims[AXIS_C] * dims[AXIS_T])
            .map(|_| RwLock::new(SampleBuffer::zeros(kind, xyz)))
            .collect();
        Level { dims, stacks }
    }
    fn stack_index(&self, c: usize, t: usize) -> usize {
        c + t * self.dims[AXIS_C]
    }
    fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.dims[AXIS_X] * (y + self.dims[AXIS_Y] * z)
    }
}

/// A `VolumeStore` that keeps every pyramid level in memory.
///
/// Coarser levels halve X and Y (and Z while it is larger than the block depth) until a level fits
/// into a single block. Writes only ever touch level 0; call [`InMemoryStore::rebuild_pyramid`]
/// to refresh the coarser levels from it.
#[derive(Debug)]
pub struct InMemoryStore {
    kind: SampleKind,
    block_size: [usize; 3],
    #[debug(skip)]
    levels: Vec<Level>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    #[debug(skip)]
    write_gate: (Mutex<bool>, Condvar),
}
impl InMemoryStore {
    pub fn new(kind: SampleKind, dims: ExternalDims, block_size: [usize; 3]) -> Self {
        let mut level_dims = vec![dims];
        loop {
            let last = level_dims[level_dims.len() - 1];
            if last[AXIS_X] <= block_size[0] && last[AXIS_Y] <= block_size[1] {
                break;
            }
            let mut next = last;
            next[AXIS_X] = last[AXIS_X].div_ceil(2);
            next[AXIS_Y] = last[AXIS_Y].div_ceil(2);
            if last[AXIS_Z] > block_size[2] {
                next[AXIS_Z] = last[AXIS_Z].div_ceil(2);
            }
            level_dims.push(next);
        }
        Self::with_levels(kind, level_dims, block_size)
    }

    /// Uses the given per-level extents verbatim; channel and time counts must agree across levels.
    pub fn with_levels(kind: SampleKind, level_dims: Vec<ExternalDims>, block_size: [usize; 3]) -> Self {
        InMemoryStore {
            kind,
            block_size,
            levels: level_dims.into_iter().map(|dims| Level::new(kind, dims)).collect(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_gate: (Mutex::new(true), Condvar::new()),
        }
    }

    /// Sets every level-0 sample to `f([x, y, z, c, t])` and rebuilds the coarser levels.
    pub fn fill_with(&self, f: impl Fn([usize; 5]) -> f64) {
        let level = &self.levels[0];
        let [sx, sy, sz, sc, st] = level.dims;
        for t in 0..st {
            for c in 0..sc {
                let mut stack = level.stacks[level.stack_index(c, t)].write().unwrap();
                for z in 0..sz {
                    for y in 0..sy {
                        for x in 0..sx {
                            stack.set_f64(level.offset(x, y, z), f([x, y, z, c, t]));
                        }
                    }
                }
            }
        }
        self.rebuild_pyramid();
    }

    /// Recomputes levels `1..` by subsampling the previous level.
    pub fn rebuild_pyramid(&self) {
        for l in 1..self.levels.len() {
            let (prev, cur) = (&self.levels[l - 1], &self.levels[l]);
            let [sx, sy, sz, sc, st] = cur.dims;
            let fx = prev.dims[AXIS_X] / sx.max(1);
            let fy = prev.dims[AXIS_Y] / sy.max(1);
            let fz = prev.dims[AXIS_Z] / sz.max(1);
            for t in 0..st {
                for c in 0..sc {
                    let src = prev.stacks[prev.stack_index(c, t)].read().unwrap();
                    let mut dst = cur.stacks[cur.stack_index(c, t)].write().unwrap();
                    for z in 0..sz {
                        for y in 0..sy {
                            for x in 0..sx {
                                let from = prev.offset(
                                    (x * fx.max(1)).min(prev.dims[AXIS_X] - 1),
                                    (y * fy.max(1)).min(prev.dims[AXIS_Y] - 1),
                                    (z * fz.max(1)).min(prev.dims[AXIS_Z] - 1),
                                );
                                dst.set_f64(cur.offset(x, y, z), src.get_f64(from));
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn sample(&self, level: usize, pos: [usize; 5]) -> f64 {
        let level = &self.levels[level];
        let stack = level.stacks[level.stack_index(pos[AXIS_C], pos[AXIS_T])].read().unwrap();
        stack.get_f64(level.offset(pos[AXIS_X], pos[AXIS_Y], pos[AXIS_Z]))
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
    /// Number of `write_sub_volume` calls entered so far, including ones held at the write gate.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
    /// While closed, every `write_sub_volume` call blocks until the gate is opened again.
    pub fn set_write_gate(&self, open: bool) {
        let (lock, cvar) = &self.write_gate;
        *lock.lock().unwrap() = open;
        cvar.notify_all();
    }

    fn check_region(&self, level: usize, origin: [usize; 5], size: [usize; 3]) -> Result<&Level> {
        let l = self
            .levels
            .get(level)
            .ok_or_else(|| Error::store_io(format!("no pyramid level {}", level)))?;
        let fits = (0..3).all(|a| origin[a] + size[a] <= l.dims[a])
            && origin[AXIS_C] < l.dims[AXIS_C]
            && origin[AXIS_T] < l.dims[AXIS_T];
        if !fits {
            return Err(Error::store_io(format!(
                "sub-volume {:?}+{:?} outside of level {} extents {:?}",
                origin, size, level, l.dims
            )));
        }
        Ok(l)
    }
}

impl VolumeStore for InMemoryStore {
    fn sample_kind(&self) -> SampleKind {
        self.kind
    }
    fn extent(&self, axis: usize) -> usize {
        self.levels[0].dims[axis]
    }
    fn pyramid_level_count(&self) -> usize {
        self.levels.len()
    }
    fn pyramid_extents(&self, level: usize) -> ExternalDims {
        self.levels[level].dims
    }
    fn pyramid_block_size(&self, level: usize) -> ExternalDims {
        let dims = self.levels[level].dims;
        [
            self.block_size[0].min(dims[AXIS_X]),
            self.block_size[1].min(dims[AXIS_Y]),
            self.block_size[2].min(dims[AXIS_Z]),
            1,
            1,
        ]
    }

    fn read_sub_volume(&self, origin: [usize; 5], level: usize, size: [usize; 3]) -> Result<SampleBuffer> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(Error::store_io("read refused"));
        }
        let l = self.check_region(level, origin, size)?;
        let stack = l.stacks[l.stack_index(origin[AXIS_C], origin[AXIS_T])].read().unwrap();
        let mut out = SampleBuffer::zeros(self.kind, size[0] * size[1] * size[2]);
        for z in 0..size[2] {
            for y in 0..size[1] {
                let src = l.offset(origin[AXIS_X], origin[AXIS_Y] + y, origin[AXIS_Z] + z);
                out.copy_from((z * size[1] + y) * size[0], &stack, src, size[0])?;
            }
        }
        Ok(out)
    }

    fn write_sub_volume(&self, buffer: &SampleBuffer, origin: [usize; 5], size: [usize; 3]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::AcqRel);
        {
            let (lock, cvar) = &self.write_gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(Error::store_io("write refused"));
        }
        if buffer.kind() != self.kind || buffer.len() != size[0] * size[1] * size[2] {
            return Err(Error::store_io(format!(
                "buffer of {} {:?} samples does not match sub-volume {:?} of {:?}",
                buffer.len(),
                buffer.kind(),
                size,
                self.kind
            )));
        }
        let l = self.check_region(0, origin, size)?;
        debug!("store write {:?}+{:?}", origin, size);
        let mut stack = l.stacks[l.stack_index(origin[AXIS_C], origin[AXIS_T])].write().unwrap();
        for z in 0..size[2] {
            for y in 0..size[1] {
                let dst = l.offset(origin[AXIS_X], origin[AXIS_Y] + y, origin[AXIS_Z] + z);
                stack.copy_from(dst, buffer, (z * size[1] + y) * size[0], size[0])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_pyramid_until_one_block() {
        let store = InMemoryStore::new(SampleKind::U8, [100, 60, 10, 1, 1], [32, 32, 16]);
        assert_eq!(store.pyramid_level_count(), 3);
        assert_eq!(store.pyramid_extents(1), [50, 30, 10, 1, 1]);
        assert_eq!(store.pyramid_extents(2), [25, 15, 10, 1, 1]);
        assert_eq!(store.pyramid_block_size(2), [25, 15, 10, 1, 1]);
    }

    #[test]
    fn sub_volume_read_write() {
        let store = InMemoryStore::new(SampleKind::U16, [8, 8, 4, 2, 1], [8, 8, 4]);
        store.fill_with(|[x, y, z, c, _]| (x + 10 * y + 100 * z + 1000 * c) as f64);
        let read = store.read_sub_volume([2, 3, 1, 1, 0], 0, [2, 2, 1]).unwrap();
        assert_eq!(read, SampleBuffer::U16(vec![1132, 1133, 1142, 1143]));

        store
            .write_sub_volume(&SampleBuffer::U16(vec![7, 8]), [0, 0, 0, 0, 0], [2, 1, 1])
            .unwrap();
        assert_eq!(store.sample(0, [1, 0, 0, 0, 0]), 8.0);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn out_of_bounds_is_an_io_error() {
        let store = InMemoryStore::new(SampleKind::U8, [4, 4, 1, 1, 1], [4, 4, 1]);
        let err = store.read_sub_volume([3, 0, 0, 0, 0], 0, [2, 1, 1]).unwrap_err();
        assert!(matches!(err, Error::StoreIo { .. }));
    }
}
