use crate::grid::TileKey;
use crate::store::SampleBuffer;
use derive_more::Debug;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    RwLock, RwLockReadGuard,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MaterializationState {
    /// Never written to the store; loads come from the fallback initializer.
    Virtual,
    /// Written at least once; loads come from the store from now on.
    Materialized,
}

/// One cached tile: its place in the image and its sample buffer.
#[derive(Debug)]
pub struct Tile {
    key: TileKey,
    min: Vec<u64>,
    extent: Vec<usize>,
    #[debug(skip)]
    data: RwLock<SampleBuffer>,
    dirty: AtomicBool,
    last_access: AtomicU64,
}

impl Tile {
    pub fn new(key: TileKey, min: Vec<u64>, extent: Vec<usize>, data: SampleBuffer) -> Self {
        Tile {
            key,
            min,
            extent,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            last_access: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> TileKey {
        self.key
    }
    pub fn min(&self) -> &[u64] {
        &self.min
    }
    pub fn extent(&self) -> &[usize] {
        &self.extent
    }
    pub fn len(&self) -> usize {
        self.extent.iter().product()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pos: &[u64]) -> bool {
        pos.iter()
            .zip(self.min.iter().zip(self.extent.iter()))
            .all(|(&p, (&m, &e))| p >= m && p < m + e as u64)
    }

    /// Offset of the image position `pos` inside this tile's buffer.
    pub fn local_index(&self, pos: &[u64]) -> usize {
        pos.iter()
            .zip(self.min.iter())
            .zip(self.extent.iter())
            .rev()
            .fold(0, |acc, ((&p, &m), &e)| acc * e + (p - m) as usize)
    }

    pub fn data(&self) -> RwLockReadGuard<'_, SampleBuffer> {
        self.data.read().unwrap()
    }

    /// Mutates the buffer and marks the tile dirty.
    pub fn update<R>(&self, f: impl FnOnce(&mut SampleBuffer) -> R) -> R {
        let mut data = self.data.write().unwrap();
        let result = f(&mut data);
        self.dirty.store(true, Ordering::Release);
        result
    }

    pub fn get(&self, pos: &[u64]) -> f64 {
        self.data().get_f64(self.local_index(pos))
    }
    pub fn set(&self, pos: &[u64], value: f64) {
        let index = self.local_index(pos);
        self.update(|data| data.set_f64(index, value));
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
    }
    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SampleKind;

    #[test]
    fn local_indexing_and_dirty_bit() {
        let tile = Tile::new(
            TileKey::new(0, 5),
            vec![4, 6],
            vec![3, 2],
            SampleBuffer::zeros(SampleKind::U16, 6),
        );
        assert!(tile.contains(&[6, 7]));
        assert!(!tile.contains(&[7, 7]));
        assert_eq!(tile.local_index(&[5, 7]), 4);
        assert!(!tile.is_dirty());

        tile.set(&[5, 7], 300.0);
        assert!(tile.is_dirty());
        assert_eq!(tile.get(&[5, 7]), 300.0);
        assert_eq!(*tile.data(), SampleBuffer::U16(vec![0, 0, 0, 0, 300, 0]));

        tile.clear_dirty();
        assert!(!tile.is_dirty());
    }
}
