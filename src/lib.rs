#![warn(clippy::all, rust_2018_idioms)]

pub mod axis;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod grid;
pub mod pyramid;
pub mod store;
pub mod volume;

pub use axis::AxisMap;
pub use cache::{Initializer, MaterializationState, Tile, TileCache, WriteHandle};
pub use codec::{Encoding, PixelCodec};
pub use config::{CacheBound, CacheOptions};
pub use error::{Error, Result};
pub use grid::{TileGrid, TileKey};
pub use pyramid::ResolutionPyramid;
pub use store::{InMemoryStore, SampleBuffer, SampleKind, VolumeStore};
pub use volume::{AffineTransform, CachedVolume, PyramidSource, VoxelVolume};
