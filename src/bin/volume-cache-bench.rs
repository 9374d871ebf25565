use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tiled_volume::{CacheOptions, CachedVolume, Encoding, InMemoryStore, Initializer, SampleKind};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EncodingArg {
    Direct,
    Label,
    Probability,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum KindArg {
    U8,
    U16,
    F32,
}

#[derive(Parser, Debug)]
#[command(
    name = "volume-cache-bench",
    about = "Exercises the tile cache against an in-memory store"
)]
struct Args {
    #[arg(long, value_enum, default_value = "direct")]
    encoding: EncodingArg,
    #[arg(long, value_enum, default_value = "u16")]
    kind: KindArg,
    /// store extents as x,y,z,c,t
    #[arg(long, value_delimiter = ',', default_value = "256,256,64,1,1")]
    dims: Vec<usize>,
    /// native block size as x,y,z
    #[arg(long, value_delimiter = ',', default_value = "64,64,16")]
    block: Vec<usize>,
    /// JSON file with cache options
    #[arg(long)]
    options: Option<PathBuf>,
    #[arg(long)]
    io_threads: Option<usize>,
    #[arg(long)]
    queue_size: Option<usize>,
    /// start from virtual, zero-initialized tiles instead of reading the store
    #[arg(long, default_value_t = false)]
    zeros: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let dims: [usize; 5] = args
        .dims
        .as_slice()
        .try_into()
        .context("--dims needs exactly five extents")?;
    let block: [usize; 3] = args
        .block
        .as_slice()
        .try_into()
        .context("--block needs exactly three extents")?;
    let mut options = match &args.options {
        Some(path) => CacheOptions::from_json_file(path)?,
        None => CacheOptions::default(),
    };
    if let Some(n) = args.io_threads {
        options.num_io_threads = n;
    }
    if let Some(n) = args.queue_size {
        options.max_io_queue_size = n;
    }
    let kind = match args.kind {
        KindArg::U8 => SampleKind::U8,
        KindArg::U16 => SampleKind::U16,
        KindArg::F32 => SampleKind::F32,
    };
    let encoding = match args.encoding {
        EncodingArg::Direct => Encoding::Direct,
        EncodingArg::Label => Encoding::Label,
        EncodingArg::Probability => Encoding::Probability,
    };

    let store = Arc::new(InMemoryStore::new(kind, dims, block));
    store.fill_with(|[x, y, z, c, _]| match encoding {
        Encoding::Direct => ((x ^ y ^ z) % 200) as f64 * kind.max_value() / 255.0,
        Encoding::Label => ((x / 16 + y / 16 + z) % dims[3] == c) as u8 as f64,
        Encoding::Probability => kind.max_value() / (dims[3] + 1) as f64,
    });
    let initializer = args.zeros.then_some(Initializer::Zeros);
    let volume = CachedVolume::open(store.clone(), encoding, &options, initializer)?;
    let grid = volume.tile_grid();
    println!(
        "image {:?}, {} tiles of {:?}, {} pyramid levels",
        volume.dimensions(),
        grid.num_tiles(),
        grid.tile_extent(),
        volume.pyramid().num_levels()
    );

    let start = Instant::now();
    let sum = (0..grid.num_tiles())
        .into_par_iter()
        .map(|index| -> tiled_volume::Result<f64> {
            let tile = volume.cache().get(index)?;
            let data = tile.data();
            Ok((0..data.len()).map(|i| data.get_f64(i)).sum())
        })
        .collect::<tiled_volume::Result<Vec<f64>>>()?
        .into_iter()
        .sum::<f64>();
    println!("read all tiles in {:?}, checksum {}", start.elapsed(), sum);

    let extent: Vec<usize> = volume.dimensions().iter().map(|&d| (d as usize).div_ceil(3)).collect();
    let min: Vec<u64> = volume.dimensions().iter().map(|&d| d / 3).collect();
    let len: usize = extent.iter().product();
    let mut region = volume.read_region(&min, &extent)?;
    if encoding != Encoding::Probability {
        (0..len).for_each(|i| region.set_f64(i, 1.0));
    }
    let start = Instant::now();
    volume.write_region(&min, &extent, &region)?;
    volume.persist_all_and_wait()?;
    println!(
        "wrote region {:?}+{:?} and persisted in {:?}, {} store writes",
        min,
        extent,
        start.elapsed(),
        store.write_count()
    );

    let stats = volume.pyramid().stats();
    volume.close()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
