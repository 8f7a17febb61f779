use bcache::{BlockDevice, BlockNo, BufCache, CacheConfig, DevId, FileDisk, MemDisk};

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Hammer a shared buffer cache from several threads.
#[derive(Parser, Debug)]
#[command(name = "bcache-bench", version)]
struct Args {
    #[arg(long, default_value_t = bcache::BSIZE)]
    block_size: usize,
    #[arg(long, default_value_t = bcache::NBUF)]
    pool_capacity: usize,
    #[arg(long, default_value_t = bcache::NHASH)]
    hash_table_size: usize,
    /// worker threads
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// get/release rounds per thread
    #[arg(long, default_value_t = 10_000)]
    ops: usize,
    /// blocks per device
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
    blocks: BlockNo,
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    devices: DevId,
    /// keep devices as image files here instead of in memory
    #[arg(long)]
    image_dir: Option<PathBuf>,
    /// defer write-back until recycling or sync
    #[arg(long)]
    delayed: bool,
}

/// xorshift, good enough to scatter block numbers
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

/// Image files when `--image-dir` is given, memory otherwise.
fn open_images(args: &Args) -> bcache::Result<Option<Arc<FileDisk>>> {
    let Some(dir) = &args.image_dir else {
        return Ok(None);
    };
    std::fs::create_dir_all(dir)?;
    let disk = FileDisk::new(args.block_size);
    for dev in 1..=args.devices {
        let path = dir.join(format!("dev{}.img", dev));
        FileDisk::format(&path, args.block_size, args.blocks)?;
        disk.attach(dev, &path)?;
    }
    Ok(Some(Arc::new(disk)))
}

fn worker(cache: &BufCache, args: &Args, seed: u64) -> bcache::Result<()> {
    let mut rng = Rng(seed | 1);
    for _ in 0..args.ops {
        let r = rng.next();
        let dev = (r % args.devices as u64) as DevId + 1;
        let blockno = ((r >> 16) % args.blocks as u64) as BlockNo;
        let buf = cache.get_block(dev, blockno)?;
        if r & 0x3 == 0 {
            if args.delayed {
                let mut data = buf.data_mut();
                data[0] = data[0].wrapping_add(1);
                drop(data);
                cache.mark_delayed_write(&buf);
            } else {
                let mut data = buf.data_mut();
                data[0] = data[0].wrapping_add(1);
            }
        } else {
            let _ = buf.data()[0];
        }
        cache.release_block(buf)?;
    }
    Ok(())
}

fn run(args: Args) -> bcache::Result<()> {
    let config = CacheConfig::default()
        .with_block_size(args.block_size)
        .with_pool_capacity(args.pool_capacity)
        .with_hash_table_size(args.hash_table_size);
    let images = open_images(&args)?;
    let blk_dev: Arc<dyn BlockDevice> = match &images {
        Some(disk) => disk.clone(),
        None => Arc::new(MemDisk::new(args.block_size)),
    };
    let cache = BufCache::new(config, blk_dev)?;
    info!("{:?}", cache.config());

    let start = Instant::now();
    thread::scope(|s| {
        let handles: Vec<_> = (0..args.threads)
            .map(|i| {
                let cache = &cache;
                let args = &args;
                s.spawn(move || worker(cache, args, 0x9e37_79b9_7f4a_7c15 ^ i as u64))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<bcache::Result<Vec<()>>>()
    })?;
    cache.sync_all()?;
    if let Some(disk) = &images {
        disk.sync()?;
    }
    let elapsed = start.elapsed();

    let stats = cache.stats();
    println!(
        "{} ops in {:?}: {} hits, {} misses, {} reads, {} writes",
        args.threads * args.ops,
        elapsed,
        stats.hits,
        stats.misses,
        stats.reads,
        stats.writes
    );
    println!(
        "{} recycle flushes ({} failed), {} busy waits, {} exhausted waits",
        stats.recycle_flushes,
        stats.recycle_flush_failures,
        stats.busy_waits,
        stats.exhausted_waits
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        error!("{}", err);
        eprintln!("bcache-bench: {}", err);
        std::process::exit(1);
    }
}
