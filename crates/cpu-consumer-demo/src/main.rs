//! Drives a `CpuConsumer` from an in-memory producer.
//!
//! A producer thread cycles a small pool of buffers through the queue while
//! several reader threads lock, inspect and unlock frames. At the end the
//! consumer's counters are logged.
//!
//! ```bash
//! RUST_LOG=cpu_consumer=trace cargo run -p cpu-consumer-demo
//! CPU_CONSUMER_EGL_VENDOR=powervr cargo run -p cpu-consumer-demo --features gpu
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpu_consumer::memory::{MemoryBufferQueue, MemoryGraphicBuffer};
use cpu_consumer::{ConsumerConfig, CpuConsumer, ErrorKind, PixelFormat};
use parking_lot::Mutex;
use tracing::{error, info, warn};

const FRAMES: u64 = 600;
const READERS: usize = 3;
const MAX_LOCKED: usize = 2;
const WIDTH: u32 = 64;
const HEIGHT: u32 = 36;

/// Formats cycled by the producer: one per lock path.
const POOL_FORMATS: [PixelFormat; 4] = [
    PixelFormat::YCbCr420888,
    PixelFormat::Rgba8888,
    PixelFormat::YCbCr422I,
    PixelFormat::YCrCb420Sp,
];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cpu_consumer=info".parse().unwrap())
                .add_directive("cpu_consumer_demo=debug".parse().unwrap()),
        )
        .init();

    let queue = MemoryBufferQueue::new();
    let config = ConsumerConfig::new(MAX_LOCKED).with_name("demo");
    let consumer = match CpuConsumer::new(queue.clone(), config) {
        Ok(consumer) => Arc::new(consumer),
        Err(e) => {
            error!("Failed to create consumer: {e}");
            std::process::exit(1);
        }
    };

    let pool: Vec<Arc<MemoryGraphicBuffer>> = POOL_FORMATS
        .iter()
        .cycle()
        .take(POOL_FORMATS.len() * 2)
        .map(|&format| Arc::new(MemoryGraphicBuffer::new(WIDTH, HEIGHT, format)))
        .collect();

    let done = Arc::new(AtomicBool::new(false));
    let frames_read = Arc::new(AtomicU64::new(0));
    let frames_failed = Arc::new(AtomicU64::new(0));
    let luma_sums = Arc::new(Mutex::new(Vec::<u64>::new()));
    let started = Instant::now();

    let producer = {
        let queue = queue.clone();
        let pool = pool.clone();
        thread::spawn(move || {
            let mut produced = 0u64;
            while produced < FRAMES {
                for slot in queue.free_slots(pool.len()) {
                    if produced == FRAMES {
                        break;
                    }
                    let shade = (produced % 256) as u8;
                    if pool[slot].fill(shade).is_err() {
                        continue;
                    }
                    match queue.queue_buffer(slot, pool[slot].clone()) {
                        Ok(_) => produced += 1,
                        Err(e) => warn!("Producer could not queue slot {slot}: {e}"),
                    }
                }
                thread::sleep(Duration::from_micros(200));
            }
            info!("Producer queued {produced} frames");
        })
    };

    let readers: Vec<_> = (0..READERS)
        .map(|reader| {
            let consumer = Arc::clone(&consumer);
            let done = Arc::clone(&done);
            let frames_read = Arc::clone(&frames_read);
            let frames_failed = Arc::clone(&frames_failed);
            let luma_sums = Arc::clone(&luma_sums);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let view = match consumer.lock_next_buffer() {
                        Ok(view) => view,
                        Err(e) if e.kind() == ErrorKind::InvalidState
                            || e.kind() == ErrorKind::ResourceExhausted =>
                        {
                            thread::sleep(Duration::from_micros(100));
                            continue;
                        }
                        Err(e) => {
                            // The consumer already handed this frame back
                            error!("Reader {reader}: lock failed: {e}");
                            frames_failed.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };

                    if view.is_ycbcr() {
                        // SAFETY: the view stays locked until the unlock below.
                        let sum: u64 = (0..view.height)
                            .map(|y| unsafe { view.luma_row(y) }.iter().map(|&b| u64::from(b)).sum::<u64>())
                            .sum();
                        luma_sums.lock().push(sum);
                    }

                    if let Err(e) = consumer.unlock_buffer(&view) {
                        error!("Reader {reader}: unlock of frame {} failed: {e}", view.frame_number);
                    }
                    frames_read.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    if producer.join().is_err() {
        error!("Producer thread panicked");
    }
    while frames_read.load(Ordering::Relaxed) + frames_failed.load(Ordering::Relaxed) < FRAMES {
        thread::sleep(Duration::from_millis(1));
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        if reader.join().is_err() {
            error!("Reader thread panicked");
        }
    }

    let stats = consumer.stats();
    let sums = luma_sums.lock();
    info!(
        "Read {} frames ({} failed) in {:?}: flex={} converted={} plain={} unlocks={} exhausted={} empty={} failed={} peak={}",
        frames_read.load(Ordering::Relaxed),
        frames_failed.load(Ordering::Relaxed),
        started.elapsed(),
        stats.flex_locks,
        stats.converted_locks,
        stats.plain_locks,
        stats.unlocks,
        stats.exhausted,
        stats.empty,
        stats.failed_locks,
        stats.peak_locked
    );
    info!(
        "YUV frames inspected: {}, conversion active: {}",
        sums.len(),
        consumer.is_conversion_active()
    );
}
