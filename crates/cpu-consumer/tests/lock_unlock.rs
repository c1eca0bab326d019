//! Lock/unlock integration tests against the in-memory queue.
//!
//! ```bash
//! cargo test --package cpu-consumer --test lock_unlock
//! RUST_LOG=cpu_consumer=trace cargo test --test lock_unlock -- --nocapture
//! ```

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread;

use cpu_consumer::error::status;
use cpu_consumer::memory::{MemoryBufferQueue, MemoryGraphicBuffer};
use cpu_consumer::{
    BufferError, ConsumerConfig, ConsumerError, ConversionConfig, CpuConsumer, DataSpace,
    ErrorKind, LockedBufferView, PixelFormat, QueueError, Rect, ScalingMode, Transform,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn consumer(max: usize) -> (CpuConsumer, MemoryBufferQueue) {
    init_logging();
    let queue = MemoryBufferQueue::new();
    let config = ConsumerConfig::new(max)
        .with_name("lock-unlock-test")
        .with_conversion(ConversionConfig::disabled());
    match CpuConsumer::new(queue.clone(), config) {
        Ok(consumer) => (consumer, queue),
        Err(e) => panic!("consumer should connect: {e}"),
    }
}

fn queue_rgba(queue: &MemoryBufferQueue, slot: usize) -> Arc<MemoryGraphicBuffer> {
    let buffer = Arc::new(MemoryGraphicBuffer::new(8, 4, PixelFormat::Rgba8888));
    if let Err(e) = queue.queue_buffer(slot, buffer.clone()) {
        panic!("queue slot {slot}: {e}");
    }
    buffer
}

fn lock(consumer: &CpuConsumer) -> LockedBufferView {
    match consumer.lock_next_buffer() {
        Ok(view) => view,
        Err(e) => panic!("lock should succeed: {e}"),
    }
}

fn dev_null_fd() -> OwnedFd {
    match std::fs::File::open("/dev/null") {
        Ok(file) => OwnedFd::from(file),
        Err(e) => panic!("open /dev/null: {e}"),
    }
}

/// With max = N, the (N+1)th lock is rejected without touching the queue.
#[test]
fn test_exhaustion_does_not_acquire() {
    let (consumer, queue) = consumer(2);
    for slot in 0..3 {
        queue_rgba(&queue, slot);
    }

    let _a = lock(&consumer);
    let _b = lock(&consumer);
    let acquires_before = queue.acquire_calls();

    let err = consumer.lock_next_buffer().err();
    assert_eq!(err, Some(ConsumerError::ResourceExhausted { max: 2 }));
    assert_eq!(queue.acquire_calls(), acquires_before);
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(consumer.locked_buffer_count(), 2);
    assert_eq!(consumer.stats().exhausted, 1);
}

#[test]
fn test_round_trip_restores_count() {
    let (consumer, queue) = consumer(1);
    let buffer = queue_rgba(&queue, 4);

    let view = lock(&consumer);
    assert_eq!(consumer.locked_buffer_count(), 1);
    assert!(buffer.is_locked());

    assert!(consumer.unlock_buffer(&view).is_ok());
    assert_eq!(consumer.locked_buffer_count(), 0);
    assert!(!buffer.is_locked());

    let released = queue.take_released();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].slot, 4);
    assert!(!released[0].fence.is_valid());

    // Freed entry is reusable
    queue_rgba(&queue, 5);
    let view = lock(&consumer);
    assert!(consumer.unlock_buffer(&view).is_ok());
}

#[test]
fn test_double_unlock_rejected() {
    let (consumer, queue) = consumer(2);
    queue_rgba(&queue, 0);
    queue_rgba(&queue, 1);
    let first = lock(&consumer);
    let _second = lock(&consumer);

    assert!(consumer.unlock_buffer(&first).is_ok());
    let err = consumer.unlock_buffer(&first).err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::InvalidArgument));
    assert_eq!(consumer.locked_buffer_count(), 1);
    assert_eq!(queue.release_count(), 1);
}

#[test]
fn test_view_from_other_consumer_rejected() {
    let (a, queue_a) = consumer(1);
    let (b, queue_b) = consumer(1);
    queue_rgba(&queue_a, 0);
    queue_rgba(&queue_b, 0);

    let view_a = lock(&a);
    let view_b = lock(&b);
    // Same entry index, different lock
    assert_eq!(view_a.token().entry(), view_b.token().entry());

    let err = b.unlock_buffer(&view_a).err();
    assert!(matches!(err, Some(ConsumerError::InvalidArgument(_))));
    assert_eq!(b.locked_buffer_count(), 1);

    assert!(a.unlock_buffer(&view_a).is_ok());
    assert!(b.unlock_buffer(&view_b).is_ok());
}

#[test]
fn test_never_locked_view_rejected() {
    let (consumer, queue) = consumer(1);
    queue_rgba(&queue, 0);
    let _held = lock(&consumer);

    let err = consumer.unlock_buffer(&LockedBufferView::default());
    assert!(matches!(err, Err(ConsumerError::InvalidArgument(_))));
    assert_eq!(consumer.locked_buffer_count(), 1);
}

#[test]
fn test_empty_queue_is_invalid_state() {
    let (consumer, _queue) = consumer(1);
    let Err(err) = consumer.lock_next_buffer() else {
        panic!("empty queue should not lock");
    };
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(err.is_transient());
    assert_eq!(err.as_status(), status::BAD_VALUE);
    assert_eq!(consumer.stats().empty, 1);
}

#[test]
fn test_abandoned_queue_error_propagates() {
    let (consumer, queue) = consumer(1);
    queue.abandon();
    let err = consumer.lock_next_buffer().err();
    assert_eq!(err, Some(ConsumerError::Queue(QueueError::abandoned())));
    assert_eq!(consumer.locked_buffer_count(), 0);
}

#[test]
fn test_metadata_carried_through() {
    let (consumer, queue) = consumer(1);
    let buffer = Arc::new(MemoryGraphicBuffer::new(16, 8, PixelFormat::YCbCr420888));
    let crop = Rect::new(2, 2, 14, 6);
    queue.queue_item(
        cpu_consumer::BufferItem::new(7, buffer)
            .with_crop(crop)
            .with_transform(Transform::ROT_90)
            .with_scaling_mode(ScalingMode::ScaleCrop)
            .with_timestamp(123_456_789)
            .with_data_space(DataSpace::BT709)
            .with_frame_number(42),
    );

    let view = lock(&consumer);
    assert_eq!((view.width, view.height), (16, 8));
    assert_eq!(view.format, PixelFormat::YCbCr420888);
    assert_eq!(view.flex_format, PixelFormat::YCbCr420888);
    assert_eq!(view.crop, crop);
    assert_eq!(view.transform, Transform::ROT_90);
    assert_eq!(view.scaling_mode, ScalingMode::ScaleCrop);
    assert_eq!(view.timestamp, 123_456_789);
    assert_eq!(view.data_space, DataSpace::BT709);
    assert_eq!(view.frame_number, 42);
    assert!(consumer.unlock_buffer(&view).is_ok());
}

#[test]
fn test_flex_planes_read_producer_data() {
    let (consumer, queue) = consumer(1);
    let buffer = Arc::new(MemoryGraphicBuffer::new(4, 2, PixelFormat::YCrCb420Sp));
    let filled = buffer.write_pixels(|px| {
        px[..8].copy_from_slice(&[10, 11, 12, 13, 20, 21, 22, 23]);
        px[8..12].copy_from_slice(&[100, 200, 101, 201]);
    });
    assert!(filled.is_ok());
    assert!(queue.queue_buffer(0, buffer).is_ok());

    let view = lock(&consumer);
    assert_eq!(view.flex_format, PixelFormat::YCbCr420888);
    // SAFETY: the view is locked until the unlock below.
    unsafe {
        assert_eq!(view.luma_row(1), &[20, 21, 22, 23]);
        assert_eq!(view.chroma_at(0, 0), (100, 200));
        assert_eq!(view.chroma_at(3, 1), (101, 201));
    }
    assert!(consumer.unlock_buffer(&view).is_ok());
}

#[test]
fn test_acquire_fence_is_forwarded_to_lock() {
    let (consumer, queue) = consumer(1);
    let buffer = Arc::new(MemoryGraphicBuffer::new(4, 4, PixelFormat::Rgba8888));
    queue.queue_item(
        cpu_consumer::BufferItem::new(0, buffer.clone())
            .with_fence(cpu_consumer::Fence::new(dev_null_fd())),
    );

    let view = lock(&consumer);
    assert_eq!(buffer.acquire_fences_seen(), 1);
    assert!(consumer.unlock_buffer(&view).is_ok());
}

#[test]
fn test_release_fence_forwarded_on_unlock() {
    let (consumer, queue) = consumer(1);
    let buffer = queue_rgba(&queue, 3);
    let view = lock(&consumer);

    buffer.set_unlock_fence(dev_null_fd());
    assert!(consumer.unlock_buffer(&view).is_ok());

    let released = queue.take_released();
    assert_eq!(released.len(), 1);
    assert!(released[0].fence.is_valid());
}

#[test]
fn test_failed_unlock_keeps_lock_for_retry() {
    let (consumer, queue) = consumer(1);
    let buffer = queue_rgba(&queue, 0);
    let view = lock(&consumer);

    buffer.fail_next_unlock(BufferError::new(status::INVALID_OPERATION, "device busy"));
    let err = consumer.unlock_buffer(&view).err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Io));
    assert_eq!(consumer.locked_buffer_count(), 1);
    assert_eq!(queue.release_count(), 0);

    assert!(consumer.unlock_buffer(&view).is_ok());
    assert_eq!(consumer.locked_buffer_count(), 0);
    assert_eq!(queue.release_count(), 1);
}

#[test]
fn test_failed_lock_releases_acquired_buffer() {
    let (consumer, queue) = consumer(1);
    let buffer = queue_rgba(&queue, 0);
    buffer.fail_next_lock(BufferError::unsupported("protected content"));

    let err = consumer.lock_next_buffer().err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Io));
    assert_eq!(consumer.locked_buffer_count(), 0);
    assert_eq!(queue.acquired_count(), 0);
    let released = queue.take_released();
    assert_eq!(released.len(), 1);
    assert!(!released[0].fence.is_valid());
}

#[test]
fn test_release_failure_still_frees_entry() {
    let (consumer, queue) = consumer(1);
    queue_rgba(&queue, 0);
    let view = lock(&consumer);

    queue.fail_next_release(QueueError::abandoned());
    assert!(consumer.unlock_buffer(&view).is_ok());
    assert_eq!(consumer.locked_buffer_count(), 0);
}

#[test]
fn test_concurrent_readers_respect_bound() {
    let (consumer, queue) = consumer(3);
    let consumer = Arc::new(consumer);
    let buffers: Vec<_> = (0..6)
        .map(|_| Arc::new(MemoryGraphicBuffer::new(4, 4, PixelFormat::Rgba8888)))
        .collect();

    let producer = {
        let queue = queue.clone();
        let buffers = buffers.clone();
        thread::spawn(move || {
            let mut queued = 0;
            while queued < 200 {
                for slot in queue.free_slots(buffers.len()) {
                    if queued < 200 && queue.queue_buffer(slot, buffers[slot].clone()).is_ok() {
                        queued += 1;
                    }
                }
                thread::yield_now();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let consumer = Arc::clone(&consumer);
            thread::spawn(move || {
                let mut done = 0;
                while done < 50 {
                    match consumer.lock_next_buffer() {
                        Ok(view) => {
                            assert!(consumer.locked_buffer_count() <= 3);
                            if consumer.unlock_buffer(&view).is_ok() {
                                done += 1;
                            }
                        }
                        Err(e) if e.is_transient() || e.kind() == ErrorKind::ResourceExhausted => {
                            thread::yield_now();
                        }
                        Err(e) => panic!("unexpected lock error: {e}"),
                    }
                }
            })
        })
        .collect();

    assert!(producer.join().is_ok());
    for reader in readers {
        assert!(reader.join().is_ok());
    }

    let stats = consumer.stats();
    assert_eq!(stats.total_locks(), 200);
    assert_eq!(stats.unlocks, 200);
    assert!(stats.peak_locked <= 3);
    assert_eq!(consumer.locked_buffer_count(), 0);
    assert_eq!(queue.release_count(), 200);
}
