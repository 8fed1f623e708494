//! Frame type and the bounded freshness queue.
//!
//! `Frame` is the owned pixel buffer that flows through every stage. Once a
//! frame has been published it is never mutated; a stage that wants to draw
//! on one works on its own copy.
//!
//! `FreshnessQueue` is the single-producer/single-consumer channel between
//! capture and detection. Capture runs at sensor rate while inference is
//! typically several times slower, so the queue has a small fixed capacity
//! and drops the *oldest* held frame on overflow. The producer never waits
//! for the consumer; the consumer always sees the freshest frames the
//! producer managed to hand over.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub const RGB_CHANNELS: usize = 3;

/// One captured frame: tightly packed RGB8 pixels plus capture metadata.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Monotonically increasing capture sequence number.
    pub seq: u64,
}

impl Frame {
    /// Build a frame from raw RGB8 data. Fails if the buffer length does not
    /// match `width * height * 3`.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, seq: u64) -> anyhow::Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
            .ok_or_else(|| anyhow::anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow::anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            timestamp_ms: now_ms(),
            seq,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// Replace the pixel data, keeping dimensions and capture metadata.
    /// Used by stages that derive a new image from this frame (enhancement,
    /// annotation) and want the result attributed to the same capture.
    pub fn with_pixels(&self, pixels: Vec<u8>) -> anyhow::Result<Self> {
        let mut out = Self::from_rgb(pixels, self.width, self.height, self.seq)?;
        out.timestamp_ms = self.timestamp_ms;
        Ok(out)
    }
}

/// Milliseconds since the Unix epoch. A clock before the epoch reads as 0
/// rather than an error; capture must not die because the RTC is unset.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ----------------------------------------------------------------------------
// FreshnessQueue
// ----------------------------------------------------------------------------

struct QueueState {
    items: VecDeque<Frame>,
    closed: bool,
    dropped: u64,
}

/// Bounded drop-oldest queue between capture and detection.
///
/// - `put` never blocks beyond mutex acquisition; at capacity the oldest
///   held frame is discarded first.
/// - `get` blocks until a frame is available or the queue is closed, and
///   returns frames oldest-first (overflow discards, it never reorders).
/// - `close` wakes any blocked consumer, which then drains remaining items
///   and finally observes `None`.
pub struct FreshnessQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl FreshnessQueue {
    /// Create a queue with the given capacity. Capacities outside 1..=5 are
    /// clamped: below 1 is meaningless, above 5 defeats the freshness goal.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.clamp(1, 5),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a frame, discarding the oldest held frame if full.
    /// Returns `false` if the queue is closed (the frame is dropped).
    pub fn put(&self, frame: Frame) -> bool {
        let mut state = self.state.lock().expect("freshness queue poisoned");
        if state.closed {
            return false;
        }
        if state.items.len() == self.capacity {
            state.items.pop_front();
            state.dropped += 1;
        }
        state.items.push_back(frame);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Block until a frame is available. Returns `None` once the queue is
    /// closed and drained.
    pub fn get(&self) -> Option<Frame> {
        let mut state = self.state.lock().expect("freshness queue poisoned");
        loop {
            if let Some(frame) = state.items.pop_front() {
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .expect("freshness queue poisoned");
        }
    }

    /// Non-blocking variant of `get`.
    pub fn try_get(&self) -> Option<Frame> {
        self.state
            .lock()
            .expect("freshness queue poisoned")
            .items
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("freshness queue poisoned")
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames discarded due to overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.state.lock().expect("freshness queue poisoned").dropped
    }

    /// Close the queue and wake any blocked consumer.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("freshness queue poisoned");
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(seq: u64) -> Frame {
        Frame::from_rgb(vec![0u8; 4 * 4 * 3], 4, 4, seq).unwrap()
    }

    #[test]
    fn frame_rejects_wrong_buffer_length() {
        assert!(Frame::from_rgb(vec![0u8; 10], 4, 4, 0).is_err());
    }

    #[test]
    fn queue_never_exceeds_capacity_and_evicts_oldest() {
        let queue = FreshnessQueue::new(3);
        for seq in 0..10 {
            queue.put(frame(seq));
            assert!(queue.len() <= 3);
        }
        // After inserting 0..10 into capacity 3, the survivors are the most
        // recent three, oldest-first.
        assert_eq!(queue.dropped(), 7);
        assert_eq!(queue.get().unwrap().seq, 7);
        assert_eq!(queue.get().unwrap().seq, 8);
        assert_eq!(queue.get().unwrap().seq, 9);
        assert!(queue.try_get().is_none());
    }

    #[test]
    fn queue_preserves_fifo_below_capacity() {
        let queue = FreshnessQueue::new(5);
        for seq in 0..4 {
            queue.put(frame(seq));
        }
        for seq in 0..4 {
            assert_eq!(queue.get().unwrap().seq, seq);
        }
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(FreshnessQueue::new(0).capacity(), 1);
        assert_eq!(FreshnessQueue::new(100).capacity(), 5);
    }

    #[test]
    fn get_blocks_until_put() {
        let queue = Arc::new(FreshnessQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.get().map(|f| f.seq))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.put(frame(42));
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue = Arc::new(FreshnessQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.get())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn close_drains_remaining_items_first() {
        let queue = FreshnessQueue::new(3);
        queue.put(frame(1));
        queue.put(frame(2));
        queue.close();
        assert!(!queue.put(frame(3)));
        assert_eq!(queue.get().unwrap().seq, 1);
        assert_eq!(queue.get().unwrap().seq, 2);
        assert!(queue.get().is_none());
    }
}
