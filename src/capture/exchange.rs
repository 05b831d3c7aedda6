use image::RgbImage;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

struct Slots {
    /// Latest published frame, `None` once the exchange is closed
    grab: Option<RgbImage>,
    /// Number of frames published so far
    count: u64,
}

/// Double-buffer handoff between a capture thread and its consumer
///
/// The capture thread owns the "grab" slot, the consumer owns its "raw"
/// buffer. Buffers change hands by swapping under the lock, so the cost of a
/// handoff does not depend on the frame size.
pub struct FrameExchange {
    slots: Mutex<Slots>,
    ready: Condvar,
    latency_us: AtomicU64,
}

impl Default for FrameExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameExchange {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                grab: Some(RgbImage::new(0, 0)),
                count: 0,
            }),
            ready: Condvar::new(),
            latency_us: AtomicU64::new(0),
        }
    }

    /// Store a freshly captured frame in the grab slot
    ///
    /// Returns `false` if the exchange has been closed, in which case the
    /// frame is discarded and the producer should stop.
    pub fn publish(&self, frame: RgbImage, latency: Duration) -> bool {
        let mut slots = self.slots.lock();
        let Some(grab) = slots.grab.as_mut() else {
            return false;
        };
        let previous = std::mem::replace(grab, frame);
        slots.count += 1;
        drop(slots);
        drop(previous);

        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
        self.ready.notify_one();
        true
    }

    /// Swap the newest frame into `raw` if one arrived since `last_seen`
    ///
    /// On success `raw` holds the new frame and stays untouched by the
    /// producer until the next call.
    pub fn try_advance(&self, last_seen: &mut u64, raw: &mut RgbImage) -> bool {
        let mut slots = self.slots.lock();
        Self::advance(&mut slots, last_seen, raw)
    }

    /// Like `try_advance`, but waits up to `timeout` for a new frame
    pub fn wait_advance(&self, last_seen: &mut u64, raw: &mut RgbImage, timeout: Duration) -> bool {
        let mut slots = self.slots.lock();
        if slots.count == *last_seen && slots.grab.is_some() {
            self.ready.wait_for(&mut slots, timeout);
        }
        Self::advance(&mut slots, last_seen, raw)
    }

    fn advance(slots: &mut Slots, last_seen: &mut u64, raw: &mut RgbImage) -> bool {
        if slots.count == *last_seen {
            return false;
        }
        match slots.grab.as_mut() {
            Some(grab) => std::mem::swap(grab, raw),
            None => return false,
        }
        *last_seen = slots.count;
        true
    }

    /// Release the grab slot; the producer exits on its next publish
    pub fn close(&self) {
        self.slots.lock().grab = None;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.lock().grab.is_none()
    }

    /// Total frames published
    pub fn frames(&self) -> u64 {
        self.slots.lock().count
    }

    /// Acquisition time of the most recent frame
    pub fn last_latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }
}
