use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::Frame;

/// Outcome of `FrameSlot::take`.
#[derive(Debug)]
pub enum SlotRead {
    Frame(Frame),
    Timeout,
    Closed,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    closed: bool,
}

/// Capacity-one hand-off between a capture thread and its reader.
///
/// A new frame replaces an unread one, so the reader only ever sees the
/// newest capture.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `frame`. Returns true when it displaced an unread frame.
    pub fn put(&self, frame: Frame) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let replaced = state.frame.replace(frame).is_some();
        drop(state);
        self.ready.notify_one();
        replaced
    }

    /// Wait up to `timeout` for a frame.
    pub fn take(&self, timeout: Duration) -> SlotRead {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frame.take() {
                return SlotRead::Frame(frame);
            }
            if state.closed {
                return SlotRead::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return SlotRead::Timeout;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drop any pending frame and wake all readers.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.frame = None;
        drop(state);
        self.ready.notify_all();
    }

    pub fn reopen(&self) {
        let mut state = self.lock();
        state.closed = false;
        state.frame = None;
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frame.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::Arc;

    fn frame(ts: f64) -> Frame {
        Frame::solid(2, 2, PixelFormat::Bgr24, [0, 0, 0], ts)
    }

    #[test]
    fn newest_frame_replaces_unread_one() {
        let slot = FrameSlot::new();
        assert!(!slot.put(frame(1.0)));
        assert!(slot.put(frame(2.0)));
        match slot.take(Duration::from_millis(1)) {
            SlotRead::Frame(f) => assert_eq!(f.timestamp, 2.0),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(slot.is_empty());
    }

    #[test]
    fn empty_slot_times_out() {
        let slot = FrameSlot::new();
        let started = Instant::now();
        assert!(matches!(slot.take(Duration::from_millis(20)), SlotRead::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn close_wakes_waiting_reader() {
        let slot = Arc::new(FrameSlot::new());
        let reader = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.take(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        slot.close();
        let read = reader.join().unwrap();
        assert!(matches!(read, SlotRead::Closed));
        assert!(!slot.put(frame(1.0)));
        slot.reopen();
        assert!(!slot.put(frame(1.0)));
        assert!(!slot.is_empty());
    }
}
