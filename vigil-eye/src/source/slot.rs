//! Single-slot latest-frame buffer shared between a producer thread and
//! the session loop.
//!
//! The producer overwrites whatever frame has not been taken yet, so the
//! consumer always gets the newest frame and never drains a backlog.

use crate::frame::Frame;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a producer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStatus {
    Running,
    /// Peer closed the connection or sent an empty chunk
    Ended,
    /// Too many consecutive undecodable frames
    Stalled { failures: u32 },
}

/// Outcome of waiting on the slot
#[derive(Debug)]
pub enum SlotRead {
    Frame(Frame),
    Finished(ProducerStatus),
    TimedOut,
}

#[derive(Debug)]
struct SlotState {
    frame: Option<Frame>,
    status: ProducerStatus,
    delivered: u64,
    dropped: u64,
    fps: u32,
}

#[derive(Debug)]
pub struct LatestFrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Default for LatestFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                status: ProducerStatus::Running,
                delivered: 0,
                dropped: 0,
                fps: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Publish a frame, replacing any frame not yet taken
    pub fn put(&self, frame: Frame) {
        let mut state = self.state.lock();
        if state.frame.replace(frame).is_some() {
            state.dropped += 1;
        }
        self.ready.notify_all();
    }

    /// Mark the producer as finished; pending frames stay readable
    pub fn finish(&self, status: ProducerStatus) {
        let mut state = self.state.lock();
        state.status = status;
        self.ready.notify_all();
    }

    pub fn set_fps(&self, fps: u32) {
        self.state.lock().fps = fps;
    }

    pub fn fps(&self) -> u32 {
        self.state.lock().fps
    }

    pub fn status(&self) -> ProducerStatus {
        self.state.lock().status
    }

    /// Frames taken by the consumer and frames overwritten before that
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.delivered, state.dropped)
    }

    /// True if a frame is waiting
    pub fn has_frame(&self) -> bool {
        self.state.lock().frame.is_some()
    }

    /// Take the newest frame, waiting up to `wait` for one to arrive
    pub fn take(&self, wait: Duration) -> SlotRead {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frame.take() {
                state.delivered += 1;
                return SlotRead::Frame(frame);
            }
            if state.status != ProducerStatus::Running {
                return SlotRead::Finished(state.status);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return match state.frame.take() {
                    Some(frame) => {
                        state.delivered += 1;
                        SlotRead::Frame(frame)
                    }
                    None => SlotRead::TimedOut,
                };
            }
        }
    }
}
