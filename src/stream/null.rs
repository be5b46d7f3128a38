use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::MuxSink;
use crate::frame::Frame;

/// One call observed by a `NullSink`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkCall {
    Encode { pts: i64, keyframe: bool },
    Flush,
    Close,
}

/// Shared view of what a `NullSink` received. Stays readable after the sink
/// has moved into a session worker.
#[derive(Clone, Default)]
pub struct NullRecorder {
    calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl NullRecorder {
    fn lock(&self) -> MutexGuard<'_, Vec<SinkCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.lock().clone()
    }

    pub fn pts(&self) -> Vec<i64> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                SinkCall::Encode { pts, .. } => Some(*pts),
                _ => None,
            })
            .collect()
    }

    /// Positions (frame indices) of the keyframes.
    pub fn keyframe_indices(&self) -> Vec<usize> {
        self.lock()
            .iter()
            .filter(|call| matches!(call, SinkCall::Encode { .. }))
            .enumerate()
            .filter_map(|(index, call)| match call {
                SinkCall::Encode { keyframe: true, .. } => Some(index),
                _ => None,
            })
            .collect()
    }
}

/// Sink that encodes nothing. Marks every `gop`-th frame as a keyframe, the
/// way the real encoder is configured to.
pub struct NullSink {
    gop: u32,
    frames: u64,
    last_pts: Option<i64>,
    closed: bool,
    recorder: NullRecorder,
}

impl NullSink {
    pub fn new(gop: u32) -> Self {
        Self {
            gop: gop.max(1),
            frames: 0,
            last_pts: None,
            closed: false,
            recorder: NullRecorder::default(),
        }
    }

    pub fn recorder(&self) -> NullRecorder {
        self.recorder.clone()
    }
}

impl MuxSink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    fn encode(&mut self, _frame: &Frame, pts: i64) -> Result<usize> {
        if self.closed {
            return Err(anyhow!("null sink is closed"));
        }
        if let Some(last) = self.last_pts {
            if pts <= last {
                return Err(anyhow!("pts {} does not advance past {}", pts, last));
            }
        }
        let keyframe = self.frames % self.gop as u64 == 0;
        self.frames += 1;
        self.last_pts = Some(pts);
        self.recorder.lock().push(SinkCall::Encode { pts, keyframe });
        Ok(1)
    }

    fn flush(&mut self) -> Result<usize> {
        self.recorder.lock().push(SinkCall::Flush);
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.recorder.lock().push(SinkCall::Close);
        }
        Ok(())
    }
}
