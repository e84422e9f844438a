//! The unit of work routed through the graph.

use crate::buffer::PooledBuffer;
use crate::capture::{CapturedFrame, FrameMetadata};
use crate::sensor_path::{LmvState, SensorId};
use std::time::{Duration, Instant};

/// One frame travelling through the pipeline together with the buffers it
/// currently owns.
#[derive(Debug)]
pub struct FrameRequest {
    /// Assigned by the coordinator, strictly increasing.
    pub request_no: u64,
    pub frame_number: u64,
    pub sensor: SensorId,
    /// Path state at the time the frame was accepted.
    pub lmv_state: LmvState,
    /// Enqueued on drain credit from a sensor that is no longer active.
    pub drain: bool,
    pub will_follow: bool,
    pub metadata: FrameMetadata,
    pub buffers: Vec<PooledBuffer>,
    pub processed_by: Vec<String>,
    pub accepted_at: Instant,
}

impl FrameRequest {
    pub fn new(request_no: u64, frame_number: u64, sensor: SensorId, lmv_state: LmvState) -> Self {
        Self {
            request_no,
            frame_number,
            sensor,
            lmv_state,
            drain: false,
            will_follow: false,
            metadata: FrameMetadata::default(),
            buffers: Vec::new(),
            processed_by: Vec::new(),
            accepted_at: Instant::now(),
        }
    }

    pub fn from_capture(request_no: u64, frame: CapturedFrame, lmv_state: LmvState) -> Self {
        Self {
            request_no,
            frame_number: frame.frame_number,
            sensor: frame.sensor,
            lmv_state,
            drain: frame.sensor != lmv_state.sensor,
            will_follow: frame.will_follow,
            metadata: frame.metadata,
            buffers: vec![frame.buffer],
            processed_by: Vec::new(),
            accepted_at: Instant::now(),
        }
    }

    pub fn mark_processed(&mut self, node: &str) {
        self.processed_by.push(node.to_string());
    }

    /// Total bytes held across all buffers.
    pub fn buffer_bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// Return every buffer to its pool. Returns how many were released.
    pub fn release_buffers(&mut self) -> usize {
        let count = self.buffers.len();
        for buffer in self.buffers.drain(..) {
            buffer.release();
        }
        count
    }

    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }
}

/// Summary emitted by the output node once a request has been fully
/// processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameResult {
    pub request_no: u64,
    pub frame_number: u64,
    pub sensor: SensorId,
    pub lmv_state: LmvState,
    pub drain: bool,
    pub processed_by: Vec<String>,
    pub buffer_count: usize,
    pub buffer_bytes: usize,
    pub latency: Duration,
}

impl FrameResult {
    pub fn from_request(request: &FrameRequest) -> Self {
        Self {
            request_no: request.request_no,
            frame_number: request.frame_number,
            sensor: request.sensor,
            lmv_state: request.lmv_state,
            drain: request.drain,
            processed_by: request.processed_by.clone(),
            buffer_count: request.buffers.len(),
            buffer_bytes: request.buffer_bytes(),
            latency: request.age(),
        }
    }
}
