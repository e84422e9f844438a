//! Capture boundary.
//!
//! The hardware capture protocol lives outside this crate. A
//! [`CaptureSource`] hands over finished frames as pooled buffers plus
//! metadata; [`SyntheticCaptureSource`] fabricates them for tests and the
//! demo binary.

use crate::buffer::{BufferError, BufferPool, PooledBuffer};
use crate::sensor_path::SensorId;
use std::sync::Arc;

/// Per-frame sensor metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMetadata {
    pub exposure_ns: u64,
    pub iso: u32,
    pub timestamp_ns: u64,
}

/// One frame delivered by the capture layer.
#[derive(Debug)]
pub struct CapturedFrame {
    pub frame_number: u64,
    pub sensor: SensorId,
    pub buffer: PooledBuffer,
    pub metadata: FrameMetadata,
    /// More frames of the same group follow this one.
    pub will_follow: bool,
}

pub trait CaptureSource: Send {
    /// Next frame, or `Ok(None)` once the source is exhausted. A frame that
    /// could not get a buffer is reported as an error and skipped; the source
    /// keeps producing afterwards.
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, BufferError>;
}

/// Generates frames at a fixed nominal rate, alternating sensors on request.
pub struct SyntheticCaptureSource {
    pool: Arc<BufferPool>,
    sensor: SensorId,
    frame_interval_ns: u64,
    group_size: u32,
    remaining: Option<u64>,
    next_frame_number: u64,
}

impl SyntheticCaptureSource {
    pub fn new(pool: Arc<BufferPool>, sensor: SensorId, fps: u32) -> Self {
        Self {
            pool,
            sensor,
            frame_interval_ns: 1_000_000_000 / u64::from(fps.max(1)),
            group_size: 1,
            remaining: None,
            next_frame_number: 0,
        }
    }

    /// Stop after `count` frames.
    pub fn with_limit(mut self, count: u64) -> Self {
        self.remaining = Some(count);
        self
    }

    /// Frames per group; all but the last of a group carry `will_follow`.
    pub fn with_group_size(mut self, group_size: u32) -> Self {
        self.group_size = group_size.max(1);
        self
    }

    pub fn set_sensor(&mut self, sensor: SensorId) {
        self.sensor = sensor;
    }

    pub fn sensor(&self) -> SensorId {
        self.sensor
    }

    fn capture(&mut self) -> Result<CapturedFrame, BufferError> {
        let mut buffer = self.pool.acquire()?;
        let frame_number = self.next_frame_number;

        // Stamp the frame number so downstream stages can tell frames apart.
        for (dst, src) in buffer.data.iter_mut().zip(frame_number.to_le_bytes()) {
            *dst = src;
        }

        let position = frame_number % u64::from(self.group_size);
        Ok(CapturedFrame {
            frame_number,
            sensor: self.sensor,
            buffer,
            metadata: FrameMetadata {
                exposure_ns: 10_000_000,
                iso: 100,
                timestamp_ns: frame_number * self.frame_interval_ns,
            },
            will_follow: position + 1 < u64::from(self.group_size),
        })
    }
}

impl CaptureSource for SyntheticCaptureSource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, BufferError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }

        let frame = self.capture();
        if let Err(e) = &frame {
            tracing::warn!("Synthetic capture dropped frame {}: {}", self.next_frame_number, e);
        }
        self.next_frame_number += 1;
        frame.map(Some)
    }
}
