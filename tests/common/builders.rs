//! Test data builders for creating test objects

use frame_coordinator::buffer::{BufferPool, BufferSpec, HeapAllocator, ImageFormat};
use frame_coordinator::capture::{CapturedFrame, FrameMetadata};
use frame_coordinator::{CoordinatorConfig, SensorId};
use std::sync::Arc;

/// Builder for small, fast coordinator configs
pub struct ConfigBuilder {
    config: CoordinatorConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = CoordinatorConfig::default();
        config.pipeline.output_width = 32;
        config.pipeline.output_height = 16;
        config.pipeline.output_buffers = 64;
        config.pipeline.node_idle_wait_ms = 5;
        config.task_queue.idle_wait_ms = 5;
        Self { config }
    }

    pub fn workers(mut self, max_workers: usize) -> Self {
        self.config.task_queue.max_workers = max_workers;
        self
    }

    pub fn sensors(mut self, sensors: &[SensorId], initial: SensorId) -> Self {
        self.config.sensor_path.sensors = sensors.to_vec();
        self.config.sensor_path.initial = initial;
        self
    }

    pub fn drain_credits(mut self, credits: u32) -> Self {
        self.config.sensor_path.drain_credits = credits;
        self
    }

    pub fn output_buffers(mut self, count: usize) -> Self {
        self.config.pipeline.output_buffers = count;
        self
    }

    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool of small sensor buffers
pub fn sensor_pool(capacity: usize) -> Arc<BufferPool> {
    let spec = BufferSpec::new("sensor", ImageFormat::Raw10, 32, 16);
    BufferPool::new(spec, capacity, Arc::new(HeapAllocator::new())).unwrap()
}

/// Builder for captured frames
pub struct FrameBuilder {
    frame_number: u64,
    sensor: SensorId,
    will_follow: bool,
}

impl FrameBuilder {
    pub fn new(frame_number: u64) -> Self {
        Self {
            frame_number,
            sensor: SensorId::Wide,
            will_follow: false,
        }
    }

    pub fn sensor(mut self, sensor: SensorId) -> Self {
        self.sensor = sensor;
        self
    }

    pub fn will_follow(mut self, will_follow: bool) -> Self {
        self.will_follow = will_follow;
        self
    }

    pub fn build(self, pool: &Arc<BufferPool>) -> CapturedFrame {
        CapturedFrame {
            frame_number: self.frame_number,
            sensor: self.sensor,
            buffer: pool.acquire().unwrap(),
            metadata: FrameMetadata {
                exposure_ns: 10_000_000,
                iso: 100,
                timestamp_ns: self.frame_number * 33_333_333,
            },
            will_follow: self.will_follow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_builder() {
        let pool = sensor_pool(2);
        let frame = FrameBuilder::new(7)
            .sensor(SensorId::Tele)
            .will_follow(true)
            .build(&pool);

        assert_eq!(frame.frame_number, 7);
        assert_eq!(frame.sensor, SensorId::Tele);
        assert!(frame.will_follow);
        assert_eq!(pool.available(), 1);
    }
}
