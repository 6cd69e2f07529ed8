//! Hysteresis gate over a `BoundedQueue`'s occupancy.
//!
//! Without hysteresis a queue sitting right at the high watermark would flap
//! the gate open/closed on every single message. The controller instead
//! opens once occupancy rises above `queue_high_watermark` and stays closed
//! until it falls back to `queue_low_watermark`, the same pattern the
//! teacher's pipeline applied at the channel level before a message bus call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::BackPressureConfig;
use crate::metrics;
use crate::queue::BoundedQueue;

pub struct BackPressureController<T> {
    queue: Arc<BoundedQueue<T>>,
    queue_name: String,
    config: BackPressureConfig,
    engaged: AtomicBool,
}

impl<T> BackPressureController<T> {
    pub fn new(queue: Arc<BoundedQueue<T>>, queue_name: impl Into<String>, config: BackPressureConfig) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            config,
            engaged: AtomicBool::new(false),
        }
    }

    /// Re-evaluates occupancy against the watermarks and returns whether the
    /// gate is (now) engaged. Call this before admitting new work; when
    /// disabled in config the gate never engages.
    pub fn poll(&self) -> bool {
        if !self.config.enabled {
            return false;
        }

        let occupancy = self.queue.occupancy();
        let was_engaged = self.engaged.load(Ordering::Acquire);

        let now_engaged = if was_engaged {
            occupancy > self.config.queue_low_watermark
        } else {
            occupancy >= self.config.queue_high_watermark
        };

        if now_engaged && !was_engaged {
            metrics::record_backpressure(&self.queue_name);
        }
        self.engaged.store(now_engaged, Ordering::Release);
        now_engaged
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(high: f64, low: f64) -> BackPressureConfig {
        BackPressureConfig {
            enabled: true,
            queue_high_watermark: high,
            queue_low_watermark: low,
        }
    }

    #[tokio::test]
    async fn engages_at_high_watermark_and_releases_at_low() {
        let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(10));
        let controller = BackPressureController::new(queue.clone(), "test-queue", config(0.8, 0.5));

        for i in 0..7 {
            queue.put(i, Duration::from_millis(10)).await.unwrap();
        }
        assert!(!controller.poll());

        queue.put(99, Duration::from_millis(10)).await.unwrap();
        assert!(controller.poll());

        for _ in 0..2 {
            queue.get(Duration::from_millis(10)).await.unwrap();
        }
        assert!(controller.poll(), "should stay engaged above the low watermark");

        for _ in 0..2 {
            queue.get(Duration::from_millis(10)).await.unwrap();
        }
        assert!(!controller.poll(), "should release at/below the low watermark");
    }

    #[tokio::test]
    async fn disabled_controller_never_engages() {
        let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
        queue.put(1, Duration::from_millis(10)).await.unwrap();
        queue.put(2, Duration::from_millis(10)).await.unwrap();

        let controller = BackPressureController::new(queue, "disabled-queue", config(0.1, 0.05))
            .tap_disable();
        assert!(!controller.poll());
    }

    impl<T> BackPressureController<T> {
        fn tap_disable(mut self) -> Self {
            self.config.enabled = false;
            self
        }
    }
}
