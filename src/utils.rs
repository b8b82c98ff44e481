use std::thread;
use std::time::{Duration, Instant};

/// Tracks frames per second over a reporting interval.
pub struct FpsCounter {
    frame_count: u32,
    last_time: Instant,
    interval: Duration,
}

impl FpsCounter {
    /// Reports once per second.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            frame_count: 0,
            last_time: Instant::now(),
            interval,
        }
    }

    /// Counts one frame. Returns the rate once the interval has passed.
    pub fn update(&mut self) -> Option<f32> {
        self.frame_count += 1;
        let elapsed = self.last_time.elapsed();

        if elapsed >= self.interval {
            let fps = self.frame_count as f32 / elapsed.as_secs_f32();
            self.frame_count = 0;
            self.last_time = Instant::now();
            Some(fps)
        } else {
            None
        }
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps away the rest of each frame slot to hold a target rate.
pub struct FramePacer {
    frame_duration: Duration,
    frame_start: Instant,
}

impl FramePacer {
    /// `fps` of 0 disables pacing.
    pub fn new(fps: u32) -> Self {
        let frame_duration = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / fps as f64)
        };
        Self {
            frame_duration,
            frame_start: Instant::now(),
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Blocks until the current slot is over and starts the next one.
    pub fn wait(&mut self) {
        let elapsed = self.frame_start.elapsed();
        if elapsed < self.frame_duration {
            thread::sleep(self.frame_duration - elapsed);
        }
        self.frame_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_reported_after_interval() {
        let mut counter = FpsCounter::with_interval(Duration::from_millis(20));
        assert!(counter.update().is_none());
        thread::sleep(Duration::from_millis(25));
        let fps = counter.update().unwrap();
        assert!(fps > 0.0 && fps < 200.0);
        assert!(counter.update().is_none());
    }

    #[test]
    fn test_pacer_holds_rate() {
        let mut pacer = FramePacer::new(100);
        assert_eq!(pacer.frame_duration(), Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..3 {
            pacer.wait();
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_unpaced() {
        let mut pacer = FramePacer::new(0);
        let start = Instant::now();
        pacer.wait();
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
