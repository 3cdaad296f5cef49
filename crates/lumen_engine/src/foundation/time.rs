//! Frame timing

use std::time::Instant;

/// Timing information handed to per-frame scene hooks
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTime {
    /// Seconds since the previous frame
    pub delta_time: f32,
    /// Seconds since the timer started
    pub total_time: f32,
    /// Number of frames produced so far
    pub frame_number: u64,
}

/// High-precision timer for frame timing
#[derive(Debug)]
pub struct Timer {
    last_frame: Instant,
    current: FrameTime,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Create a new timer
    pub fn new() -> Self {
        Self {
            last_frame: Instant::now(),
            current: FrameTime::default(),
        }
    }

    /// Advance the timer by one frame (call once per frame)
    pub fn tick(&mut self) -> FrameTime {
        let now = Instant::now();
        let delta_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.current = FrameTime {
            delta_time,
            total_time: self.current.total_time + delta_time,
            frame_number: self.current.frame_number + 1,
        };
        self.current
    }

    /// Timing of the most recent tick
    pub fn current(&self) -> FrameTime {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_accumulates() {
        let mut timer = Timer::new();
        let first = timer.tick();
        let second = timer.tick();
        assert_eq!(first.frame_number, 1);
        assert_eq!(second.frame_number, 2);
        assert!(second.total_time >= first.total_time);
        assert_eq!(timer.current(), second);
    }
}
