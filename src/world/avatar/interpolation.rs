//! Interpolation buffer for remote agents.
//!
//! Inbound samples are keyed by timestamp and rendered a fixed delay in
//! the past, so motion between samples is smooth even with jittery
//! arrival. Position and velocity interpolate linearly, rotation
//! spherically. The delay widens when observed latency is high.

use glam::{Quat, Vec3};
use std::collections::VecDeque;
use std::time::Duration;

const MAX_SAMPLES: usize = 32;
const BASE_DELAY: Duration = Duration::from_millis(100);
const HIGH_LATENCY_DELAY: Duration = Duration::from_millis(200);
const HIGH_LATENCY_THRESHOLD: Duration = Duration::from_millis(200);

/// One authoritative state report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Sender timestamp, monotonic per agent.
    pub at: Duration,
    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: Quat,
}

/// Rendered state between two bracketing samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: Quat,
}

#[derive(Debug)]
pub struct InterpolationBuffer {
    samples: VecDeque<Sample>,
    delay: Duration,
}

impl InterpolationBuffer {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            delay: BASE_DELAY,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Widen or narrow the render delay from an observed latency figure.
    pub fn observe_latency(&mut self, latency: Duration) {
        self.delay = if latency > HIGH_LATENCY_THRESHOLD {
            HIGH_LATENCY_DELAY
        } else {
            BASE_DELAY
        };
    }

    /// Insert a sample in timestamp order. Out-of-order arrivals are
    /// placed correctly; duplicates by timestamp replace the older one.
    pub fn push(&mut self, sample: Sample) {
        match self.samples.iter().rposition(|s| s.at <= sample.at) {
            Some(index) if self.samples[index].at == sample.at => {
                self.samples[index] = sample;
            }
            Some(index) => self.samples.insert(index + 1, sample),
            None => self.samples.push_front(sample),
        }
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// State at `now` minus the render delay. Clamps to the newest or
    /// oldest sample when the render time falls outside the buffer.
    pub fn sample_at(&self, now: Duration) -> Option<InterpolatedState> {
        let render_time = now.checked_sub(self.delay)?;
        let newest = self.samples.back()?;
        let oldest = self.samples.front()?;

        if render_time >= newest.at {
            return Some(state_of(newest));
        }
        if render_time <= oldest.at {
            return Some(state_of(oldest));
        }

        let after_index = self
            .samples
            .iter()
            .position(|s| s.at > render_time)
            .expect("render time inside buffer bounds");
        let before = &self.samples[after_index - 1];
        let after = &self.samples[after_index];

        let span = after.at - before.at;
        let t = if span.is_zero() {
            0.0
        } else {
            (render_time - before.at).as_secs_f32() / span.as_secs_f32()
        };

        Some(InterpolatedState {
            position: before.position.lerp(after.position, t),
            velocity: before.velocity.lerp(after.velocity, t),
            rotation: before.rotation.slerp(after.rotation, t),
        })
    }

    /// Drop samples older than the render window needs.
    pub fn prune(&mut self, now: Duration) {
        let Some(render_time) = now.checked_sub(self.delay) else {
            return;
        };
        while self.samples.len() > 2 {
            let second_at = self.samples[1].at;
            if second_at < render_time {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for InterpolationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn state_of(sample: &Sample) -> InterpolatedState {
    InterpolatedState {
        position: sample.position,
        velocity: sample.velocity,
        rotation: sample.rotation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64, x: f32) -> Sample {
        Sample {
            at: Duration::from_millis(ms),
            position: Vec3::new(x, 0.0, 0.0),
            velocity: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    #[test]
    fn test_midpoint_interpolation() {
        let mut buffer = InterpolationBuffer::new();
        buffer.push(sample(0, 0.0));
        buffer.push(sample(100, 10.0));

        // Render delay 100 ms: now=150 renders time 50, midway.
        let state = buffer.sample_at(Duration::from_millis(150)).unwrap();
        assert!((state.position.x - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_clamps_outside_buffer() {
        let mut buffer = InterpolationBuffer::new();
        buffer.push(sample(100, 1.0));
        buffer.push(sample(200, 2.0));

        let early = buffer.sample_at(Duration::from_millis(100)).unwrap();
        assert_eq!(early.position.x, 1.0);
        let late = buffer.sample_at(Duration::from_millis(5000)).unwrap();
        assert_eq!(late.position.x, 2.0);
    }

    #[test]
    fn test_out_of_order_insertion() {
        let mut buffer = InterpolationBuffer::new();
        buffer.push(sample(200, 2.0));
        buffer.push(sample(0, 0.0));
        buffer.push(sample(100, 1.0));

        let times: Vec<u64> = buffer.samples.iter().map(|s| s.at.as_millis() as u64).collect();
        assert_eq!(times, vec![0, 100, 200]);
    }

    #[test]
    fn test_rotation_slerp() {
        let mut buffer = InterpolationBuffer::new();
        let quarter = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
        buffer.push(Sample {
            at: Duration::from_millis(0),
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        });
        buffer.push(Sample {
            at: Duration::from_millis(100),
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            rotation: quarter,
        });

        let state = buffer.sample_at(Duration::from_millis(150)).unwrap();
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(state.rotation.dot(expected).abs() > 0.999);
    }

    #[test]
    fn test_latency_adapts_delay() {
        let mut buffer = InterpolationBuffer::new();
        assert_eq!(buffer.delay(), Duration::from_millis(100));
        buffer.observe_latency(Duration::from_millis(250));
        assert_eq!(buffer.delay(), Duration::from_millis(200));
        buffer.observe_latency(Duration::from_millis(50));
        assert_eq!(buffer.delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_prune_keeps_bracketing_samples() {
        let mut buffer = InterpolationBuffer::new();
        for i in 0..10 {
            buffer.push(sample(i * 50, i as f32));
        }
        buffer.prune(Duration::from_millis(500));
        // Still able to interpolate at the render time.
        assert!(buffer.sample_at(Duration::from_millis(500)).is_some());
        assert!(buffer.len() < 10);
    }

    #[test]
    fn test_capacity_bounded() {
        let mut buffer = InterpolationBuffer::new();
        for i in 0..100 {
            buffer.push(sample(i * 10, i as f32));
        }
        assert!(buffer.len() <= MAX_SAMPLES);
    }
}
