//! Health scoring: a weighted view of connection, consistency, errors,
//! memory, and performance, bucketed into bands for the UI.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBand {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthBand {
    pub fn for_score(score: f32) -> Self {
        if score >= 0.9 {
            HealthBand::Excellent
        } else if score >= 0.8 {
            HealthBand::Good
        } else if score >= 0.6 {
            HealthBand::Fair
        } else if score >= 0.4 {
            HealthBand::Poor
        } else {
            HealthBand::Critical
        }
    }
}

/// Raw inputs, each normalized to [0, 1] where 1 is best, except the
/// rates and pressures which are "fraction bad".
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    /// 1.0 = circuit stable, 0.0 = down.
    pub connection_stability: f32,
    /// 1.0 = no inconsistencies found in the last pass.
    pub state_consistency: f32,
    /// Fraction of processed packets that errored.
    pub error_rate: f32,
    /// Fraction of the critical memory threshold in use.
    pub memory_pressure: f32,
    pub frame_rate: f32,
    pub latency: Duration,
}

impl Default for HealthInputs {
    fn default() -> Self {
        Self {
            connection_stability: 1.0,
            state_consistency: 1.0,
            error_rate: 0.0,
            memory_pressure: 0.0,
            frame_rate: 60.0,
            latency: Duration::from_millis(50),
        }
    }
}

const TARGET_FRAME_RATE: f32 = 60.0;
const LATENCY_CEILING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthReport {
    pub score: f32,
    pub band: HealthBand,
    pub performance: f32,
}

/// Weighted average per the scoring policy. Performance folds frame
/// rate and latency into one figure.
pub fn score(inputs: &HealthInputs) -> HealthReport {
    let frame_score = (inputs.frame_rate / TARGET_FRAME_RATE).clamp(0.0, 1.0);
    let latency_score =
        1.0 - (inputs.latency.as_secs_f32() / LATENCY_CEILING.as_secs_f32()).clamp(0.0, 1.0);
    let performance = (frame_score + latency_score) / 2.0;

    let score = inputs.connection_stability.clamp(0.0, 1.0) * 0.25
        + inputs.state_consistency.clamp(0.0, 1.0) * 0.25
        + (1.0 - inputs.error_rate.clamp(0.0, 1.0)) * 0.20
        + (1.0 - inputs.memory_pressure.clamp(0.0, 1.0)) * 0.15
        + performance * 0.15;

    HealthReport {
        score,
        band: HealthBand::for_score(score),
        performance,
    }
}
