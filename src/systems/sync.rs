//! Electronic gearing math: traverse feed derived from spindle speed.

use embassy_time::Duration;
use libm::{ceilf, floorf};

use crate::config::SyncTuning;

/// Traverse rate that lays one `pitch_mm` per spindle revolution, in steps/s.
pub fn required_steps_per_sec(rpm: f32, pitch_mm: f32, steps_per_mm: f32) -> f32 {
    rpm / 60.0 * pitch_mm * steps_per_mm
}

/// How long the queue may go without new chunks at this speed.
///
/// Linear between the two breakpoints, held flat outside them.
pub fn sync_interval(rpm: f32, tuning: &SyncTuning) -> Duration {
    let slow = tuning.interval_at_low_rpm.as_micros() as f32;
    let fast = tuning.interval_at_high_rpm.as_micros() as f32;
    let span = tuning.high_rpm - tuning.low_rpm;

    let t = if span <= 0.0 {
        if rpm >= tuning.high_rpm { 1.0 } else { 0.0 }
    } else {
        ((rpm - tuning.low_rpm) / span).clamp(0.0, 1.0)
    };

    Duration::from_micros((slow + (fast - slow) * t) as u64)
}

/// Most steps a single sync may enqueue at `sps`.
pub fn burst_limit(sps: f32, tuning: &SyncTuning) -> u32 {
    let window = tuning.burst_window.as_micros() as f32 / 1_000_000.0;
    (ceilf(sps * window) as u32).max(1)
}

/// Turn count at which the ramp-down has to begin to land on `target_turns`.
///
/// A linear ramp to zero averages half the current speed, so it consumes
/// `rpm · ramp_time / 120` turns.
pub fn ramp_down_start_turn(
    target_turns: u32,
    rpm: f32,
    ramp_time_sec: f32,
    tuning: &SyncTuning,
) -> u32 {
    let ramp_turns = ceilf(rpm.max(0.0) * ramp_time_sec.max(0.0) / 120.0 * tuning.predictive_gain);
    let earliest = floorf(target_turns as f32 * tuning.predictive_floor.clamp(0.0, 1.0)) as u32;
    target_turns
        .saturating_sub(ramp_turns as u32)
        .max(earliest)
}

/// Layer reversal points, inset by the edge margin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerBounds {
    pub left_mm: f32,
    pub right_mm: f32,
}

impl LayerBounds {
    pub fn new(start_mm: f32, width_mm: f32, margin_mm: f32) -> Self {
        Self {
            left_mm: start_mm + margin_mm,
            right_mm: start_mm + width_mm - margin_mm,
        }
    }

    pub fn contains(&self, mm: f32) -> bool {
        mm >= self.left_mm && mm <= self.right_mm
    }

    /// Nearest whole-step positions on or inside the bounds.
    pub fn in_steps(&self, steps_per_mm: f32) -> LayerEdges {
        LayerEdges {
            left: ceilf(self.left_mm * steps_per_mm) as i32,
            right: floorf(self.right_mm * steps_per_mm) as i32,
        }
    }
}

/// Layer bounds in traverse steps. Edge decisions are made here, in integers,
/// so they never hinge on float rounding of the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerEdges {
    pub left: i32,
    pub right: i32,
}

impl LayerEdges {
    /// The carriage has reached the edge it is heading for.
    pub fn reached(&self, position: i32, forward: bool) -> bool {
        if forward {
            position >= self.right
        } else {
            position <= self.left
        }
    }

    pub fn steps_to_edge(&self, position: i32, forward: bool) -> u32 {
        let remaining = if forward {
            self.right as i64 - position as i64
        } else {
            position as i64 - self.left as i64
        };
        remaining.max(0) as u32
    }
}

/// Converts rate × time into whole steps, carrying the fraction to the next sync.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepAccumulator {
    carry: f32,
}

impl StepAccumulator {
    pub const fn new() -> Self {
        Self { carry: 0.0 }
    }

    /// Whole steps owed for `elapsed` at `sps`, at most `max_steps`.
    ///
    /// A clamped request drops the excess instead of carrying it.
    pub fn steps_for(&mut self, sps: f32, elapsed: Duration, max_steps: u32) -> u32 {
        let owed = sps * elapsed.as_micros() as f32 / 1_000_000.0 + self.carry;
        let whole = floorf(owed.max(0.0));
        if whole >= max_steps as f32 {
            self.carry = 0.0;
            return max_steps;
        }
        self.carry = owed - whole;
        whole as u32
    }

    pub fn reset(&mut self) {
        self.carry = 0.0;
    }
}
