use embassy_time::Duration;
use libm::roundf;

/// Usable depth is one less than this: one slot always stays empty.
pub const MOVE_QUEUE_CAPACITY: usize = 128;

/// Words the hardware step generator can buffer (RP2040 PIO TX FIFO, joined).
pub const STEP_GENERATOR_FIFO_DEPTH: usize = 8;

/// Machine calibration and motion limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WinderConfig {
    pub steps_per_mm: f32,           // traverse steps/mm, calibrated
    pub spindle_pulses_per_rev: u32, // hall pulses per spindle revolution
    pub tick_hz: u32,                // step-advance tick rate
    pub min_travel_mm: f32,
    pub max_travel_mm: f32,
    pub edge_margin_mm: f32, // inset from both layer edges before reversing

    pub homing_sps: f32,       // steps/s while seeking the switch
    pub homing_backoff_mm: f32,
    pub homing_seek_steps: u32, // steps queued per seek chunk

    pub rapid_sps: f32,   // steps/s for positioning moves
    pub rapid_accel: f32, // steps/s gained per step
    pub max_fit_error_us: f64,

    pub sync: SyncTuning,
}

impl Default for WinderConfig {
    fn default() -> Self {
        Self {
            steps_per_mm: 6135.0,
            spindle_pulses_per_rev: 6,
            tick_hz: 20_000,
            min_travel_mm: 0.0,
            max_travel_mm: 200.0,
            edge_margin_mm: 0.5,

            homing_sps: 1500.0,
            homing_backoff_mm: 2.0,
            homing_seek_steps: 1000,

            rapid_sps: 3000.0,
            rapid_accel: 10.0,
            max_fit_error_us: 20.0,

            sync: SyncTuning::default(),
        }
    }
}

impl WinderConfig {
    pub fn mm_to_steps(&self, mm: f32) -> u32 {
        let steps = roundf(mm * self.steps_per_mm);
        if steps <= 0.0 { 0 } else { steps as u32 }
    }

    pub fn steps_to_mm(&self, steps: u32) -> f32 {
        steps as f32 / self.steps_per_mm
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_hz(self.tick_hz as u64)
    }

    pub fn within_travel(&self, mm: f32) -> bool {
        mm >= self.min_travel_mm && mm <= self.max_travel_mm
    }
}

/// Empirically tuned constants of the traverse synchronization loop.
///
/// None of these are load-bearing for correctness; they trade queue headroom
/// against tracking latency and can be retuned per machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncTuning {
    /// Below this spindle speed no traverse motion is generated.
    pub min_sync_rpm: f32,
    /// Below this traverse rate (steps/s) generation is skipped.
    pub min_traverse_sps: f32,

    /// Resync period tolerated at or below `low_rpm`.
    pub interval_at_low_rpm: Duration,
    /// Resync period required at or above `high_rpm`.
    pub interval_at_high_rpm: Duration,
    pub low_rpm: f32,
    pub high_rpm: f32,

    /// Longest stretch of motion a single sync may enqueue, at the current rate.
    pub burst_window: Duration,

    /// Generation is skipped while the queue is at or above this depth.
    pub queue_high_water: usize,
    /// Saturation above the high-water mark for longer than this is fatal.
    pub overflow_timeout: Duration,

    pub predictive_ramp_down: bool,
    /// Scales the estimated turns consumed by the ramp-down.
    pub predictive_gain: f32,
    /// Ramp-down never starts before this fraction of the target turns.
    pub predictive_floor: f32,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            min_sync_rpm: 10.0,
            min_traverse_sps: 1.0,

            interval_at_low_rpm: Duration::from_millis(50),
            interval_at_high_rpm: Duration::from_millis(10),
            low_rpm: 60.0,
            high_rpm: 600.0,

            burst_window: Duration::from_millis(100),

            queue_high_water: 100,
            overflow_timeout: Duration::from_secs(3),

            predictive_ramp_down: true,
            predictive_gain: 1.0,
            predictive_floor: 0.5,
        }
    }
}

/// What to wind. Set once per run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindingParams {
    pub target_turns: u32,
    pub spindle_rpm: f32,
    pub wire_diameter_mm: f32,
    pub layer_width_mm: f32,
    pub start_position_mm: f32,
    pub ramp_time_sec: f32,

    turns_per_layer: u32,
    total_layers: u32,
}

impl Default for WindingParams {
    fn default() -> Self {
        Self::new(1000, 120.0, 0.064, 50.0, 20.0, 10.0)
    }
}

impl WindingParams {
    pub fn new(
        target_turns: u32,
        spindle_rpm: f32,
        wire_diameter_mm: f32,
        layer_width_mm: f32,
        start_position_mm: f32,
        ramp_time_sec: f32,
    ) -> Self {
        let mut params = Self {
            target_turns,
            spindle_rpm,
            wire_diameter_mm,
            layer_width_mm,
            start_position_mm,
            ramp_time_sec,
            turns_per_layer: 0,
            total_layers: 0,
        };
        params.calculate_layers();
        params
    }

    /// Recompute the derived layer counts. Tight winding: pitch = wire diameter.
    pub fn calculate_layers(&mut self) {
        self.turns_per_layer = if self.wire_diameter_mm > 0.0 {
            (self.layer_width_mm / self.wire_diameter_mm) as u32
        } else {
            0
        }
        .max(1);
        self.total_layers = self.target_turns.div_ceil(self.turns_per_layer);
    }

    pub fn turns_per_layer(&self) -> u32 {
        self.turns_per_layer
    }

    pub fn total_layers(&self) -> u32 {
        self.total_layers
    }

    /// Lead of the traverse per spindle revolution.
    pub fn pitch_mm(&self) -> f32 {
        self.wire_diameter_mm
    }

    pub fn is_valid(&self) -> bool {
        self.target_turns > 0
            && self.spindle_rpm > 0.0
            && self.wire_diameter_mm > 0.0
            && self.layer_width_mm > 0.0
            && self.ramp_time_sec >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mm_steps_conversion_is_within_one_step() {
        let config = WinderConfig::default();
        for n in [0u32, 1, 7, 613, 6135, 61_349, 500_000, 1_227_000] {
            let back = config.mm_to_steps(config.steps_to_mm(n));
            assert!(back.abs_diff(n) <= 1, "{n} -> {back}");
        }
    }

    #[test]
    fn negative_distance_converts_to_zero_steps() {
        assert_eq!(WinderConfig::default().mm_to_steps(-3.0), 0);
    }

    #[test]
    fn layers_follow_wire_diameter() {
        let params = WindingParams::new(1000, 120.0, 0.5, 10.0, 20.0, 2.0);
        assert_eq!(params.turns_per_layer(), 20);
        assert_eq!(params.total_layers(), 50);

        let mut narrow = WindingParams::new(5, 120.0, 2.0, 1.0, 0.0, 1.0);
        assert_eq!(narrow.turns_per_layer(), 1);
        assert_eq!(narrow.total_layers(), 5);

        narrow.target_turns = 6;
        narrow.calculate_layers();
        assert_eq!(narrow.total_layers(), 6);
    }
}
