use embassy_time::Instant;
use libm::roundf;

use crate::{
    WinderCommand,
    config::{WinderConfig, WindingParams},
    error::MotionError,
    hardware::{HomingStatus, Spindle, Traverse},
    move_queue::MoveQueue,
    stepcompress::ConstantVelocityChunks,
    systems::sync::{
        LayerBounds, StepAccumulator, burst_limit, ramp_down_start_turn, required_steps_per_sec,
        sync_interval,
    },
};

// one debug line per this many generated bursts
const SYNC_LOG_EVERY: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindingState {
    Idle,
    RampingUp,
    Winding,
    RampingDown,
    Complete,
    Error,
}

/// Everything the command layer reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WinderStatus {
    pub state: WindingState,
    pub turns_completed: u32,
    pub target_turns: u32,
    pub current_layer: u32,
    pub total_layers: u32,
    pub measured_rpm: f32,
    pub target_rpm: f32,
    pub position_mm: f32,
    pub forward: bool,
    pub queue_depth: usize,
    pub feeding_paused: bool,
    pub emergency_stopped: bool,
    pub homed: bool,
    pub fault: Option<MotionError>,
}

/// Spindle/traverse state machine and the electronic gearing between them.
///
/// `update` must be called every main-loop iteration. The traverse position it
/// works with is feed-forward: where the carriage will be once everything
/// already queued has run. Whenever the queue settles outside a run it is
/// rebuilt from the steps that actually executed, so work dropped by a stop or
/// fault never leaves the two apart.
///
/// A feed hold parks the spindle and freezes synchronization; releasing it
/// ramps back up.
pub struct WindingController<'q, S: Spindle, T: Traverse, const N: usize> {
    queue: &'q MoveQueue<'q, N>,
    spindle: S,
    traverse: T,
    config: WinderConfig,
    params: WindingParams,

    state: WindingState,
    last_fault: Option<MotionError>,
    homing: bool,
    held: bool,

    baseline_pulses: u32,
    turns_completed: u32,
    layer_start_turns: u32,
    current_layer: u32,
    measured_rpm: f32,
    target_rpm: f32,

    position_steps: i32,
    forward: bool,
    accumulator: StepAccumulator,

    ramp_started: Option<Instant>,
    ramp_from_rpm: f32,
    last_sync: Option<Instant>,
    saturated_since: Option<Instant>,
    bursts: u32,
}

impl<'q, S: Spindle, T: Traverse, const N: usize> WindingController<'q, S, T, N> {
    pub fn new(
        queue: &'q MoveQueue<'q, N>,
        spindle: S,
        traverse: T,
        config: WinderConfig,
        params: WindingParams,
    ) -> Self {
        Self {
            queue,
            spindle,
            traverse,
            config,
            params,

            state: WindingState::Idle,
            last_fault: None,
            homing: false,
            held: false,

            baseline_pulses: 0,
            turns_completed: 0,
            layer_start_turns: 0,
            current_layer: 0,
            measured_rpm: 0.0,
            target_rpm: 0.0,

            position_steps: 0,
            forward: true,
            accumulator: StepAccumulator::new(),

            ramp_started: None,
            ramp_from_rpm: 0.0,
            last_sync: None,
            saturated_since: None,
            bursts: 0,
        }
    }

    pub fn get_state(&self) -> WindingState {
        self.state
    }

    pub fn turns_completed(&self) -> u32 {
        self.turns_completed
    }

    /// Turns laid since the last reversal.
    pub fn turns_this_layer(&self) -> u32 {
        self.turns_completed.saturating_sub(self.layer_start_turns)
    }

    pub fn current_rpm(&self) -> f32 {
        self.measured_rpm
    }

    pub fn current_layer(&self) -> u32 {
        self.current_layer
    }

    pub fn last_fault(&self) -> Option<MotionError> {
        self.last_fault
    }

    pub fn params(&self) -> &WindingParams {
        &self.params
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// Feed-forward traverse position.
    pub fn position_mm(&self) -> f32 {
        self.position_steps as f32 / self.config.steps_per_mm
    }

    pub fn spindle(&self) -> &S {
        &self.spindle
    }

    pub fn spindle_mut(&mut self) -> &mut S {
        &mut self.spindle
    }

    pub fn traverse(&self) -> &T {
        &self.traverse
    }

    pub fn traverse_mut(&mut self) -> &mut T {
        &mut self.traverse
    }

    pub fn layer_bounds(&self) -> LayerBounds {
        LayerBounds::new(
            self.params.start_position_mm,
            self.params.layer_width_mm,
            self.config.edge_margin_mm,
        )
    }

    /// Replace the run parameters. Only while idle.
    pub fn set_params(&mut self, params: WindingParams) -> bool {
        if self.state != WindingState::Idle {
            return false;
        }
        self.params = params;
        self.params.calculate_layers();
        log::info!(
            "Params: {} turns @ {} rpm, {} turns/layer, {} layers",
            self.params.target_turns,
            self.params.spindle_rpm,
            self.params.turns_per_layer(),
            self.params.total_layers()
        );
        true
    }

    pub fn start(&mut self) -> bool {
        if self.state != WindingState::Idle || self.homing {
            return false;
        }
        if self.queue.is_emergency_stopped() {
            log::warn!("Start refused: emergency stop latched");
            return false;
        }
        if let Some(fault) = self.last_fault.filter(MotionError::is_latching) {
            log::warn!("Start refused: {} needs a reset", fault);
            return false;
        }
        if self.queue.is_stop_pending() {
            log::warn!("Start refused: emergency stop not yet applied");
            return false;
        }
        if !self.params.is_valid() {
            log::warn!("Start refused: invalid winding parameters");
            return false;
        }

        self.baseline_pulses = self.spindle.pulse_count();
        self.turns_completed = 0;
        self.layer_start_turns = 0;
        self.current_layer = 0;
        self.forward = true;
        self.accumulator.reset();
        self.ramp_started = None;
        self.last_sync = None;
        self.saturated_since = None;
        self.target_rpm = 0.0;
        self.held = false;
        self.resync_position();

        self.traverse.enable();
        self.queue.activate_generator();
        self.queue.resume_feeding();
        self.spindle.set_brake(false);

        let bounds = self.layer_bounds();
        if self.traverse.is_homed() && !bounds.contains(self.traverse.position_mm()) {
            if let Err(e) = self.traverse.move_to(bounds.left_mm) {
                log::warn!("Start refused: cannot reach layer start: {}", e);
                self.halt_outputs();
                return false;
            }
        }
        self.position_steps = roundf(self.traverse.position_mm() * self.config.steps_per_mm) as i32;

        self.state = WindingState::RampingUp;
        log::info!(
            "Winding started: {} turns, {} layers",
            self.params.target_turns,
            self.params.total_layers()
        );
        true
    }

    /// Force Idle from any state.
    pub fn stop(&mut self) {
        self.halt_outputs();
        self.state = WindingState::Idle;
        self.resync_position();
        log::info!("Winding stopped at {} turns", self.turns_completed);
    }

    /// Latch the queue stop and park everything. Cleared only by `reset`.
    pub fn emergency_stop(&mut self) {
        self.queue.emergency_stop();
        self.halt_outputs();
        self.last_fault = Some(MotionError::EmergencyStop);
        self.state = WindingState::Error;
        log::warn!("Emergency stop");
    }

    /// Back to Idle with counters and faults cleared. Homing is kept.
    pub fn reset(&mut self) {
        self.halt_outputs();
        self.queue.reset_emergency_stop();
        self.turns_completed = 0;
        self.layer_start_turns = 0;
        self.current_layer = 0;
        self.target_rpm = 0.0;
        self.accumulator.reset();
        self.ramp_started = None;
        self.last_sync = None;
        self.saturated_since = None;
        self.last_fault = None;
        self.homing = false;
        self.state = WindingState::Idle;
        self.resync_position();
        log::info!("Reset");
    }

    /// Start homing the traverse; progress is driven by `update`.
    pub fn home(&mut self) -> bool {
        if self.state != WindingState::Idle || self.queue.is_emergency_stopped() {
            return false;
        }
        self.homing = true;
        true
    }

    pub fn is_homing(&self) -> bool {
        self.homing
    }

    pub fn update(&mut self, now: Instant) {
        if self.homing {
            self.poll_homing();
        }

        match self.state {
            WindingState::Idle | WindingState::Complete | WindingState::Error => {
                self.resync_position();
                return;
            }
            _ => {}
        }

        if self.queue.is_emergency_stopped() {
            self.fault(MotionError::EmergencyStop);
            return;
        }

        self.measured_rpm = self.spindle.rpm();
        self.count_turns();

        if self.queue.is_feeding_paused() {
            self.hold_feed();
            return;
        }
        if self.held {
            self.release_feed(now);
        }

        match self.state {
            WindingState::RampingUp => self.ramp_up(now),
            WindingState::Winding => self.wind(now),
            WindingState::RampingDown => self.ramp_down(now),
            _ => {}
        }
    }

    pub fn status(&self) -> WinderStatus {
        WinderStatus {
            state: self.state,
            turns_completed: self.turns_completed,
            target_turns: self.params.target_turns,
            current_layer: self.current_layer,
            total_layers: self.params.total_layers(),
            measured_rpm: self.measured_rpm,
            target_rpm: self.target_rpm,
            position_mm: self.position_mm(),
            forward: self.forward,
            queue_depth: self.queue.queue_depth(),
            feeding_paused: self.queue.is_feeding_paused(),
            emergency_stopped: self.queue.is_emergency_stopped(),
            homed: self.traverse.is_homed(),
            fault: self.last_fault,
        }
    }

    /// Apply one operator command. False if it was refused in the current state.
    pub fn handle_command(&mut self, command: WinderCommand) -> bool {
        match command {
            WinderCommand::Start => self.start(),
            WinderCommand::Stop => {
                self.stop();
                true
            }
            WinderCommand::EmergencyStop => {
                self.emergency_stop();
                true
            }
            WinderCommand::Reset => {
                self.reset();
                true
            }
            WinderCommand::Home => self.home(),
            WinderCommand::PauseFeed => {
                self.queue.pause_feeding();
                true
            }
            WinderCommand::ResumeFeed => {
                self.queue.resume_feeding();
                !self.queue.is_feeding_paused()
            }
            WinderCommand::SetParams(params) => self.set_params(params),
            WinderCommand::Status => {
                let s = self.status();
                log::info!(
                    "{:?} turns {}/{} layer {}/{} rpm {} pos {} mm queue {} fault {:?}",
                    s.state,
                    s.turns_completed,
                    s.target_turns,
                    s.current_layer,
                    s.total_layers,
                    s.measured_rpm,
                    s.position_mm,
                    s.queue_depth,
                    s.fault
                );
                true
            }
        }
    }

    fn poll_homing(&mut self) {
        match self.traverse.home() {
            HomingStatus::InProgress => {}
            HomingStatus::Complete => {
                self.homing = false;
                self.position_steps =
                    roundf(self.traverse.position_mm() * self.config.steps_per_mm) as i32;
            }
            HomingStatus::Failed(e) => {
                self.homing = false;
                self.last_fault = Some(e);
                self.traverse.disable();
            }
        }
    }

    fn hold_feed(&mut self) {
        if self.held {
            return;
        }
        self.held = true;
        self.target_rpm = 0.0;
        self.spindle.set_rpm(0.0);
        self.saturated_since = None;
        self.last_sync = None;
        self.accumulator.reset();
        log::info!("Feed hold at turn {}", self.turns_completed);
    }

    fn release_feed(&mut self, now: Instant) {
        self.held = false;
        if self.state == WindingState::RampingDown {
            // spindle is already parked, let the ramp run out from zero
            self.ramp_from_rpm = 0.0;
        } else {
            self.state = WindingState::RampingUp;
            self.ramp_started = Some(now);
        }
        log::info!("Feed resumed at turn {}", self.turns_completed);
    }

    /// Take the position from executed steps. Skipped until nothing is queued,
    /// in flight or waiting on a stop.
    fn resync_position(&mut self) {
        if self.homing || !self.queue.is_settled() {
            return;
        }
        self.traverse.resync_position();
        self.position_steps = roundf(self.traverse.position_mm() * self.config.steps_per_mm) as i32;
    }

    fn count_turns(&mut self) {
        let pulses = self.spindle.pulse_count().wrapping_sub(self.baseline_pulses);
        self.turns_completed = pulses / self.config.spindle_pulses_per_rev.max(1);
    }

    fn ramp_up(&mut self, now: Instant) {
        let started = *self.ramp_started.get_or_insert(now);
        let progress = self.ramp_progress(now, started);

        self.target_rpm = self.params.spindle_rpm * progress;
        self.spindle.set_rpm(self.target_rpm);
        self.sync(now);

        if progress >= 1.0 && self.state == WindingState::RampingUp {
            self.state = WindingState::Winding;
            log::info!("At speed: {} rpm", self.target_rpm);
        }
    }

    fn wind(&mut self, now: Instant) {
        if self.ramp_down_due() {
            self.ramp_from_rpm = self.target_rpm;
            self.ramp_started = Some(now);
            self.state = WindingState::RampingDown;
            log::info!("Ramping down at turn {}", self.turns_completed);
        }
        self.sync(now);
    }

    fn ramp_down(&mut self, now: Instant) {
        let started = *self.ramp_started.get_or_insert(now);
        let progress = self.ramp_progress(now, started);

        self.target_rpm = self.ramp_from_rpm * (1.0 - progress);
        self.spindle.set_rpm(self.target_rpm);

        if progress >= 1.0 {
            self.target_rpm = 0.0;
            self.spindle.set_rpm(0.0);
            self.spindle.set_brake(true);
            self.state = WindingState::Complete;
            log::info!(
                "Winding complete: {} turns, {} layers",
                self.turns_completed,
                self.current_layer + 1
            );
            return;
        }
        self.sync(now);
    }

    fn ramp_down_due(&self) -> bool {
        let target = self.params.target_turns;
        if self.turns_completed >= target {
            return true;
        }
        let tuning = &self.config.sync;
        tuning.predictive_ramp_down
            && self.turns_completed
                >= ramp_down_start_turn(
                    target,
                    self.measured_rpm,
                    self.params.ramp_time_sec,
                    tuning,
                )
    }

    fn ramp_progress(&self, now: Instant, started: Instant) -> f32 {
        let ramp_us = self.params.ramp_time_sec * 1_000_000.0;
        if ramp_us <= 0.0 {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(started).as_micros() as f32;
        (elapsed / ramp_us).min(1.0)
    }

    /// One pass of the traverse synchronization.
    fn sync(&mut self, now: Instant) {
        let tuning = self.config.sync;

        if !self.config.within_travel(self.position_mm()) {
            self.fault(MotionError::InvalidTraversePosition);
            return;
        }
        // never skipped: a missed reversal runs the carriage into the end stop
        self.check_edges();

        let sps = required_steps_per_sec(
            self.measured_rpm,
            self.params.pitch_mm(),
            self.config.steps_per_mm,
        );
        if self.measured_rpm < tuning.min_sync_rpm || sps < tuning.min_traverse_sps {
            self.last_sync = Some(now);
            self.accumulator.reset();
            return;
        }

        let Some(last) = self.last_sync else {
            self.last_sync = Some(now);
            return;
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed < sync_interval(self.measured_rpm, &tuning) {
            return;
        }

        if self.queue.queue_depth() >= tuning.queue_high_water {
            let since = *self.saturated_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= tuning.overflow_timeout {
                self.fault(MotionError::QueueOverflowTimeout);
            }
            return;
        }
        if let Some(since) = self.saturated_since.take() {
            log::debug!(
                "Queue drained after {} ms",
                now.saturating_duration_since(since).as_millis()
            );
        }

        let edges = self.layer_bounds().in_steps(self.config.steps_per_mm);
        let max_steps = burst_limit(sps, &tuning)
            .min(edges.steps_to_edge(self.position_steps, self.forward));
        let steps = self.accumulator.steps_for(sps, elapsed, max_steps);
        self.last_sync = Some(now);
        if steps == 0 {
            return;
        }

        self.queue.set_direction(self.forward);
        let mut pushed = 0;
        for chunk in ConstantVelocityChunks::new(steps, sps as f64) {
            if self.queue.push_chunk(chunk).is_err() {
                break;
            }
            pushed += chunk.count;
        }
        self.advance(pushed);

        self.bursts = self.bursts.wrapping_add(1);
        if self.bursts % SYNC_LOG_EVERY == 0 {
            log::debug!(
                "sync: {} rpm {} sps +{} steps pos {} mm depth {}",
                self.measured_rpm,
                sps,
                pushed,
                self.position_mm(),
                self.queue.queue_depth()
            );
        }
    }

    fn check_edges(&mut self) {
        let edges = self.layer_bounds().in_steps(self.config.steps_per_mm);
        if !edges.reached(self.position_steps, self.forward) {
            return;
        }
        self.forward = !self.forward;
        self.current_layer += 1;
        self.layer_start_turns = self.turns_completed;
        self.accumulator.reset();
        log::info!(
            "Layer {} at turn {}, heading {}",
            self.current_layer,
            self.turns_completed,
            if self.forward { "forward" } else { "back" }
        );
    }

    fn advance(&mut self, steps: u32) {
        let steps = steps as i32;
        self.position_steps += if self.forward { steps } else { -steps };
        self.traverse.set_position_mm(self.position_mm());
    }

    fn halt_outputs(&mut self) {
        self.target_rpm = 0.0;
        self.spindle.set_rpm(0.0);
        self.spindle.set_brake(true);
        self.queue.deactivate_generator();
        self.queue.clear_queue();
        self.traverse.disable();
        self.saturated_since = None;
        self.held = false;
    }

    fn fault(&mut self, error: MotionError) {
        log::warn!("Winding fault: {}", error);
        if matches!(
            error,
            MotionError::InvalidTraversePosition | MotionError::EmergencyStop
        ) {
            self.queue.emergency_stop();
        }
        self.halt_outputs();
        self.last_fault = Some(error);
        self.state = WindingState::Error;
    }
}

