use libm::fabsf;

use super::{HomeSwitch, Traverse};
use crate::{
    config::WinderConfig,
    error::MotionError,
    move_queue::MoveQueue,
    stepcompress::{ConstantVelocityChunks, TrapezoidChunks, TrapezoidProfile},
};

/// Result of one `home()` poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingStatus {
    InProgress,
    Complete,
    Failed(MotionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HomingPhase {
    Idle,
    Seeking { queued_steps: u32 },
    BackingOff,
}

/// Traverse carriage driven through a [`MoveQueue`], homed against a switch at
/// the minimum end of travel.
///
/// The position is fed forward as moves are queued. [`Traverse::resync_position`]
/// rebuilds it from the queue's committed step count relative to an origin taken
/// at construction and at every completed homing.
pub struct QueueTraverse<'q, H, const N: usize> {
    queue: &'q MoveQueue<'q, N>,
    switch: H,
    config: WinderConfig,
    position_mm: f32,
    origin_mm: f32,
    origin_steps: i32,
    homed: bool,
    phase: HomingPhase,
}

impl<'q, H: HomeSwitch, const N: usize> QueueTraverse<'q, H, N> {
    pub fn new(queue: &'q MoveQueue<'q, N>, switch: H, config: WinderConfig) -> Self {
        Self {
            queue,
            switch,
            config,
            position_mm: 0.0,
            origin_mm: 0.0,
            origin_steps: queue.committed_steps(),
            homed: false,
            phase: HomingPhase::Idle,
        }
    }

    pub fn queue(&self) -> &'q MoveQueue<'q, N> {
        self.queue
    }

    pub fn is_homing(&self) -> bool {
        self.phase != HomingPhase::Idle
    }

    fn begin_homing(&mut self) -> HomingStatus {
        log::info!("Homing traverse");
        self.homed = false;
        self.queue.deactivate_generator();
        self.queue.clear_queue();
        self.queue.set_enable(true);
        self.queue.set_direction(false);
        self.phase = HomingPhase::Seeking { queued_steps: 0 };
        HomingStatus::InProgress
    }

    fn seek(&mut self, queued_steps: u32) -> HomingStatus {
        if self.switch.is_triggered() {
            self.queue.clear_queue();
            self.queue.set_direction(true);
            let backoff = self.config.mm_to_steps(self.config.homing_backoff_mm);
            for chunk in ConstantVelocityChunks::new(backoff, self.config.homing_sps as f64) {
                if let Err(e) = self.queue.push_chunk(chunk) {
                    return self.fail(e);
                }
            }
            log::info!("Home switch hit, backing off {} steps", backoff);
            self.phase = HomingPhase::BackingOff;
            return HomingStatus::InProgress;
        }

        let travel = self
            .config
            .mm_to_steps(self.config.max_travel_mm - self.config.min_travel_mm);
        let drained = !self.queue.has_chunk() && !self.queue.is_active();
        if queued_steps >= travel {
            if drained {
                return self.fail(MotionError::HomingFailed);
            }
            return HomingStatus::InProgress;
        }

        // keep one seek chunk ahead so motion never stalls between polls
        if self.queue.queue_depth() < 2 {
            let steps = self.config.homing_seek_steps.min(travel - queued_steps);
            for chunk in ConstantVelocityChunks::new(steps, self.config.homing_sps as f64) {
                if let Err(e) = self.queue.push_chunk(chunk) {
                    return self.fail(e);
                }
            }
            self.phase = HomingPhase::Seeking {
                queued_steps: queued_steps + steps,
            };
        }
        HomingStatus::InProgress
    }

    fn back_off(&mut self) -> HomingStatus {
        if self.queue.has_chunk() || self.queue.is_active() {
            return HomingStatus::InProgress;
        }
        self.position_mm = self.config.min_travel_mm;
        self.origin_mm = self.position_mm;
        self.origin_steps = self.queue.committed_steps();
        self.homed = true;
        self.phase = HomingPhase::Idle;
        log::info!("Traverse homed");
        HomingStatus::Complete
    }

    fn fail(&mut self, error: MotionError) -> HomingStatus {
        log::warn!("Homing failed: {}", error);
        self.queue.clear_queue();
        self.phase = HomingPhase::Idle;
        HomingStatus::Failed(error)
    }
}

impl<H: HomeSwitch, const N: usize> Traverse for QueueTraverse<'_, H, N> {
    fn enable(&mut self) {
        self.queue.set_enable(true);
    }

    fn disable(&mut self) {
        self.queue.set_enable(false);
    }

    fn position_mm(&self) -> f32 {
        self.position_mm
    }

    fn set_position_mm(&mut self, mm: f32) {
        self.position_mm = mm;
    }

    fn resync_position(&mut self) {
        let steps = self.queue.committed_steps().wrapping_sub(self.origin_steps);
        self.position_mm = self.origin_mm + steps as f32 / self.config.steps_per_mm;
    }

    fn is_homed(&self) -> bool {
        self.homed
    }

    /// The whole move is queued or nothing is.
    fn move_to(&mut self, target_mm: f32) -> Result<(), MotionError> {
        if !self.homed {
            return Err(MotionError::NotHomed);
        }
        if !self.config.within_travel(target_mm) {
            return Err(MotionError::InvalidTraversePosition);
        }

        let delta = target_mm - self.position_mm;
        let steps = self.config.mm_to_steps(fabsf(delta));
        if steps == 0 {
            return Ok(());
        }

        // start from the homing rate, known to be safe from standstill
        let profile = TrapezoidProfile::new(
            steps,
            self.config.homing_sps as f64,
            self.config.rapid_sps as f64,
            self.config.rapid_accel as f64,
        )?;
        let needed = TrapezoidChunks::new(profile, self.config.max_fit_error_us)?.count();
        if needed > self.queue.capacity() - self.queue.queue_depth() {
            return Err(MotionError::QueueFull);
        }

        self.queue.set_direction(delta > 0.0);
        for chunk in TrapezoidChunks::new(profile, self.config.max_fit_error_us)? {
            self.queue.push_chunk(chunk)?;
        }

        let moved = self.config.steps_to_mm(steps);
        self.position_mm += if delta > 0.0 { moved } else { -moved };
        log::info!("Traverse moving to {} mm ({} steps)", target_mm, steps);
        Ok(())
    }

    fn home(&mut self) -> HomingStatus {
        match self.phase {
            HomingPhase::Idle => self.begin_homing(),
            HomingPhase::Seeking { queued_steps } => self.seek(queued_steps),
            HomingPhase::BackingOff => self.back_off(),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::{
        hardware::{StepGenerator, StepOutput},
        move_queue::{ChunkRing, TickOutcome},
    };

    struct Switch<'a>(&'a Cell<bool>);

    impl HomeSwitch for Switch<'_> {
        fn is_triggered(&self) -> bool {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct Pins {
        position: i64,
        forward: bool,
        gen_active: bool,
    }

    impl StepOutput for Pins {
        fn pulse(&mut self) {
            self.position += if self.forward { 1 } else { -1 };
        }
        fn set_direction(&mut self, forward: bool) {
            self.forward = forward;
        }
        fn set_enable(&mut self, _enabled: bool) {}
    }

    impl StepGenerator for Pins {
        fn activate(&mut self) {
            self.gen_active = true;
        }
        fn deactivate(&mut self) {
            self.gen_active = false;
        }
        fn is_active(&self) -> bool {
            self.gen_active
        }
        fn free_slots(&mut self) -> usize {
            0
        }
        fn push_interval(&mut self, _interval_us: u32) -> bool {
            false
        }
        fn is_idle(&mut self) -> bool {
            true
        }
        fn emergency_stop(&mut self) -> u32 {
            0
        }
    }

    fn short_travel() -> WinderConfig {
        WinderConfig {
            steps_per_mm: 100.0,
            max_travel_mm: 20.0,
            homing_backoff_mm: 1.0,
            homing_seek_steps: 50,
            homing_sps: 10_000.0,
            ..WinderConfig::default()
        }
    }

    #[test]
    fn homes_against_switch_and_backs_off() {
        let mut ring = ChunkRing::<16>::new();
        let queue = MoveQueue::new(&mut ring);
        let pressed = Cell::new(false);
        let mut traverse = QueueTraverse::new(&queue, Switch(&pressed), short_travel());
        let mut pins = Pins {
            position: 700,
            ..Pins::default()
        };

        let mut now = 0u32;
        let mut triggered_at = None;
        let mut status = traverse.home();
        while status == HomingStatus::InProgress {
            for _ in 0..20 {
                queue.tick(now, &mut pins);
                now += 50;
            }
            if triggered_at.is_none() && pins.position <= 0 {
                triggered_at = Some(pins.position);
                pressed.set(true);
            }
            status = traverse.home();
        }

        assert_eq!(status, HomingStatus::Complete);
        assert!(traverse.is_homed());
        assert_eq!(traverse.position_mm(), 0.0);
        assert_eq!(Some(pins.position - 100), triggered_at);
        assert!(!queue.is_generator_active());
    }

    #[test]
    fn missing_switch_fails_after_full_travel() {
        let mut ring = ChunkRing::<16>::new();
        let queue = MoveQueue::new(&mut ring);
        let never = Cell::new(false);
        let mut traverse = QueueTraverse::new(&queue, Switch(&never), short_travel());
        let mut pins = Pins::default();

        let mut now = 0u32;
        let mut status = traverse.home();
        while status == HomingStatus::InProgress {
            while queue.tick(now, &mut pins) != TickOutcome::Idle {
                now += 50;
            }
            status = traverse.home();
        }

        assert_eq!(status, HomingStatus::Failed(MotionError::HomingFailed));
        assert_eq!(pins.position, -2000);
        assert!(!traverse.is_homed());
    }

    #[test]
    fn move_to_requires_home_and_valid_target() {
        let mut ring = ChunkRing::<16>::new();
        let queue = MoveQueue::new(&mut ring);
        let pressed = Cell::new(true);
        let mut traverse = QueueTraverse::new(&queue, Switch(&pressed), short_travel());
        assert_eq!(traverse.move_to(5.0), Err(MotionError::NotHomed));

        traverse.homed = true;
        assert_eq!(
            traverse.move_to(25.0),
            Err(MotionError::InvalidTraversePosition)
        );
        assert_eq!(
            traverse.move_to(-0.5),
            Err(MotionError::InvalidTraversePosition)
        );

        traverse.move_to(5.0).unwrap();
        assert_eq!(traverse.position_mm(), 5.0);
        assert!(queue.direction());
        let mut total = 0;
        while let Some(chunk) = queue.pop_chunk() {
            total += chunk.count;
        }
        assert_eq!(total, 500);
    }

    #[test]
    fn resync_counts_from_home() {
        let mut ring = ChunkRing::<16>::new();
        let queue = MoveQueue::new(&mut ring);
        let pressed = Cell::new(true);
        let mut traverse = QueueTraverse::new(&queue, Switch(&pressed), short_travel());
        let mut pins = Pins::default();

        let mut now = 0u32;
        let mut status = traverse.home();
        while status == HomingStatus::InProgress {
            while queue.tick(now, &mut pins) != TickOutcome::Idle {
                now += 50;
            }
            status = traverse.home();
        }
        assert_eq!(status, HomingStatus::Complete);
        assert_eq!(queue.committed_steps(), 100);

        traverse.move_to(5.0).unwrap();
        traverse.resync_position();
        // nothing executed yet
        assert_eq!(traverse.position_mm(), 0.0);

        // abort part way
        for _ in 0..40 {
            queue.tick(now, &mut pins);
            now += 50;
        }
        queue.clear_queue();
        traverse.resync_position();
        let executed = queue.committed_steps() - 100;
        assert!(executed > 0 && executed < 500);
        assert_eq!(traverse.position_mm(), executed as f32 / 100.0);
    }
}
