use embassy_time::Duration;

use crate::{
    hardware::{StepGenerator, StepOutput},
    move_queue::{MoveQueue, TickOutcome},
};

/// The fixed-rate tick context.
///
/// Owns the step hardware outright; the queue is handed over at construction,
/// so nothing is looked up through globals from the timer path.
pub struct Scheduler<'q, H: StepOutput + StepGenerator, const N: usize> {
    queue: &'q MoveQueue<'q, N>,
    hw: H,
    frequency_hz: u32,
    ticks: u32,
}

impl<'q, H: StepOutput + StepGenerator, const N: usize> Scheduler<'q, H, N> {
    pub fn new(queue: &'q MoveQueue<'q, N>, hw: H, frequency_hz: u32) -> Self {
        Self {
            queue,
            hw,
            frequency_hz: frequency_hz.max(1),
            ticks: 0,
        }
    }

    /// Run one step advance. `now_us` is a free-running, wrapping µs clock.
    #[inline]
    pub fn on_tick(&mut self, now_us: u32) -> TickOutcome {
        self.ticks = self.ticks.wrapping_add(1);
        self.queue.tick(now_us, &mut self.hw)
    }

    pub fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }

    pub fn period(&self) -> Duration {
        Duration::from_hz(self.frequency_hz as u64)
    }

    pub fn tick_count(&self) -> u32 {
        self.ticks
    }

    pub fn queue(&self) -> &'q MoveQueue<'q, N> {
        self.queue
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }
}
