//! Per-axis chunk queue and the per-tick step advance.
//!
//! Chunks travel through a [`heapless::spsc`] ring split at construction: the
//! producer endpoint belongs to the main loop, the consumer endpoint lives with
//! the rest of the tick's private state behind the consumer lock. The main
//! loop only takes that lock to pop, clear or stop.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use heapless::spsc::{Consumer, Producer, Queue};
use portable_atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::{
    error::MotionError,
    hardware::{StepGenerator, StepOutput},
    stepcompress::{StepChunk, next_interval},
};

/// A chunk tagged with the direction in force when it was pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedChunk {
    chunk: StepChunk,
    forward: bool,
}

/// Backing storage for a [`MoveQueue`]. Holds `N - 1` chunks.
pub type ChunkRing<const N: usize> = Queue<QueuedChunk, N>;

#[derive(Debug, Clone, Copy)]
struct ActiveChunk {
    interval: u32,
    add: i32,
    remaining: u32,
    last_us: u32,
    forward: bool,
}

/// State only the tick (or the main loop, under the lock) touches.
struct ConsumerState<'r, const N: usize> {
    chunks: Consumer<'r, QueuedChunk, N>,
    active: Option<ActiveChunk>,
    enable_applied: Option<bool>,
    direction_applied: Option<bool>,
    generator_applied: bool,
    estop_seen: u32,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Emergency stop latched.
    Halted,
    /// Feed hold.
    Held,
    /// Nothing queued.
    Idle,
    /// Next chunk needs a direction flip; waiting for the generator to drain.
    Waiting,
    /// A chunk was made active. Its first pulse comes on a later tick.
    Loaded,
    /// Steps emitted this tick, pulsed directly or handed to the generator.
    Stepped(u32),
    /// Chunk in flight, nothing due yet.
    Pending,
}

struct Counters {
    ticks: AtomicU32,
    chunks_loaded: AtomicU32,
    steps_emitted: AtomicU32,
    paused_hits: AtomicU32,
    estop_hits: AtomicU32,
    net_steps: AtomicI32,
}

impl Counters {
    const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
            chunks_loaded: AtomicU32::new(0),
            steps_emitted: AtomicU32::new(0),
            paused_hits: AtomicU32::new(0),
            estop_hits: AtomicU32::new(0),
            net_steps: AtomicI32::new(0),
        }
    }
}

/// Snapshot of the tick counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDiagnostics {
    pub ticks: u32,
    pub chunks_loaded: u32,
    pub steps_emitted: u32,
    pub paused_hits: u32,
    pub estop_hits: u32,
    /// Forward minus reverse steps since the last reset.
    pub net_steps: i32,
    pub depth: usize,
    pub active: bool,
}

pub struct MoveQueue<'r, const N: usize> {
    producer: Mutex<CriticalSectionRawMutex, RefCell<Producer<'r, QueuedChunk, N>>>,
    consumer: Mutex<CriticalSectionRawMutex, RefCell<ConsumerState<'r, N>>>,

    enabled: AtomicBool,
    forward: AtomicBool,
    paused: AtomicBool,
    estop: AtomicBool,
    active: AtomicBool,
    generator_requested: AtomicBool,
    generator_active: AtomicBool,

    /// Latches requested and latches the tick has applied to the hardware.
    estop_requests: AtomicU32,
    estop_handled: AtomicU32,
    /// Signed steps that reached the step line. Never reset.
    committed: AtomicI32,

    counters: Counters,
}

impl<'r, const N: usize> MoveQueue<'r, N> {
    const CAPACITY_CHECK: () = assert!(N >= 2, "a move queue needs at least two slots");

    pub fn new(ring: &'r mut ChunkRing<N>) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_CHECK;
        let (producer, chunks) = ring.split();
        Self {
            producer: Mutex::new(RefCell::new(producer)),
            consumer: Mutex::new(RefCell::new(ConsumerState {
                chunks,
                active: None,
                enable_applied: None,
                direction_applied: None,
                generator_applied: false,
                estop_seen: 0,
            })),

            enabled: AtomicBool::new(false),
            forward: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            estop: AtomicBool::new(false),
            active: AtomicBool::new(false),
            generator_requested: AtomicBool::new(false),
            generator_active: AtomicBool::new(false),

            estop_requests: AtomicU32::new(0),
            estop_handled: AtomicU32::new(0),
            committed: AtomicI32::new(0),

            counters: Counters::new(),
        }
    }

    /// Usable slots. One is always left empty.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Enqueue a chunk, tagged with the current direction.
    ///
    /// Producer side only: must not be called from more than one context.
    pub fn push_chunk(&self, chunk: StepChunk) -> Result<(), MotionError> {
        let queued = QueuedChunk {
            chunk,
            forward: self.forward.load(Ordering::Relaxed),
        };
        self.producer
            .lock(|producer| producer.borrow_mut().enqueue(queued))
            .map_err(|_| MotionError::QueueFull)
    }

    /// Remove the oldest queued chunk without executing it.
    pub fn pop_chunk(&self) -> Option<StepChunk> {
        self.consumer
            .lock(|cell| cell.borrow_mut().chunks.dequeue())
            .map(|queued| queued.chunk)
    }

    pub fn has_chunk(&self) -> bool {
        self.queue_depth() > 0
    }

    pub fn queue_depth(&self) -> usize {
        self.producer.lock(|producer| producer.borrow().len())
    }

    pub fn is_full(&self) -> bool {
        self.queue_depth() == self.capacity()
    }

    /// Drop everything queued and abort the chunk in flight.
    ///
    /// Steps already handed to the generator still execute.
    pub fn clear_queue(&self) {
        self.consumer.lock(|cell| {
            let mut state = cell.borrow_mut();
            while state.chunks.dequeue().is_some() {}
            state.active = None;
            self.active.store(false, Ordering::Release);
        });
    }

    /// Requested driver enable. Disabling waits for the generator to drain.
    pub fn set_enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Direction for chunks pushed from now on. The line follows at the next
    /// chunk boundary.
    pub fn set_direction(&self, forward: bool) {
        self.forward.store(forward, Ordering::Release);
    }

    pub fn direction(&self) -> bool {
        self.forward.load(Ordering::Acquire)
    }

    pub fn pause_feeding(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume_feeding(&self) {
        if !self.is_emergency_stopped() {
            self.paused.store(false, Ordering::Release);
        }
    }

    pub fn is_feeding_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Latch a stop: halt stepping, drop queued work, disable the driver.
    ///
    /// Safe from any context. Repeated calls change nothing.
    pub fn emergency_stop(&self) {
        if !self.estop.swap(true, Ordering::AcqRel) {
            self.estop_requests.fetch_add(1, Ordering::AcqRel);
        }
        self.paused.store(true, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
        self.clear_queue();
    }

    /// Release the latch with an empty queue. Outputs stay disabled.
    ///
    /// A stop the tick has not applied yet is still applied on its next run.
    pub fn reset_emergency_stop(&self) {
        self.clear_queue();
        self.estop.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.estop.load(Ordering::Acquire)
    }

    /// A latched stop has not reached the hardware yet.
    pub fn is_stop_pending(&self) -> bool {
        self.estop_requests.load(Ordering::Acquire) != self.estop_handled.load(Ordering::Acquire)
    }

    /// A chunk is in flight.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Nothing queued, nothing in flight and no stop waiting for the tick.
    /// [`committed_steps`](Self::committed_steps) is final once this holds.
    pub fn is_settled(&self) -> bool {
        !self.has_chunk() && !self.is_active() && !self.is_stop_pending()
    }

    /// Signed steps that reached the step line or the generator, minus
    /// generator pulses dropped by an emergency stop.
    pub fn committed_steps(&self) -> i32 {
        self.committed.load(Ordering::Acquire)
    }

    /// Hand the step line to the hardware generator from the next tick on.
    pub fn activate_generator(&self) {
        self.generator_requested.store(true, Ordering::Release);
    }

    /// Return to direct per-tick pulses once the generator has drained.
    pub fn deactivate_generator(&self) {
        self.generator_requested.store(false, Ordering::Release);
    }

    /// Whether the tick has actually switched to the generator.
    pub fn is_generator_active(&self) -> bool {
        self.generator_active.load(Ordering::Acquire)
    }

    pub fn diagnostics(&self) -> QueueDiagnostics {
        QueueDiagnostics {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            chunks_loaded: self.counters.chunks_loaded.load(Ordering::Relaxed),
            steps_emitted: self.counters.steps_emitted.load(Ordering::Relaxed),
            paused_hits: self.counters.paused_hits.load(Ordering::Relaxed),
            estop_hits: self.counters.estop_hits.load(Ordering::Relaxed),
            net_steps: self.counters.net_steps.load(Ordering::Relaxed),
            depth: self.queue_depth(),
            active: self.is_active(),
        }
    }

    pub fn reset_diagnostics(&self) {
        self.counters.ticks.store(0, Ordering::Relaxed);
        self.counters.chunks_loaded.store(0, Ordering::Relaxed);
        self.counters.steps_emitted.store(0, Ordering::Relaxed);
        self.counters.paused_hits.store(0, Ordering::Relaxed);
        self.counters.estop_hits.store(0, Ordering::Relaxed);
        self.counters.net_steps.store(0, Ordering::Relaxed);
    }

    /// Per-tick step advance. Bounded: at most one direct pulse, or as many
    /// generator pushes as it has free slots.
    pub fn tick<H>(&self, now_us: u32, hw: &mut H) -> TickOutcome
    where
        H: StepOutput + StepGenerator,
    {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        self.consumer.lock(|cell| {
            let mut state = cell.borrow_mut();

            let requests = self.estop_requests.load(Ordering::Acquire);
            if requests != state.estop_seen {
                self.apply_emergency_stop(&mut state, hw);
                state.estop_seen = requests;
                self.estop_handled.store(requests, Ordering::Release);
            }

            if self.estop.load(Ordering::Acquire) {
                self.counters.estop_hits.fetch_add(1, Ordering::Relaxed);
                return TickOutcome::Halted;
            }

            if self.paused.load(Ordering::Acquire) {
                self.counters.paused_hits.fetch_add(1, Ordering::Relaxed);
                return TickOutcome::Held;
            }

            let enabled = self.enabled.load(Ordering::Acquire);
            // pulses still buffered in the generator would be lost on a disabled driver
            let draining = !enabled && state.generator_applied && !hw.is_idle();
            if state.enable_applied != Some(enabled) && !draining {
                hw.set_enable(enabled);
                state.enable_applied = Some(enabled);
            }

            self.apply_generator_mode(&mut state, now_us, hw);

            match state.active {
                None => self.load_next(&mut state, now_us, hw),
                Some(_) if state.generator_applied => self.feed_generator(&mut state, hw),
                Some(_) => self.pulse_direct(&mut state, now_us, hw),
            }
        })
    }

    /// Disable, flush the generator and return to direct mode. Pulses the
    /// generator dropped are taken back out of the step count.
    fn apply_emergency_stop<H>(&self, state: &mut ConsumerState<'r, N>, hw: &mut H)
    where
        H: StepOutput + StepGenerator,
    {
        hw.set_enable(false);
        let dropped = hw.emergency_stop();
        if dropped > 0 {
            let forward = state.direction_applied.unwrap_or(true);
            let signed = if forward { dropped as i32 } else { -(dropped as i32) };
            self.committed.fetch_sub(signed, Ordering::AcqRel);
            self.counters.net_steps.fetch_sub(signed, Ordering::Relaxed);
            log::warn!("Emergency stop dropped {} buffered steps", dropped);
        }
        state.enable_applied = Some(false);
        state.active = None;
        state.generator_applied = false;
        self.active.store(false, Ordering::Release);
        self.generator_active.store(false, Ordering::Release);
    }

    fn apply_generator_mode<H>(&self, state: &mut ConsumerState<'r, N>, now_us: u32, hw: &mut H)
    where
        H: StepOutput + StepGenerator,
    {
        let requested = self.generator_requested.load(Ordering::Acquire);
        if requested == state.generator_applied {
            return;
        }

        if requested {
            hw.activate();
            state.generator_applied = true;
        } else if hw.is_idle() {
            // buffered pulses would be lost, so only switch once drained
            hw.deactivate();
            state.generator_applied = false;
            if let Some(active) = state.active.as_mut() {
                active.last_us = now_us;
            }
        }
        self.generator_active
            .store(state.generator_applied, Ordering::Release);
    }

    fn load_next<H>(&self, state: &mut ConsumerState<'r, N>, now_us: u32, hw: &mut H) -> TickOutcome
    where
        H: StepOutput + StepGenerator,
    {
        let Some(next) = state.chunks.peek().copied() else {
            return TickOutcome::Idle;
        };

        let flips = state.direction_applied != Some(next.forward);
        if flips && state.generator_applied && !hw.is_idle() {
            return TickOutcome::Waiting;
        }

        let Some(queued) = state.chunks.dequeue() else {
            return TickOutcome::Idle;
        };
        if flips {
            hw.set_direction(queued.forward);
            state.direction_applied = Some(queued.forward);
        }

        self.counters.chunks_loaded.fetch_add(1, Ordering::Relaxed);
        if queued.chunk.count == 0 {
            return TickOutcome::Loaded;
        }

        state.active = Some(ActiveChunk {
            interval: queued.chunk.interval_us,
            add: queued.chunk.add_us,
            remaining: queued.chunk.count,
            last_us: now_us,
            forward: queued.forward,
        });
        self.active.store(true, Ordering::Release);
        TickOutcome::Loaded
    }

    fn feed_generator<H>(&self, state: &mut ConsumerState<'r, N>, hw: &mut H) -> TickOutcome
    where
        H: StepOutput + StepGenerator,
    {
        // draining toward a handoff
        if !self.generator_requested.load(Ordering::Acquire) {
            return TickOutcome::Pending;
        }
        let Some(active) = state.active.as_mut() else {
            return TickOutcome::Idle;
        };

        let mut pushed = 0;
        while active.remaining > 0 && hw.free_slots() > 0 {
            if !hw.push_interval(active.interval) {
                break;
            }
            active.interval = next_interval(active.interval, active.add);
            active.remaining -= 1;
            pushed += 1;
        }

        let forward = active.forward;
        let finished = active.remaining == 0;
        self.finish_steps(state, pushed, forward, finished)
    }

    fn pulse_direct<H>(&self, state: &mut ConsumerState<'r, N>, now_us: u32, hw: &mut H) -> TickOutcome
    where
        H: StepOutput + StepGenerator,
    {
        let Some(active) = state.active.as_mut() else {
            return TickOutcome::Idle;
        };
        if now_us.wrapping_sub(active.last_us) < active.interval {
            return TickOutcome::Pending;
        }

        hw.pulse();
        // advance by the nominal interval, not to `now`, so tick jitter never accumulates
        active.last_us = active.last_us.wrapping_add(active.interval);
        active.interval = next_interval(active.interval, active.add);
        active.remaining -= 1;

        let forward = active.forward;
        let finished = active.remaining == 0;
        self.finish_steps(state, 1, forward, finished)
    }

    fn finish_steps(
        &self,
        state: &mut ConsumerState<'r, N>,
        steps: u32,
        forward: bool,
        finished: bool,
    ) -> TickOutcome {
        if steps > 0 {
            self.counters
                .steps_emitted
                .fetch_add(steps, Ordering::Relaxed);
            let signed = if forward { steps as i32 } else { -(steps as i32) };
            self.counters.net_steps.fetch_add(signed, Ordering::Relaxed);
            self.committed.fetch_add(signed, Ordering::AcqRel);
        }
        if finished {
            state.active = None;
            self.active.store(false, Ordering::Release);
        }
        if steps > 0 {
            TickOutcome::Stepped(steps)
        } else {
            TickOutcome::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{StepGenerator, StepOutput};

    #[derive(Default)]
    struct Pins {
        pulses: u32,
        direction: Option<bool>,
        enabled: Option<bool>,
        direction_log: std::vec::Vec<(u32, bool)>,
        gen_active: bool,
        fifo: std::collections::VecDeque<u32>,
        gen_stops: u32,
    }

    impl StepOutput for Pins {
        fn pulse(&mut self) {
            self.pulses += 1;
        }
        fn set_direction(&mut self, forward: bool) {
            self.direction = Some(forward);
            self.direction_log.push((self.pulses, forward));
        }
        fn set_enable(&mut self, enabled: bool) {
            self.enabled = Some(enabled);
        }
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
            4 - self.fifo.len()
        }
        fn push_interval(&mut self, interval_us: u32) -> bool {
            if self.fifo.len() == 4 {
                return false;
            }
            self.fifo.push_back(interval_us);
            true
        }
        fn is_idle(&mut self) -> bool {
            self.fifo.is_empty()
        }
        fn emergency_stop(&mut self) -> u32 {
            let dropped = self.fifo.len() as u32;
            self.fifo.clear();
            self.gen_active = false;
            self.gen_stops += 1;
            dropped
        }
    }

    impl Pins {
        fn drain(&mut self) {
            self.pulses += self.fifo.len() as u32;
            self.fifo.clear();
        }
    }

    #[test]
    fn holds_capacity_minus_one() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        for _ in 0..7 {
            queue.push_chunk(StepChunk::constant(100, 1)).unwrap();
        }
        assert_eq!(queue.queue_depth(), 7);
        assert!(queue.is_full());
        assert_eq!(
            queue.push_chunk(StepChunk::constant(100, 1)),
            Err(MotionError::QueueFull)
        );
    }

    #[test]
    fn pop_returns_fifo_order_then_none() {
        let mut ring = ChunkRing::<4>::new();
        let queue = MoveQueue::new(&mut ring);
        assert_eq!(queue.pop_chunk(), None);
        queue.push_chunk(StepChunk::constant(10, 1)).unwrap();
        queue.push_chunk(StepChunk::constant(20, 2)).unwrap();
        assert_eq!(queue.pop_chunk(), Some(StepChunk::constant(10, 1)));
        assert_eq!(queue.pop_chunk(), Some(StepChunk::constant(20, 2)));
        assert_eq!(queue.pop_chunk(), None);
        assert!(!queue.has_chunk());
    }

    #[test]
    fn direct_pulses_follow_chunk_timing() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.set_enable(true);
        queue.push_chunk(StepChunk::new(100, -10, 3)).unwrap();

        assert_eq!(queue.tick(0, &mut pins), TickOutcome::Loaded);
        assert_eq!(pins.enabled, Some(true));
        assert_eq!(queue.tick(50, &mut pins), TickOutcome::Pending);
        assert_eq!(queue.tick(100, &mut pins), TickOutcome::Stepped(1));
        // next due at 100 + 90
        assert_eq!(queue.tick(150, &mut pins), TickOutcome::Pending);
        assert_eq!(queue.tick(200, &mut pins), TickOutcome::Stepped(1));
        // nominal baseline is 190, next due at 270
        assert_eq!(queue.tick(250, &mut pins), TickOutcome::Pending);
        assert_eq!(queue.tick(270, &mut pins), TickOutcome::Stepped(1));
        assert!(!queue.is_active());
        assert_eq!(queue.tick(300, &mut pins), TickOutcome::Idle);
        assert_eq!(pins.pulses, 3);
        assert_eq!(queue.diagnostics().net_steps, 3);
    }

    #[test]
    fn direction_changes_only_between_chunks() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.set_direction(true);
        queue.push_chunk(StepChunk::constant(10, 2)).unwrap();
        queue.set_direction(false);
        queue.push_chunk(StepChunk::constant(10, 2)).unwrap();

        let mut now = 0;
        while queue.has_chunk() || queue.is_active() {
            queue.tick(now, &mut pins);
            now += 10;
        }
        assert_eq!(pins.direction_log, [(0, true), (2, false)]);
        assert_eq!(queue.diagnostics().net_steps, 0);
    }

    #[test]
    fn feed_hold_preserves_queue() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.push_chunk(StepChunk::constant(10, 5)).unwrap();
        queue.push_chunk(StepChunk::constant(10, 5)).unwrap();
        queue.tick(0, &mut pins);

        queue.pause_feeding();
        for now in (10..200).step_by(10) {
            assert_eq!(queue.tick(now, &mut pins), TickOutcome::Held);
        }
        assert_eq!(pins.pulses, 0);
        assert_eq!(queue.queue_depth(), 1);
        assert!(queue.is_active());

        queue.resume_feeding();
        assert_eq!(queue.tick(200, &mut pins), TickOutcome::Stepped(1));
    }

    #[test]
    fn clear_aborts_chunk_in_flight() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.push_chunk(StepChunk::constant(10, 5)).unwrap();
        queue.push_chunk(StepChunk::constant(10, 5)).unwrap();
        queue.tick(0, &mut pins);
        assert!(queue.is_active());

        queue.clear_queue();
        assert_eq!(queue.queue_depth(), 0);
        assert!(!queue.is_active());
        assert_eq!(queue.tick(100, &mut pins), TickOutcome::Idle);
    }

    #[test]
    fn emergency_stop_is_idempotent() {
        let (mut ring_a, mut ring_b) = (ChunkRing::<8>::new(), ChunkRing::<8>::new());
        let once = MoveQueue::new(&mut ring_a);
        let twice = MoveQueue::new(&mut ring_b);
        for queue in [&once, &twice] {
            queue.set_enable(true);
            queue.push_chunk(StepChunk::constant(10, 5)).unwrap();
        }

        once.emergency_stop();
        twice.emergency_stop();
        twice.emergency_stop();

        for queue in [&once, &twice] {
            assert!(queue.is_emergency_stopped());
            assert!(queue.is_feeding_paused());
            assert!(!queue.is_enabled());
            assert_eq!(queue.queue_depth(), 0);
            assert!(!queue.is_active());
        }
        assert_eq!(once.diagnostics(), twice.diagnostics());
    }

    #[test]
    fn emergency_stop_disables_hardware_once() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.set_enable(true);
        queue.tick(0, &mut pins);
        assert_eq!(pins.enabled, Some(true));

        queue.emergency_stop();
        assert_eq!(queue.tick(10, &mut pins), TickOutcome::Halted);
        assert_eq!(queue.tick(20, &mut pins), TickOutcome::Halted);
        assert_eq!(pins.enabled, Some(false));
        assert_eq!(pins.gen_stops, 1);

        // resume cannot lift a latched stop
        queue.resume_feeding();
        assert!(queue.is_feeding_paused());
        assert_eq!(
            queue.push_chunk(StepChunk::constant(10, 1)).map(|_| queue.tick(30, &mut pins)),
            Ok(TickOutcome::Halted)
        );

        queue.reset_emergency_stop();
        assert_eq!(queue.queue_depth(), 0);
        assert_eq!(queue.tick(40, &mut pins), TickOutcome::Idle);
    }

    #[test]
    fn generator_takes_intervals_up_to_fifo_depth() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.activate_generator();
        queue.push_chunk(StepChunk::new(100, 5, 6)).unwrap();

        assert_eq!(queue.tick(0, &mut pins), TickOutcome::Loaded);
        assert!(queue.is_generator_active());
        assert_eq!(queue.tick(50, &mut pins), TickOutcome::Stepped(4));
        assert_eq!(pins.fifo, [100, 105, 110, 115]);
        assert_eq!(queue.tick(100, &mut pins), TickOutcome::Pending);

        pins.drain();
        assert_eq!(queue.tick(150, &mut pins), TickOutcome::Stepped(2));
        assert_eq!(pins.fifo, [120, 125]);
        assert!(!queue.is_active());
    }

    #[test]
    fn handoff_to_direct_waits_for_drain() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.activate_generator();
        queue.push_chunk(StepChunk::constant(100, 6)).unwrap();
        queue.tick(0, &mut pins);
        queue.tick(10, &mut pins);
        assert_eq!(pins.fifo.len(), 4);

        queue.deactivate_generator();
        assert_eq!(queue.tick(20, &mut pins), TickOutcome::Pending);
        assert!(queue.is_generator_active());
        assert_eq!(pins.fifo.len(), 4);

        pins.drain();
        assert_eq!(queue.tick(30, &mut pins), TickOutcome::Pending);
        assert!(!queue.is_generator_active());
        assert!(!pins.gen_active);
        // direct timing restarts from the handoff
        assert_eq!(queue.tick(130, &mut pins), TickOutcome::Stepped(1));
        assert_eq!(queue.tick(230, &mut pins), TickOutcome::Stepped(1));
        assert_eq!(pins.pulses, 6);
    }

    #[test]
    fn generator_direction_flip_waits_for_drain() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.activate_generator();
        queue.push_chunk(StepChunk::constant(100, 2)).unwrap();
        queue.set_direction(false);
        queue.push_chunk(StepChunk::constant(100, 2)).unwrap();

        queue.tick(0, &mut pins);
        assert_eq!(queue.tick(10, &mut pins), TickOutcome::Stepped(2));
        assert_eq!(queue.tick(20, &mut pins), TickOutcome::Waiting);
        assert_eq!(pins.direction, Some(true));

        pins.drain();
        assert_eq!(queue.tick(30, &mut pins), TickOutcome::Loaded);
        assert_eq!(pins.direction, Some(false));
    }

    #[test]
    fn generator_restarts_after_emergency_stop() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.set_enable(true);
        queue.activate_generator();
        queue.push_chunk(StepChunk::constant(100, 6)).unwrap();
        queue.tick(0, &mut pins);
        assert_eq!(queue.tick(10, &mut pins), TickOutcome::Stepped(4));

        queue.emergency_stop();
        assert_eq!(queue.tick(20, &mut pins), TickOutcome::Halted);
        assert!(!pins.gen_active);
        assert!(!queue.is_generator_active());
        // the four buffered intervals never reached the line
        assert_eq!(queue.committed_steps(), 0);

        queue.reset_emergency_stop();
        queue.set_enable(true);
        queue.push_chunk(StepChunk::constant(100, 20)).unwrap();
        let mut now = 30;
        while queue.has_chunk() || queue.is_active() {
            queue.tick(now, &mut pins);
            pins.drain();
            now += 10;
            assert!(now < 10_000, "generator never took the chunk");
        }
        assert!(pins.gen_active);
        assert!(queue.is_generator_active());
        assert_eq!(pins.pulses, 20);
        assert_eq!(queue.committed_steps(), 20);
    }

    #[test]
    fn stop_is_applied_even_if_reset_first() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.set_enable(true);
        queue.activate_generator();
        queue.push_chunk(StepChunk::constant(100, 3)).unwrap();
        queue.tick(0, &mut pins);
        queue.tick(10, &mut pins);
        assert_eq!(pins.fifo.len(), 3);

        queue.emergency_stop();
        queue.reset_emergency_stop();
        assert!(queue.is_stop_pending());
        assert!(!queue.is_settled());

        assert_eq!(queue.tick(20, &mut pins), TickOutcome::Idle);
        assert_eq!(pins.gen_stops, 1);
        assert!(pins.fifo.is_empty());
        assert!(!queue.is_stop_pending());
        assert!(queue.is_settled());
        assert_eq!(queue.committed_steps(), 0);
    }

    #[test]
    fn disable_waits_for_generator_to_drain() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.set_enable(true);
        queue.activate_generator();
        queue.push_chunk(StepChunk::constant(100, 3)).unwrap();
        queue.tick(0, &mut pins);
        queue.tick(10, &mut pins);

        queue.clear_queue();
        queue.set_enable(false);
        queue.tick(20, &mut pins);
        assert_eq!(pins.enabled, Some(true));

        pins.drain();
        queue.tick(30, &mut pins);
        assert_eq!(pins.enabled, Some(false));
        assert_eq!(pins.pulses, 3);
        assert_eq!(queue.committed_steps(), 3);
    }

    #[test]
    fn committed_steps_survive_diagnostic_reset() {
        let mut ring = ChunkRing::<8>::new();
        let queue = MoveQueue::new(&mut ring);
        let mut pins = Pins::default();
        queue.set_direction(false);
        queue.push_chunk(StepChunk::constant(10, 4)).unwrap();
        let mut now = 0;
        while queue.has_chunk() || queue.is_active() {
            queue.tick(now, &mut pins);
            now += 10;
        }
        queue.reset_diagnostics();
        assert_eq!(queue.diagnostics().net_steps, 0);
        assert_eq!(queue.committed_steps(), -4);
    }
}
