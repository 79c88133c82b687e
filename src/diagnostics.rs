use embassy_time::{Duration, Instant};

use crate::move_queue::{MoveQueue, QueueDiagnostics};

/// Periodic queue health report, run from the main loop.
pub struct DiagnosticMonitor<'q, const N: usize> {
    queue: &'q MoveQueue<'q, N>,
    period: Duration,
    last_report: Option<Instant>,
    last: QueueDiagnostics,
    full_seen: u32,
    empty_seen: u32,
}

impl<'q, const N: usize> DiagnosticMonitor<'q, N> {
    pub fn new(queue: &'q MoveQueue<'q, N>, period: Duration) -> Self {
        Self {
            queue,
            period,
            last_report: None,
            last: QueueDiagnostics::default(),
            full_seen: 0,
            empty_seen: 0,
        }
    }

    /// Times the queue was seen full since the last report.
    pub fn full_seen(&self) -> u32 {
        self.full_seen
    }

    /// Times the queue was seen drained (nothing queued, nothing in flight).
    pub fn empty_seen(&self) -> u32 {
        self.empty_seen
    }

    /// Sample the queue; returns the snapshot when a report is due.
    pub fn update(&mut self, now: Instant) -> Option<QueueDiagnostics> {
        let depth = self.queue.queue_depth();
        if depth == self.queue.capacity() {
            self.full_seen += 1;
        } else if depth == 0 && !self.queue.is_active() {
            self.empty_seen += 1;
        }

        let last = *self.last_report.get_or_insert(now);
        if now.saturating_duration_since(last) < self.period {
            return None;
        }
        self.last_report = Some(now);

        let snapshot = self.queue.diagnostics();
        self.report(&snapshot);
        self.last = snapshot;
        self.full_seen = 0;
        self.empty_seen = 0;
        Some(snapshot)
    }

    fn report(&self, now: &QueueDiagnostics) {
        let ticks = now.ticks.wrapping_sub(self.last.ticks);
        let steps = now.steps_emitted.wrapping_sub(self.last.steps_emitted);
        log::info!(
            "queue {}/{} active {} ticks +{} chunks +{} steps +{} net {} full {} empty {}",
            now.depth,
            self.queue.capacity(),
            now.active,
            ticks,
            now.chunks_loaded.wrapping_sub(self.last.chunks_loaded),
            steps,
            now.net_steps,
            self.full_seen,
            self.empty_seen
        );

        if ticks == 0 {
            log::warn!("Step tick is not running");
        }
        if self.queue.is_emergency_stopped() {
            log::warn!("Emergency stop latched");
        } else if self.queue.is_feeding_paused() {
            log::warn!("Feed hold active with {} chunks queued", now.depth);
        } else if now.depth >= self.queue.capacity() / 2 && !now.active && steps == 0 {
            log::warn!("Deep queue ({}) but nothing executing", now.depth);
        }
    }
}
