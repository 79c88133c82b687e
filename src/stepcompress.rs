//! Step timing compression.
//!
//! A move is first integrated into absolute step arrival times, then cut into
//! runs whose spacing follows `interval·k + add·k(k−1)/2`. Each run becomes one
//! [`StepChunk`], which is what the move queue stores and the tick executes.

use heapless::Vec;
use libm::{fabs, round};

use crate::error::MotionError;

/// Longest run a single fitted chunk may cover.
pub const MAX_CHUNK_STEPS: usize = 64;

/// Cap on constant-velocity chunks. Bounds how long one chunk occupies the consumer.
pub const MAX_CONSTANT_CHUNK_STEPS: u32 = 5000;

/// Fastest step rate the tick and generator can express with 1 µs resolution.
pub const MAX_STEP_RATE: f64 = 1_000_000.0;

const DEGENERATE_DET: f64 = 1e-12;

/// A run of pulses with linearly changing spacing.
///
/// The first pulse fires `interval_us` after the chunk is loaded. After every
/// pulse the spacing moves by `add_us`, never dropping below 1 µs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepChunk {
    pub interval_us: u32,
    pub add_us: i32,
    pub count: u32,
}

impl StepChunk {
    pub const fn new(interval_us: u32, add_us: i32, count: u32) -> Self {
        Self {
            interval_us,
            add_us,
            count,
        }
    }

    pub const fn constant(interval_us: u32, count: u32) -> Self {
        Self::new(interval_us, 0, count)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Spacing of every pulse exactly as the queue executes it.
    pub fn intervals(&self) -> ChunkIntervals {
        ChunkIntervals {
            interval: self.interval_us,
            add: self.add_us,
            remaining: self.count,
        }
    }

    pub fn duration_us(&self) -> u64 {
        self.intervals().map(u64::from).sum()
    }
}

/// Spacing after one pulse. Shared by the compressor and the tick so both agree.
#[inline]
pub fn next_interval(interval: u32, add: i32) -> u32 {
    (interval as i64 + add as i64).clamp(1, u32::MAX as i64) as u32
}

pub struct ChunkIntervals {
    interval: u32,
    add: i32,
    remaining: u32,
}

impl Iterator for ChunkIntervals {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.interval;
        self.interval = next_interval(self.interval, self.add);
        self.remaining -= 1;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

/// Accelerate from `start_vel` at `accel` per step, then cruise.
///
/// Velocities are in steps/s, acceleration in steps/s gained per step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapezoidProfile {
    total_steps: u32,
    start_vel: f64,
    cruise_vel: f64,
    accel: f64,
}

impl TrapezoidProfile {
    pub fn new(
        total_steps: u32,
        start_vel: f64,
        cruise_vel: f64,
        accel: f64,
    ) -> Result<Self, MotionError> {
        let finite = start_vel.is_finite() && cruise_vel.is_finite() && accel.is_finite();
        if !finite || start_vel < 0.0 || accel < 0.0 {
            return Err(MotionError::InvalidProfile);
        }
        if cruise_vel <= 0.0 || cruise_vel > MAX_STEP_RATE {
            return Err(MotionError::InvalidProfile);
        }
        // velocity never decreases, so the first step is the slowest
        if total_steps > 0 && (start_vel + accel).min(cruise_vel) <= 0.0 {
            return Err(MotionError::InvalidProfile);
        }

        Ok(Self {
            total_steps,
            start_vel,
            cruise_vel,
            accel,
        })
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    /// Absolute arrival time of every step, in µs from the start of the move.
    pub fn arrival_times(&self) -> ArrivalTimes {
        ArrivalTimes {
            remaining: self.total_steps,
            velocity: self.start_vel,
            time_us: 0.0,
            cruise_vel: self.cruise_vel,
            accel: self.accel,
        }
    }
}

pub struct ArrivalTimes {
    remaining: u32,
    velocity: f64,
    time_us: f64,
    cruise_vel: f64,
    accel: f64,
}

impl Iterator for ArrivalTimes {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.velocity = (self.velocity + self.accel).min(self.cruise_vel);
        self.time_us += 1e6 / self.velocity;
        Some(self.time_us)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

enum Fit {
    Accepted { chunk: StepChunk, duration_us: u64 },
    Rejected,
    Degenerate,
}

/// Streaming trapezoid compressor. Holds at most [`MAX_CHUNK_STEPS`] pending
/// arrival times, so it can feed a queue without an intermediate buffer.
pub struct TrapezoidChunks {
    times: ArrivalTimes,
    window: [f64; MAX_CHUNK_STEPS],
    len: usize,
    // executed time of the last emitted step; fits are anchored here so
    // rounding never accumulates across chunks
    base_us: f64,
    max_err_us: f64,
    degenerate_fits: u32,
}

impl TrapezoidChunks {
    pub fn new(profile: TrapezoidProfile, max_err_us: f64) -> Result<Self, MotionError> {
        if !max_err_us.is_finite() || max_err_us < 0.0 {
            return Err(MotionError::InvalidProfile);
        }
        Ok(Self {
            times: profile.arrival_times(),
            window: [0.0; MAX_CHUNK_STEPS],
            len: 0,
            base_us: 0.0,
            max_err_us,
            degenerate_fits: 0,
        })
    }

    /// Chunks that had to fall back to a single step because the fit was singular.
    pub fn degenerate_fits(&self) -> u32 {
        self.degenerate_fits
    }

    fn refill(&mut self) {
        while self.len < MAX_CHUNK_STEPS {
            match self.times.next() {
                Some(t) => {
                    self.window[self.len] = t;
                    self.len += 1;
                }
                None => break,
            }
        }
    }

    fn fit(&self, n: usize) -> Fit {
        let mut s_kk = 0.0;
        let mut s_kq = 0.0;
        let mut s_qq = 0.0;
        let mut s_ky = 0.0;
        let mut s_qy = 0.0;
        for (i, &t) in self.window[..n].iter().enumerate() {
            let k = (i + 1) as f64;
            let q = k * (k - 1.0) / 2.0;
            let y = t - self.base_us;
            s_kk += k * k;
            s_kq += k * q;
            s_qq += q * q;
            s_ky += k * y;
            s_qy += q * y;
        }

        let det = s_kk * s_qq - s_kq * s_kq;
        if fabs(det) < DEGENERATE_DET {
            return Fit::Degenerate;
        }

        // integer add first, then the best interval for that add
        let add = round((s_kk * s_qy - s_kq * s_ky) / det);
        let add = add.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
        let interval = round((s_ky - add as f64 * s_kq) / s_kk);
        let interval = interval.clamp(1.0, u32::MAX as f64) as u32;

        let chunk = StepChunk::new(interval, add, n as u32);
        let mut elapsed = 0u64;
        for (step, t) in chunk.intervals().zip(&self.window[..n]) {
            elapsed += step as u64;
            if fabs(elapsed as f64 - (t - self.base_us)) > self.max_err_us {
                return Fit::Rejected;
            }
        }

        Fit::Accepted {
            chunk,
            duration_us: elapsed,
        }
    }

    fn single_step(&self) -> (StepChunk, u64) {
        let interval = round(self.window[0] - self.base_us).clamp(1.0, u32::MAX as f64) as u32;
        (StepChunk::constant(interval, 1), interval as u64)
    }
}

impl Iterator for TrapezoidChunks {
    type Item = StepChunk;

    fn next(&mut self) -> Option<StepChunk> {
        self.refill();
        if self.len == 0 {
            return None;
        }

        let mut best = None;
        let mut singular = false;
        let (mut lo, mut hi) = (2, self.len);
        while lo <= hi {
            let mid = (lo + hi) / 2;
            match self.fit(mid) {
                Fit::Accepted { chunk, duration_us } => {
                    best = Some((chunk, duration_us));
                    lo = mid + 1;
                }
                Fit::Rejected => hi = mid - 1,
                Fit::Degenerate => {
                    singular = true;
                    hi = mid - 1;
                }
            }
        }

        let (chunk, duration_us) = match best {
            Some(fit) => fit,
            None => {
                if singular {
                    self.degenerate_fits += 1;
                }
                self.single_step()
            }
        };

        let n = chunk.count as usize;
        self.window.copy_within(n..self.len, 0);
        self.len -= n;
        self.base_us += duration_us as f64;
        Some(chunk)
    }
}

/// Fixed-interval chunks, capped at [`MAX_CONSTANT_CHUNK_STEPS`] each.
pub struct ConstantVelocityChunks {
    interval_us: u32,
    remaining: u32,
}

impl ConstantVelocityChunks {
    /// Non-positive or non-finite velocities produce no chunks.
    pub fn new(total_steps: u32, velocity: f64) -> Self {
        if !velocity.is_finite() || velocity <= 0.0 {
            return Self {
                interval_us: 0,
                remaining: 0,
            };
        }
        Self {
            interval_us: round(1e6 / velocity).clamp(1.0, u32::MAX as f64) as u32,
            remaining: total_steps,
        }
    }

    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Iterator for ConstantVelocityChunks {
    type Item = StepChunk;

    fn next(&mut self) -> Option<StepChunk> {
        if self.remaining == 0 {
            return None;
        }
        let count = self.remaining.min(MAX_CONSTANT_CHUNK_STEPS);
        self.remaining -= count;
        Some(StepChunk::constant(self.interval_us, count))
    }
}

/// Compress an accelerate-then-cruise move into at most `N` chunks.
pub fn compress_trapezoid<const N: usize>(
    total_steps: u32,
    start_vel: f64,
    cruise_vel: f64,
    accel: f64,
    max_err_us: f64,
) -> Result<Vec<StepChunk, N>, MotionError> {
    let profile = TrapezoidProfile::new(total_steps, start_vel, cruise_vel, accel)?;
    let mut stream = TrapezoidChunks::new(profile, max_err_us)?;

    let mut chunks = Vec::new();
    for chunk in stream.by_ref() {
        chunks
            .push(chunk)
            .map_err(|_| MotionError::ChunkBufferFull)?;
    }

    if stream.degenerate_fits() > 0 {
        log::warn!(
            "{} degenerate fits while compressing {} steps",
            stream.degenerate_fits(),
            total_steps
        );
    }

    Ok(chunks)
}

pub fn compress_constant_velocity<const N: usize>(
    total_steps: u32,
    velocity: f64,
) -> Result<Vec<StepChunk, N>, MotionError> {
    let mut chunks = Vec::new();
    for chunk in ConstantVelocityChunks::new(total_steps, velocity) {
        chunks
            .push(chunk)
            .map_err(|_| MotionError::ChunkBufferFull)?;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_velocity_splits_at_cap() {
        let chunks = compress_constant_velocity::<8>(12_000, 3000.0).unwrap();
        let counts: std::vec::Vec<u32> = chunks.iter().map(|c| c.count).collect();
        assert_eq!(counts, [5000, 5000, 2000]);
        for chunk in &chunks {
            assert_eq!(chunk.add_us, 0);
            assert_eq!(chunk.interval_us, 333);
        }
    }

    #[test]
    fn empty_requests_yield_no_chunks() {
        assert!(compress_constant_velocity::<4>(0, 1000.0).unwrap().is_empty());
        assert!(compress_constant_velocity::<4>(100, 0.0).unwrap().is_empty());
        assert!(compress_constant_velocity::<4>(100, -5.0).unwrap().is_empty());
        assert!(
            compress_trapezoid::<4>(0, 0.0, 1000.0, 10.0, 20.0)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn cruise_only_profile_packs_full_runs() {
        let chunks = compress_trapezoid::<8>(200, 1000.0, 1000.0, 0.0, 20.0).unwrap();
        let counts: std::vec::Vec<u32> = chunks.iter().map(|c| c.count).collect();
        assert_eq!(counts, [64, 64, 64, 8]);
        assert!(chunks.iter().all(|c| c.interval_us == 1000 && c.add_us == 0));
    }

    #[test]
    fn acceleration_shrinks_intervals() {
        let chunks = compress_trapezoid::<256>(2000, 100.0, 3000.0, 5.0, 20.0).unwrap();
        assert_eq!(chunks.iter().map(|c| c.count).sum::<u32>(), 2000);
        assert!(chunks[0].interval_us > chunks[chunks.len() - 1].interval_us);
        assert!(chunks.iter().any(|c| c.add_us < 0));
    }

    #[test]
    fn non_physical_profiles_are_rejected() {
        assert_eq!(
            TrapezoidProfile::new(10, 0.0, 1000.0, 0.0),
            Err(MotionError::InvalidProfile)
        );
        assert_eq!(
            TrapezoidProfile::new(10, 10.0, 0.0, 1.0),
            Err(MotionError::InvalidProfile)
        );
        assert_eq!(
            TrapezoidProfile::new(10, 10.0, 100.0, -1.0),
            Err(MotionError::InvalidProfile)
        );
        assert_eq!(
            TrapezoidProfile::new(10, f64::NAN, 100.0, 1.0),
            Err(MotionError::InvalidProfile)
        );
        // nothing to integrate, so a zero velocity is harmless
        assert!(TrapezoidProfile::new(0, 0.0, 1000.0, 0.0).is_ok());
    }

    #[test]
    fn undersized_buffer_reports_overflow() {
        assert_eq!(
            compress_constant_velocity::<2>(12_000, 3000.0),
            Err(MotionError::ChunkBufferFull)
        );
        assert_eq!(
            compress_trapezoid::<2>(1000, 1000.0, 1000.0, 0.0, 20.0),
            Err(MotionError::ChunkBufferFull)
        );
    }

    #[test]
    fn interval_floor_holds() {
        let intervals: std::vec::Vec<u32> = StepChunk::new(5, -3, 5).intervals().collect();
        assert_eq!(intervals, [5, 2, 1, 1, 1]);
        assert_eq!(StepChunk::new(5, -3, 5).duration_us(), 10);
    }

    #[test]
    fn single_step_move() {
        let chunks = compress_trapezoid::<4>(1, 0.0, 500.0, 500.0, 20.0).unwrap();
        assert_eq!(chunks.as_slice(), &[StepChunk::constant(2000, 1)]);
    }
}
