mod traverse;

pub use traverse::{HomingStatus, QueueTraverse};

use crate::error::MotionError;

/// Direct control of a stepper driver's step/dir/enable lines.
pub trait StepOutput {
    /// One step pulse. Must leave the step line low.
    fn pulse(&mut self);
    fn set_direction(&mut self, forward: bool);
    fn set_enable(&mut self, enabled: bool);
}

/// An autonomous FIFO-fed pulse generator sharing the step line with [`StepOutput`].
///
/// While active it owns the step line; while inactive the line is driven by
/// [`StepOutput::pulse`] and is idle low.
pub trait StepGenerator {
    fn activate(&mut self);
    fn deactivate(&mut self);
    fn is_active(&self) -> bool;
    /// Intervals that can be pushed without blocking.
    fn free_slots(&mut self) -> usize;
    /// Queue one pulse, `interval_us` after the previous one. False if the FIFO is full.
    fn push_interval(&mut self, interval_us: u32) -> bool;
    /// FIFO empty and no pulse in progress.
    fn is_idle(&mut self) -> bool;
    /// Drop everything buffered and return to the inactive state.
    ///
    /// Returns how many buffered pulses never reached the step line.
    fn emergency_stop(&mut self) -> u32;
}

/// The spindle drive. RPM is already filtered by the driver.
pub trait Spindle {
    fn rpm(&self) -> f32;
    /// Monotonic hall pulse count.
    fn pulse_count(&self) -> u32;
    fn set_rpm(&mut self, rpm: f32);
    fn set_brake(&mut self, engaged: bool);
}

pub trait HomeSwitch {
    fn is_triggered(&self) -> bool;
}

/// The traverse carriage as the winding controller sees it.
pub trait Traverse {
    fn enable(&mut self);
    fn disable(&mut self);
    /// Position the carriage will reach once queued motion has executed.
    fn position_mm(&self) -> f32;
    fn set_position_mm(&mut self, mm: f32);
    /// Re-derive the position from steps actually executed. Only meaningful
    /// once queued motion has settled.
    fn resync_position(&mut self);
    fn is_homed(&self) -> bool;
    /// Rapid move to an absolute position.
    fn move_to(&mut self, mm: f32) -> Result<(), MotionError>;
    /// Advance homing by one step of its sequence; call until it settles.
    fn home(&mut self) -> HomingStatus;
}
