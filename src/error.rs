use thiserror::Error;

/// Everything that can go wrong in the motion core.
///
/// None of these are ever raised from the tick context; the tick reports a
/// [`TickOutcome`](crate::move_queue::TickOutcome) and bumps counters instead.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MotionError {
    #[error("Move queue full")]
    QueueFull,
    #[error("Move queue stayed saturated past the overflow timeout")]
    QueueOverflowTimeout,
    #[error("Traverse position outside physical travel")]
    InvalidTraversePosition,
    #[error("Step timing fit is degenerate")]
    DegenerateFit,
    #[error("Emergency stop active")]
    EmergencyStop,
    #[error("Motion profile is not physical (velocity never positive)")]
    InvalidProfile,
    #[error("Chunk buffer too small for the requested move")]
    ChunkBufferFull,
    #[error("Home switch not found within travel")]
    HomingFailed,
    #[error("Traverse is not homed")]
    NotHomed,
}

impl MotionError {
    /// Faults that leave the machine latched until an explicit reset.
    pub fn is_latching(&self) -> bool {
        matches!(
            self,
            MotionError::QueueOverflowTimeout
                | MotionError::InvalidTraversePosition
                | MotionError::EmergencyStop
        )
    }
}
