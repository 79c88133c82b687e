pub use crate::{
    CommandChannel, CommandReceiver, CommandSender, WinderCommand,
    config::{MOVE_QUEUE_CAPACITY, SyncTuning, WinderConfig, WindingParams},
    diagnostics::DiagnosticMonitor,
    error::MotionError,
    hardware::{
        HomeSwitch, HomingStatus, QueueTraverse, Spindle, StepGenerator, StepOutput, Traverse,
    },
    move_queue::{ChunkRing, MoveQueue, QueueDiagnostics, TickOutcome},
    scheduler::Scheduler,
    stepcompress::{StepChunk, compress_constant_velocity, compress_trapezoid},
    systems::{WinderStatus, WindingController, WindingState},
};
