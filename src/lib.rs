#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod hardware;
pub mod move_queue;
pub mod prelude;
pub mod scheduler;
pub mod stepcompress;
pub mod systems;

use config::WindingParams;

/// Operator requests, from whatever transport the firmware exposes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WinderCommand {
    Start,
    Stop,
    EmergencyStop,
    Reset,
    Home,
    PauseFeed,
    ResumeFeed,
    SetParams(WindingParams),
    Status,
}

const CHANNEL_BUFFER_CAPACITY: usize = 16;

pub type CommandChannel = embassy_sync::channel::Channel<
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    WinderCommand,
    CHANNEL_BUFFER_CAPACITY,
>;

pub type CommandReceiver = embassy_sync::channel::Receiver<
    'static,
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    WinderCommand,
    CHANNEL_BUFFER_CAPACITY,
>;

pub type CommandSender = embassy_sync::channel::Sender<
    'static,
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    WinderCommand,
    CHANNEL_BUFFER_CAPACITY,
>;
