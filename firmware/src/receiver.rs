use coil_winder::{WinderCommand, config::WindingParams};
use embassy_rp::rom_data::reset_to_usb_boot;
use embassy_usb_logger::ReceiverHandler;

use crate::COMMANDS;

struct Handler;

impl ReceiverHandler for Handler {
    async fn handle_data(&self, data: &[u8]) {
        if let Ok(data) = core::str::from_utf8(data) {
            let data = data.trim();

            let mut parts = data.split_whitespace();
            if let Some(cmd) = parts.next() {
                let command = match cmd {
                    "start" => WinderCommand::Start,
                    "stop" => WinderCommand::Stop,
                    "estop" | "!" => WinderCommand::EmergencyStop,
                    "reset" => WinderCommand::Reset,
                    "home" => WinderCommand::Home,
                    "pause" => WinderCommand::PauseFeed,
                    "resume" => WinderCommand::ResumeFeed,
                    "status" | "?" => WinderCommand::Status,
                    "params" => {
                        let defaults = WindingParams::default();
                        let turns = parts.next().and_then(|s| s.parse().ok());
                        let mut next = || parts.next().and_then(|s| s.parse::<f32>().ok());

                        WinderCommand::SetParams(WindingParams::new(
                            turns.unwrap_or(defaults.target_turns),
                            next().unwrap_or(defaults.spindle_rpm),
                            next().unwrap_or(defaults.wire_diameter_mm),
                            next().unwrap_or(defaults.layer_width_mm),
                            next().unwrap_or(defaults.start_position_mm),
                            next().unwrap_or(defaults.ramp_time_sec),
                        ))
                    }
                    "q" => {
                        reset_to_usb_boot(0, 0); // Restart the chip
                        return;
                    }
                    _ => {
                        log::info!("Unknown command: {}", cmd);
                        return;
                    }
                };

                COMMANDS.send(command).await;
            }
        }
    }

    fn new() -> Self {
        Self
    }
}

#[embassy_executor::task]
pub async fn usb_comm_task(driver: embassy_rp::usb::Driver<'static, embassy_rp::peripherals::USB>) {
    embassy_usb_logger::run!(1024, log::LevelFilter::Info, driver, Handler);
}
