use coil_winder::config::STEP_GENERATOR_FIFO_DEPTH;
use coil_winder::hardware::{StepGenerator, StepOutput};
use embassy_rp::gpio::{Level, Output};
use embassy_rp::peripherals::{PIN_0, PIO0};
use embassy_rp::pio::{Common, Config, Direction, FifoJoin, StateMachine};
use embassy_time::{Duration, Instant, block_for};
use fixed::traits::ToFixed;
use heapless::Deque;

/// Cycles spent per pulse outside the delay loop (pull, mov, two sets).
const PULSE_OVERHEAD_CYCLES: u32 = 6;

/// Traverse step driver: step line on PIO0 SM0, direction and enable on GPIO.
///
/// The state machine runs at 1 MHz, so every word pushed is a delay in µs
/// before the next pulse. While deactivated the state machine is halted and
/// the step pin is driven by forced `set` instructions.
///
/// The PIO cannot report how far it got, so the expected firing time of every
/// pulse still outstanding (FIFO plus the one in the delay loop) is kept here.
pub struct PioStepper<'d> {
    sm: StateMachine<'d, PIO0, 0>,
    origin: u8,
    dir: Output<'d>,
    enable: Output<'d>,
    active: bool,
    deadlines: Deque<Instant, { STEP_GENERATOR_FIFO_DEPTH + 1 }>,
}

impl<'d> PioStepper<'d> {
    pub fn new(
        common: &mut Common<'d, PIO0>,
        mut sm: StateMachine<'d, PIO0, 0>,
        step_pin: PIN_0,
        dir: Output<'d>,
        enable: Output<'d>,
    ) -> Self {
        let prog = pio::pio_asm!(
            ".wrap_target"
            "pull block"
            "mov x osr" // X = delay in µs
            "delay:"
            "jmp x-- delay"
            "set pins 1 [1]"
            "set pins 0"
            ".wrap"
        );
        let prog = common.load_program(&prog.program);

        let step = common.make_pio_pin(step_pin);

        let mut cfg = Config::default();
        cfg.use_program(&prog, &[]);
        cfg.set_set_pins(&[&step]);
        cfg.fifo_join = FifoJoin::TxOnly;
        cfg.clock_divider = (125.0).to_fixed(); // 125MHz / 125 = 1MHz, one cycle per µs

        sm.set_config(&cfg);
        sm.set_pin_dirs(Direction::Out, &[&step]);

        let mut stepper = Self {
            sm,
            origin: prog.origin,
            dir,
            enable,
            active: false,
            deadlines: Deque::new(),
        };
        stepper.force_step_line(false);
        stepper
    }

    fn force_step_line(&mut self, high: bool) {
        let instr = pio::InstructionOperands::SET {
            destination: pio::SetDestination::PINS,
            data: high as u8,
        }
        .encode();
        unsafe { self.sm.exec_instr(instr) };
    }

    fn halt(&mut self) {
        self.sm.set_enable(false);
        self.sm.clear_fifos();
        self.sm.restart();
        self.force_step_line(false);
        self.active = false;
        self.deadlines.clear();
    }

    /// Pulses not yet fired.
    fn outstanding(&mut self) -> usize {
        let now = Instant::now();
        while self.deadlines.front().is_some_and(|&at| at <= now) {
            self.deadlines.pop_front();
        }
        self.deadlines.len()
    }
}

impl StepOutput for PioStepper<'_> {
    fn pulse(&mut self) {
        self.force_step_line(true);
        block_for(Duration::from_micros(2));
        self.force_step_line(false);
    }

    fn set_direction(&mut self, forward: bool) {
        self.dir.set_level(if forward { Level::High } else { Level::Low });
    }

    fn set_enable(&mut self, enabled: bool) {
        // active low
        self.enable.set_level(if enabled { Level::Low } else { Level::High });
    }
}

impl StepGenerator for PioStepper<'_> {
    fn activate(&mut self) {
        if self.active {
            return;
        }
        self.sm.clear_fifos();
        self.sm.restart();
        unsafe { self.sm.exec_jmp(self.origin) };
        self.sm.set_enable(true);
        self.active = true;
        self.deadlines.clear();
    }

    fn deactivate(&mut self) {
        if self.active {
            self.halt();
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn free_slots(&mut self) -> usize {
        STEP_GENERATOR_FIFO_DEPTH.saturating_sub(self.sm.tx().level() as usize)
    }

    fn push_interval(&mut self, interval_us: u32) -> bool {
        let delay = interval_us.saturating_sub(PULSE_OVERHEAD_CYCLES);
        if !self.sm.tx().try_push(delay) {
            return false;
        }
        self.outstanding();
        // the program stalls on an empty FIFO, so an idle generator restarts its clock here
        let now = Instant::now();
        let from = self.deadlines.back().map_or(now, |&at| at.max(now));
        let at = from + Duration::from_micros(interval_us.max(PULSE_OVERHEAD_CYCLES) as u64);
        if self.deadlines.is_full() {
            self.deadlines.pop_front();
        }
        let _ = self.deadlines.push_back(at);
        true
    }

    fn is_idle(&mut self) -> bool {
        self.sm.tx().empty() && self.outstanding() == 0
    }

    fn emergency_stop(&mut self) -> u32 {
        let dropped = self.outstanding() as u32;
        self.halt();
        dropped
    }
}
