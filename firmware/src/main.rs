#![no_std]
#![no_main]

mod receiver;
mod spindle;
mod step_generator;

use assign_resources::assign_resources;
use coil_winder::prelude::*;
use embassy_executor::{Executor, InterruptExecutor, Spawner};
use embassy_rp::interrupt;
use embassy_rp::interrupt::{InterruptExt, Priority};
use embassy_rp::multicore::{Stack, spawn_core1};
use embassy_rp::{
    bind_interrupts,
    gpio::{Input, Level, Output, Pull},
    peripherals::{PIO0 as pPIO0, USB as pUSB},
    pio::Pio,
    pwm::Pwm,
};
use embassy_time::{Duration, Instant, Ticker};
use panic_probe as _;
use static_cell::StaticCell;

use crate::spindle::PwmSpindle;
use crate::step_generator::PioStepper;

static mut CORE1_STACK: Stack<{ 2 << 13 }> = Stack::new();
static EXECUTOR0: StaticCell<Executor> = StaticCell::new();
static EXECUTOR1: StaticCell<Executor> = StaticCell::new();
/// Step tick, preempting everything else on core 0.
static TICK_EXECUTOR: InterruptExecutor = InterruptExecutor::new();

/// Step chunks from the winding loop (core 1) to the step tick (core 0).
static RING: StaticCell<ChunkRing<MOVE_QUEUE_CAPACITY>> = StaticCell::new();
static QUEUE: StaticCell<Queue> = StaticCell::new();
static COMMANDS: CommandChannel = CommandChannel::new();

const SPINDLE_MAX_RPM: f32 = 1500.0;
const MAIN_LOOP_PERIOD: Duration = Duration::from_millis(1);
const DIAGNOSTIC_PERIOD: Duration = Duration::from_secs(5);

bind_interrupts!(struct Irqs {
    PIO0_IRQ_0 => embassy_rp::pio::InterruptHandler<pPIO0>;
    USBCTRL_IRQ => embassy_rp::usb::InterruptHandler<pUSB>;
});

#[interrupt]
unsafe fn SWI_IRQ_1() {
    unsafe { TICK_EXECUTOR.on_interrupt() }
}

assign_resources! {
    c0: Core0Resources {
        usb: USB,
        led: PIN_25,
        hall: PIN_4,
    }

    tick: TickResources {
        pio: PIO0,
        traverse_step: PIN_0,
        traverse_dir: PIN_1,
        traverse_enable: PIN_6,
    }

    c1: Core1Resources {
        spindle_pwm: PWM_SLICE1,
        spindle_speed: PIN_2,
        spindle_brake: PIN_3,
        home_switch: PIN_5,
    }
}

/// Normally closed switch to ground, open at the home position.
struct LimitSwitch(Input<'static>);

impl HomeSwitch for LimitSwitch {
    fn is_triggered(&self) -> bool {
        self.0.is_high()
    }
}

type Queue = MoveQueue<'static, MOVE_QUEUE_CAPACITY>;

type Winder = WindingController<
    'static,
    PwmSpindle<'static>,
    QueueTraverse<'static, LimitSwitch, MOVE_QUEUE_CAPACITY>,
    MOVE_QUEUE_CAPACITY,
>;

#[cortex_m_rt::entry]
fn main() -> ! {
    let p = embassy_rp::init(Default::default());
    let r = split_resources!(p);

    let queue: &'static Queue = QUEUE.init(MoveQueue::new(RING.init(ChunkRing::new())));

    // the alarm that wakes the tick fires on core 0, so its executor lives here too
    interrupt::SWI_IRQ_1.set_priority(Priority::P1);
    let tick_spawner = TICK_EXECUTOR.start(interrupt::SWI_IRQ_1);
    tick_spawner.spawn(step_tick_task(r.tick, queue)).unwrap();

    spawn_core1(
        p.CORE1,
        unsafe { &mut *core::ptr::addr_of_mut!(CORE1_STACK) },
        move || {
            let executor1 = EXECUTOR1.init(Executor::new());
            executor1.run(move |spawner| spawner.spawn(winding_task(r.c1, queue)).unwrap());
        },
    );

    let executor0 = EXECUTOR0.init(Executor::new());
    executor0.run(move |spawner| spawner.spawn(core0_main(r.c0, spawner)).unwrap());
}

#[embassy_executor::task]
async fn core0_main(r: Core0Resources, spawner: Spawner) {
    let config = WinderConfig::default();

    let usb_driver = embassy_rp::usb::Driver::new(r.usb, Irqs);
    spawner.spawn(receiver::usb_comm_task(usb_driver)).unwrap();

    let hall = Input::new(r.hall, Pull::Up);
    spawner.spawn(spindle::hall_counter_task(hall)).unwrap();
    spawner
        .spawn(spindle::spindle_speed_task(config.spindle_pulses_per_rev))
        .unwrap();

    let mut led = Output::new(r.led, Level::Low);
    let mut ticker = Ticker::every(Duration::from_millis(500));
    loop {
        led.toggle();

        ticker.next().await;
    }
}

/// Main loop: operator commands, controller update, queue health.
#[embassy_executor::task]
async fn winding_task(r: Core1Resources, queue: &'static Queue) {
    let config = WinderConfig::default();

    let pwm = Pwm::new_output_a(r.spindle_pwm, r.spindle_speed, Default::default());
    let brake = Output::new(r.spindle_brake, Level::High);
    let spindle = PwmSpindle::new(pwm, brake, SPINDLE_MAX_RPM);

    let switch = LimitSwitch(Input::new(r.home_switch, Pull::Up));
    let traverse = QueueTraverse::new(queue, switch, config);

    let mut winder: Winder =
        WindingController::new(queue, spindle, traverse, config, WindingParams::default());
    let mut monitor = DiagnosticMonitor::new(queue, DIAGNOSTIC_PERIOD);
    let mut ticker = Ticker::every(MAIN_LOOP_PERIOD);

    loop {
        while let Ok(command) = COMMANDS.try_receive() {
            if !winder.handle_command(command) {
                log::warn!("{:?} refused in {:?}", command, winder.get_state());
            }
        }

        let now = Instant::now();
        winder.update(now);
        monitor.update(now);

        ticker.next().await;
    }
}

/// Fixed-rate step advance.
#[embassy_executor::task]
async fn step_tick_task(r: TickResources, queue: &'static Queue) {
    let config = WinderConfig::default();

    let Pio {
        mut common, sm0, ..
    } = Pio::new(r.pio, Irqs);

    let dir = Output::new(r.traverse_dir, Level::Low);
    let enable = Output::new(r.traverse_enable, Level::High);
    let stepper = PioStepper::new(&mut common, sm0, r.traverse_step, dir, enable);

    let mut scheduler = Scheduler::new(queue, stepper, config.tick_hz);
    log::info!("step tick running at {} Hz", scheduler.frequency_hz());

    let mut ticker = Ticker::every(scheduler.period());
    loop {
        scheduler.on_tick(Instant::now().as_micros() as u32);

        ticker.next().await;
    }
}
