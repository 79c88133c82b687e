use coil_winder::hardware::Spindle;
use embassy_rp::gpio::{Input, Output};
use embassy_rp::pwm::{self, Pwm};
use embassy_time::{Duration, Instant, Ticker};
use portable_atomic::{AtomicU32, Ordering};

/// Hall pulses since boot, counted by [`hall_counter_task`].
static HALL_PULSES: AtomicU32 = AtomicU32::new(0);
/// Filtered spindle speed, stored as `f32` bits by [`spindle_speed_task`].
static SPINDLE_RPM: AtomicU32 = AtomicU32::new(0);

const PWM_TOP: u16 = 10_000;
const SPEED_WINDOW: Duration = Duration::from_millis(100);
const RPM_FILTER: f32 = 0.3;

/// Spindle motor: PWM speed reference, brake output and a hall sensor.
pub struct PwmSpindle<'d> {
    pwm: Pwm<'d>,
    pwm_config: pwm::Config,
    brake: Output<'d>,
    max_rpm: f32,
}

impl<'d> PwmSpindle<'d> {
    pub fn new(pwm: Pwm<'d>, brake: Output<'d>, max_rpm: f32) -> Self {
        let mut pwm_config = pwm::Config::default();
        pwm_config.top = PWM_TOP;
        pwm_config.compare_a = 0;

        let mut spindle = Self {
            pwm,
            pwm_config,
            brake,
            max_rpm,
        };
        spindle.pwm.set_config(&spindle.pwm_config);
        spindle.set_brake(true);
        spindle
    }
}

impl Spindle for PwmSpindle<'_> {
    fn rpm(&self) -> f32 {
        f32::from_bits(SPINDLE_RPM.load(Ordering::Relaxed))
    }

    fn pulse_count(&self) -> u32 {
        HALL_PULSES.load(Ordering::Relaxed)
    }

    fn set_rpm(&mut self, rpm: f32) {
        let duty = (rpm / self.max_rpm).clamp(0.0, 1.0);
        self.pwm_config.compare_a = (duty * PWM_TOP as f32) as u16;
        self.pwm.set_config(&self.pwm_config);
    }

    fn set_brake(&mut self, engaged: bool) {
        if engaged {
            self.brake.set_high();
        } else {
            self.brake.set_low();
        }
    }
}

#[embassy_executor::task]
pub async fn hall_counter_task(mut hall: Input<'static>) {
    loop {
        hall.wait_for_rising_edge().await;
        HALL_PULSES.fetch_add(1, Ordering::Relaxed);
    }
}

/// Turns the pulse count into a low-pass filtered RPM every window.
#[embassy_executor::task]
pub async fn spindle_speed_task(pulses_per_rev: u32) {
    let pulses_per_rev = pulses_per_rev.max(1) as f32;
    let mut ticker = Ticker::every(SPEED_WINDOW);
    let mut last_count = HALL_PULSES.load(Ordering::Relaxed);
    let mut last_at = Instant::now();
    let mut filtered = 0.0f32;

    loop {
        ticker.next().await;

        let count = HALL_PULSES.load(Ordering::Relaxed);
        let now = Instant::now();
        let elapsed_min = (now - last_at).as_micros() as f32 / 60_000_000.0;
        if elapsed_min > 0.0 {
            let rpm = count.wrapping_sub(last_count) as f32 / pulses_per_rev / elapsed_min;
            filtered += (rpm - filtered) * RPM_FILTER;
            SPINDLE_RPM.store(filtered.to_bits(), Ordering::Relaxed);
        }
        last_count = count;
        last_at = now;
    }
}
