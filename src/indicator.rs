//! Status LED scheduler.
//!
//! One pattern is active at a time. It is advanced once per tick by comparing
//! the elapsed time against the current step; nothing here ever waits.

use embassy_time::{Duration, Instant};

/// 13-bit PWM resolution of the LED channel.
pub const MAX_DUTY: u16 = 8191;
const FLASH_STEP: Duration = Duration::from_millis(60);
const FAST_BLINK_HALF_PERIOD: Duration = Duration::from_millis(250);
const BREATHING_STEP: u16 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pattern {
    Off,
    Solid,
    SingleFlash,
    DoubleFlash,
    TripleFlash,
    FastBlink,
    Breathing,
}

impl Pattern {
    /// Flash count for finite patterns.
    fn flashes(self) -> Option<usize> {
        match self {
            Pattern::SingleFlash => Some(1),
            Pattern::DoubleFlash => Some(2),
            Pattern::TripleFlash => Some(3),
            _ => None,
        }
    }
}

/// Intensity-controllable output.
pub trait IndicatorDriver {
    fn set_duty(&mut self, duty: u16);
}

/// System states that take precedence over requested patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Overrides {
    pub update_mode: bool,
    pub pairing: bool,
}

impl Overrides {
    fn forced(self) -> Option<Pattern> {
        if self.update_mode {
            Some(Pattern::FastBlink)
        } else if self.pairing {
            Some(Pattern::Breathing)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct Indicator {
    requested: Pattern,
    started: Instant,
    step: usize,
    step_started: Instant,
    fade: u16,
    rising: bool,
    last_duty: Option<u16>,
}

impl Indicator {
    pub fn new(now: Instant) -> Self {
        Self {
            requested: Pattern::Off,
            started: now,
            step: 0,
            step_started: now,
            fade: 0,
            rising: true,
            last_duty: None,
        }
    }

    /// Start `pattern` from its first step.
    pub fn request(&mut self, pattern: Pattern, now: Instant) {
        self.requested = pattern;
        self.started = now;
        self.step = 0;
        self.step_started = now;
    }

    pub fn requested(&self) -> Pattern {
        self.requested
    }

    /// The pattern actually shown given the current overrides.
    pub fn effective(&self, overrides: Overrides) -> Pattern {
        overrides.forced().unwrap_or(self.requested)
    }

    /// Advance one tick and return the duty to drive.
    pub fn tick(&mut self, now: Instant, overrides: Overrides) -> u16 {
        match overrides.forced() {
            Some(forced) => self.render(forced, now.as_millis()),
            None => {
                self.advance_steps(now);
                let elapsed = now.saturating_duration_since(self.started).as_millis();
                self.render(self.requested, elapsed)
            }
        }
    }

    /// Tick and push the duty to `driver` when it changed.
    pub fn drive<D: IndicatorDriver>(&mut self, driver: &mut D, now: Instant, overrides: Overrides) {
        let duty = self.tick(now, overrides);
        if self.last_duty != Some(duty) {
            driver.set_duty(duty);
            self.last_duty = Some(duty);
        }
    }

    fn advance_steps(&mut self, now: Instant) {
        let Some(flashes) = self.requested.flashes() else {
            return;
        };
        while now.saturating_duration_since(self.step_started) >= FLASH_STEP {
            self.step += 1;
            self.step_started += FLASH_STEP;
            if self.step >= flashes * 2 {
                self.request(Pattern::Off, now);
                return;
            }
        }
    }

    fn render(&mut self, pattern: Pattern, elapsed_ms: u64) -> u16 {
        match pattern {
            Pattern::Off => 0,
            Pattern::Solid => MAX_DUTY,
            Pattern::SingleFlash | Pattern::DoubleFlash | Pattern::TripleFlash => {
                if self.step % 2 == 0 { MAX_DUTY } else { 0 }
            }
            Pattern::FastBlink => {
                if (elapsed_ms / FAST_BLINK_HALF_PERIOD.as_millis()) % 2 == 0 {
                    MAX_DUTY
                } else {
                    0
                }
            }
            Pattern::Breathing => self.breathe(),
        }
    }

    fn breathe(&mut self) -> u16 {
        if self.rising {
            self.fade = self.fade.saturating_add(BREATHING_STEP).min(MAX_DUTY);
            if self.fade == MAX_DUTY {
                self.rising = false;
            }
        } else {
            self.fade = self.fade.saturating_sub(BREATHING_STEP);
            if self.fade == 0 {
                self.rising = true;
            }
        }
        self.fade
    }
}
