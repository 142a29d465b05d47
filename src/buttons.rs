//! Button gestures.
//!
//! Raw levels are debounced per button, then classified:
//!
//! * a release with no hold tier reached is a short press;
//! * holding the ladder button walks an ascending ladder of thresholds. Each
//!   threshold is acknowledged once, the moment it is crossed. The highest
//!   tier reached decides what the release does;
//! * while a channel-select session is open, every release advances the
//!   candidate MIDI channel instead. The session commits after a quiet
//!   period with no button held.
//!
//! Crossing the 10 s and 15 s thresholds only flashes. Learn and channel
//! select start when the button is released inside their band, not when the
//! threshold is crossed; releases in the 5 s and 20 s bands cancel.

use core::mem;

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::config::{Config, MAX_OUTPUTS};
use crate::midi::MidiChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Pressed,
    Released,
}

/// Accepts a new level only after it has been stable for the whole window.
#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    stable: bool,
    raw: bool,
    changed_at: Instant,
    window: Duration,
}

impl Debouncer {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            stable: false,
            raw: false,
            changed_at: now,
            window,
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.stable
    }

    pub fn update(&mut self, pressed: bool, now: Instant) -> Option<Edge> {
        if pressed != self.raw {
            self.raw = pressed;
            self.changed_at = now;
        }
        if self.raw == self.stable
            || now.saturating_duration_since(self.changed_at) < self.window
        {
            return None;
        }
        self.stable = self.raw;
        Some(if self.stable {
            Edge::Pressed
        } else {
            Edge::Released
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HoldTier {
    Notice,
    MidiLearn,
    ChannelSelect,
    Caution,
    FinalWarning,
    PairingReset,
}

impl HoldTier {
    pub const ALL: [HoldTier; 6] = [
        HoldTier::Notice,
        HoldTier::MidiLearn,
        HoldTier::ChannelSelect,
        HoldTier::Caution,
        HoldTier::FinalWarning,
        HoldTier::PairingReset,
    ];

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ButtonAction {
    ShortPress { button: usize },
    /// A hold threshold was crossed; acknowledge it.
    TierReached { button: usize, tier: HoldTier },
    ArmMidiLearn,
    EnterChannelSelect { candidate: MidiChannel },
    ChannelSelectAdvanced { candidate: MidiChannel },
    ChannelSelectCommitted { channel: MidiChannel },
    PairingReset,
}

pub type Actions = Vec<ButtonAction, 16>;

/// State owned by other components that gates dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonContext {
    /// A learn slot is armed and waiting for its program change.
    pub learn_lockout: bool,
    pub cooldown: bool,
    pub midi_channel: MidiChannel,
}

#[derive(Debug, Clone, Copy)]
pub struct ButtonRuntime {
    debouncer: Debouncer,
    press_started: Instant,
    fired: u8,
    /// Pressed during a lockout; the whole press is ignored.
    suppressed: bool,
}

impl ButtonRuntime {
    fn new(window: Duration, now: Instant) -> Self {
        Self {
            debouncer: Debouncer::new(window, now),
            press_started: now,
            fired: 0,
            suppressed: false,
        }
    }

    fn has_fired(&self, tier: HoldTier) -> bool {
        self.fired & tier.bit() != 0
    }

    fn highest_fired(&self) -> Option<HoldTier> {
        HoldTier::ALL
            .iter()
            .rev()
            .copied()
            .find(|&tier| self.has_fired(tier))
    }

    fn is_pressed(&self) -> bool {
        self.debouncer.is_pressed()
    }

    fn reset(&mut self) {
        self.fired = 0;
        self.suppressed = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSelectSession {
    pub candidate: MidiChannel,
    pub press_count: u32,
    pub last_press: Instant,
}

pub struct ButtonMachine {
    buttons: Vec<ButtonRuntime, MAX_OUTPUTS>,
    thresholds: [Duration; 6],
    ladder_button: usize,
    select_timeout: Duration,
    channel_select: Option<ChannelSelectSession>,
    swallow_release: bool,
}

impl ButtonMachine {
    pub fn new(config: &Config, now: Instant) -> Self {
        let buttons = (0..config.output_count.min(MAX_OUTPUTS))
            .map(|_| ButtonRuntime::new(config.debounce, now))
            .collect();
        Self {
            buttons,
            thresholds: config.hold_thresholds,
            ladder_button: config.ladder_button,
            select_timeout: config.channel_select_timeout,
            channel_select: None,
            swallow_release: false,
        }
    }

    pub fn button_count(&self) -> usize {
        self.buttons.len()
    }

    pub fn channel_select(&self) -> Option<ChannelSelectSession> {
        self.channel_select
    }

    /// A learn session just timed out. If a button is still down, its
    /// release must not be taken as a gesture.
    pub fn latch_learn_timeout(&mut self) {
        if self.buttons.iter().any(ButtonRuntime::is_pressed) {
            self.swallow_release = true;
        }
    }

    /// Debounce `levels` (true = pressed) and classify what happened.
    pub fn tick(
        &mut self,
        now: Instant,
        levels: &[bool],
        ctx: &ButtonContext,
        actions: &mut Actions,
    ) {
        for (button, &level) in levels.iter().enumerate().take(self.buttons.len()) {
            match self.buttons[button].debouncer.update(level, now) {
                Some(Edge::Pressed) => self.on_press(button, now, ctx),
                Some(Edge::Released) => self.on_release(button, now, ctx, actions),
                None => {}
            }
            if button == self.ladder_button
                && self.buttons[button].is_pressed()
                && !ctx.learn_lockout
            {
                self.climb_ladder(button, now, actions);
            }
        }
        self.check_channel_select_timeout(now, actions);
    }

    fn on_press(&mut self, button: usize, now: Instant, ctx: &ButtonContext) {
        let runtime = &mut self.buttons[button];
        runtime.press_started = now;
        runtime.fired = 0;
        runtime.suppressed = ctx.learn_lockout;
        debug!("[buttons] button {} pressed", button);
    }

    fn climb_ladder(&mut self, button: usize, now: Instant, actions: &mut Actions) {
        let runtime = &mut self.buttons[button];
        if runtime.suppressed {
            return;
        }
        let held = now.saturating_duration_since(runtime.press_started);
        for (tier, threshold) in HoldTier::ALL.into_iter().zip(self.thresholds) {
            if held >= threshold && !runtime.has_fired(tier) {
                runtime.fired |= tier.bit();
                info!("[buttons] button {} held past {:?}", button, tier);
                push(actions, ButtonAction::TierReached { button, tier });
            }
        }
    }

    fn on_release(
        &mut self,
        button: usize,
        now: Instant,
        ctx: &ButtonContext,
        actions: &mut Actions,
    ) {
        let runtime = self.buttons[button];
        self.buttons[button].reset();
        debug!("[buttons] button {} released", button);

        if mem::take(&mut self.swallow_release) {
            debug!("[buttons] release ignored after learn timeout");
            return;
        }
        if runtime.suppressed {
            return;
        }
        self.dispatch_release(button, runtime.highest_fired(), now, ctx, actions);
    }

    /// Classify a press that did not come from the hardware, as if the
    /// button had been tapped.
    pub fn simulate_press(
        &mut self,
        button: usize,
        now: Instant,
        ctx: &ButtonContext,
        actions: &mut Actions,
    ) {
        if button < self.buttons.len() {
            self.dispatch_release(button, None, now, ctx, actions);
        }
    }

    fn dispatch_release(
        &mut self,
        button: usize,
        highest: Option<HoldTier>,
        now: Instant,
        ctx: &ButtonContext,
        actions: &mut Actions,
    ) {
        if ctx.learn_lockout {
            return;
        }
        if let Some(session) = self.channel_select.as_mut() {
            session.candidate = session.candidate.next();
            session.press_count += 1;
            session.last_press = now;
            info!("[buttons] channel select candidate {}", session.candidate.get());
            push(
                actions,
                ButtonAction::ChannelSelectAdvanced {
                    candidate: session.candidate,
                },
            );
            return;
        }
        if button == self.ladder_button {
            if let Some(tier) = highest {
                self.release_tier(tier, now, ctx, actions);
                return;
            }
        }
        if ctx.cooldown {
            debug!("[buttons] short press ignored during learn cooldown");
            return;
        }
        push(actions, ButtonAction::ShortPress { button });
    }

    fn release_tier(
        &mut self,
        tier: HoldTier,
        now: Instant,
        ctx: &ButtonContext,
        actions: &mut Actions,
    ) {
        match tier {
            HoldTier::MidiLearn => push(actions, ButtonAction::ArmMidiLearn),
            HoldTier::ChannelSelect => {
                let session = ChannelSelectSession {
                    candidate: ctx.midi_channel,
                    press_count: 0,
                    last_press: now,
                };
                self.channel_select = Some(session);
                info!("[buttons] channel select started at {}", session.candidate.get());
                push(
                    actions,
                    ButtonAction::EnterChannelSelect {
                        candidate: session.candidate,
                    },
                );
            }
            HoldTier::PairingReset => push(actions, ButtonAction::PairingReset),
            HoldTier::Notice | HoldTier::Caution | HoldTier::FinalWarning => {
                debug!("[buttons] hold released in a cancel band");
            }
        }
    }

    fn check_channel_select_timeout(&mut self, now: Instant, actions: &mut Actions) {
        let Some(session) = self.channel_select else {
            return;
        };
        // A held button is still activity; its release advances the candidate.
        if self.buttons.iter().any(ButtonRuntime::is_pressed) {
            return;
        }
        if now.saturating_duration_since(session.last_press) >= self.select_timeout {
            self.channel_select = None;
            info!("[buttons] channel select committed {}", session.candidate.get());
            push(
                actions,
                ButtonAction::ChannelSelectCommitted {
                    channel: session.candidate,
                },
            );
        }
    }
}

fn push(actions: &mut Actions, action: ButtonAction) {
    if actions.push(action).is_err() {
        warn!("[buttons] action queue full, dropping {:?}", action);
    }
}
