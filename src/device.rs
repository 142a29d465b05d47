//! The device aggregate.
//!
//! [`Device`] owns every state machine and the hardware seams. The firmware
//! calls [`Device::tick`] from a single loop; nothing in here blocks.

use core::fmt::Write;

use embassy_time::{Duration, Instant};
use midi_types::MidiMessage;

use crate::buttons::{Actions, ButtonAction, ButtonContext, ButtonMachine};
use crate::command::{Command, HELP, ParseError};
use crate::config::{Config, FIRMWARE_VERSION};
use crate::diagnostics::{HeapTrend, LoopMetrics, MemoryMonitor};
use crate::error::Result;
use crate::fmt::{self as logfmt, LogLevel};
use crate::indicator::{Indicator, IndicatorDriver, Overrides, Pattern};
use crate::link::{Inbox, LinkEvent, Packet, Radio, RemoteCommand};
use crate::midi::{MidiChannel, MidiDecoder};
use crate::pairing::{LinkState, PairingEngine};
use crate::router::{LearnState, MidiRouter, Route};
use crate::store::{KeyValueStore, Settings};
use crate::switch::{ChannelSwitch, RelayDriver};

/// Hardware handed to [`Device::boot`].
pub struct Hardware<S, R, O, L> {
    pub store: S,
    pub radio: R,
    pub relays: O,
    pub led: L,
}

/// Something the firmware has to act on outside the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SystemRequest {
    Restart,
}

/// Point-in-time view of the device, for the console and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub link: LinkState,
    pub output: u8,
    pub outputs: usize,
    pub midi_channel: MidiChannel,
    pub learn: LearnState,
    pub channel_select: Option<MidiChannel>,
    pub update_mode: bool,
    pub log_level: LogLevel,
    pub pattern: Pattern,
}

pub struct Device<'a, S, R, O, L> {
    config: Config,
    settings: Settings<S>,
    radio: R,
    switch: ChannelSwitch<O>,
    led: L,
    inbox: &'a Inbox,
    pairing: PairingEngine,
    buttons: ButtonMachine,
    router: MidiRouter,
    indicator: Indicator,
    decoder: MidiDecoder,
    metrics: LoopMetrics,
    memory: MemoryMonitor,
    update_mode_since: Option<Instant>,
    request: Option<SystemRequest>,
}

impl<'a, S, R, O, L> Device<'a, S, R, O, L>
where
    S: KeyValueStore,
    R: Radio,
    O: RelayDriver,
    L: IndicatorDriver,
{
    /// Restore persisted state and bring every component to its start state.
    pub fn boot(
        config: Config,
        hardware: Hardware<S, R, O, L>,
        inbox: &'a Inbox,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let Hardware {
            store,
            mut radio,
            relays,
            led,
        } = hardware;
        let mut settings = Settings::new(store);

        let level = settings.load_log_level();
        logfmt::set_log_level(level);
        info!(
            "[device] {} v{} booting, log level {}",
            config.device_name,
            FIRMWARE_VERSION,
            level.as_str()
        );

        let listen = settings.load_midi_channel();
        let map = settings.load_program_map(config.output_count);
        let router = MidiRouter::new(&config, map, listen);

        let mut pairing = PairingEngine::new(&config);
        pairing.boot(&mut settings, &mut radio);

        let mut switch = ChannelSwitch::new(relays, config.output_count);
        switch.select(config.boot_channel)?;

        info!("[device] listening on MIDI channel {}", listen.get());
        Ok(Self {
            buttons: ButtonMachine::new(&config, now),
            memory: MemoryMonitor::new(&config),
            config,
            settings,
            radio,
            switch,
            led,
            inbox,
            pairing,
            router,
            indicator: Indicator::new(now),
            decoder: MidiDecoder::new(),
            metrics: LoopMetrics::new(now),
            update_mode_since: None,
            request: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings<S> {
        &self.settings
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn relays(&self) -> &O {
        self.switch.relays()
    }

    pub fn led(&self) -> &L {
        &self.led
    }

    pub fn router(&self) -> &MidiRouter {
        &self.router
    }

    pub fn status(&self) -> Status {
        Status {
            link: self.pairing.state(),
            output: self.switch.active(),
            outputs: self.switch.outputs(),
            midi_channel: self.router.listen_channel(),
            learn: self.router.learn_state(),
            channel_select: self.buttons.channel_select().map(|s| s.candidate),
            update_mode: self.update_mode_since.is_some(),
            log_level: logfmt::log_level(),
            pattern: self.indicator.effective(self.overrides()),
        }
    }

    /// Hand over a pending restart (or other system) request, once.
    pub fn take_system_request(&mut self) -> Option<SystemRequest> {
        self.request.take()
    }

    pub fn record_loop_time(&mut self, loop_time: Duration) {
        self.metrics.record(loop_time);
    }

    /// Queue raw bytes from the MIDI input.
    pub fn feed_midi(&mut self, bytes: &[u8]) {
        self.decoder.feed(bytes);
    }

    /// Run one pass of every state machine. `buttons` holds the logical
    /// level of each button, `true` meaning pressed.
    pub fn tick(&mut self, now: Instant, buttons: &[bool], free_heap: Option<usize>) {
        while let Some(event) = self.inbox.next() {
            self.handle_link_event(event, now);
        }

        if let Some(since) = self.update_mode_since {
            let _ = self.decoder.next_message();
            if self.request.is_none()
                && now.saturating_duration_since(since) >= self.config.update_mode_timeout
            {
                warn!("[device] update mode timed out, restarting");
                self.request = Some(SystemRequest::Restart);
            }
        } else {
            self.pairing.tick(now, &mut self.radio);
            if self.router.check_timeout(now) {
                self.buttons.latch_learn_timeout();
            }
            if let Some(message) = self.decoder.next_message() {
                self.handle_midi(message, now);
            }
            let ctx = self.button_context(now);
            let mut actions = Actions::new();
            self.buttons.tick(now, buttons, &ctx, &mut actions);
            for action in actions {
                self.handle_button(action, now);
            }
        }

        if let Some(free) = free_heap {
            self.memory.poll(now, free);
        }
        let overrides = self.overrides();
        self.indicator.drive(&mut self.led, now, overrides);
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            update_mode: self.update_mode_since.is_some(),
            pairing: self.pairing.state().is_scanning(),
        }
    }

    fn button_context(&self, now: Instant) -> ButtonContext {
        ButtonContext {
            learn_lockout: self.router.is_locked_out(),
            cooldown: self.router.in_cooldown(now),
            midi_channel: self.router.listen_channel(),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        let (from, payload) = match event {
            LinkEvent::SendComplete { to, delivered } => {
                if delivered {
                    debug!("[link] delivered to {}", to);
                } else {
                    warn!("[link] send to {} failed", to);
                }
                return;
            }
            LinkEvent::Received { from, payload } => (from, payload),
        };
        if self.update_mode_since.is_some() {
            debug!("[link] packet from {} ignored in update mode", from);
            return;
        }
        let packet = match Packet::decode(&payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("[link] {} bytes from {}: {:?}", payload.len(), from, err);
                return;
            }
        };
        if !self.pairing.state().is_paired() && !matches!(packet, Packet::Pairing(_)) {
            debug!("[link] ignoring data from {}, not paired", from);
            return;
        }
        match packet {
            Packet::Pairing(reply) => {
                if self
                    .pairing
                    .on_reply(&reply, &mut self.settings, &mut self.radio)
                {
                    self.indicator.request(Pattern::DoubleFlash, now);
                }
            }
            Packet::Data(data) => {
                debug!(
                    "[link] reading {} from {}: id {}",
                    data.reading_id, from, data.id
                );
            }
            Packet::Command(RemoteCommand::ProgramChange(channel)) => {
                info!("[link] remote program change {}", channel);
                if let Err(err) = self.select_output(channel, now) {
                    warn!("[link] remote program change rejected: {:?}", err);
                }
            }
            Packet::Command(RemoteCommand::Unknown(kind)) => {
                warn!("[link] unknown command type {}", kind);
            }
        }
    }

    fn handle_midi(&mut self, message: MidiMessage, now: Instant) {
        let Some(route) = self.router.handle_message(message, now) else {
            return;
        };
        match route {
            Route::Select(channel) => {
                if let Err(err) = self.select_output(channel, now) {
                    warn!("[midi] {:?}", err);
                }
            }
            Route::Toggle => self.toggle_output(now),
            Route::Learned { .. } => {
                if let Err(err) = self.settings.save_program_map(self.router.map()) {
                    error!("[midi] failed to persist map: {:?}", err);
                }
                self.indicator.request(Pattern::TripleFlash, now);
            }
            Route::Ignored(reason) => debug!("[midi] program change ignored: {:?}", reason),
        }
    }

    fn handle_button(&mut self, action: ButtonAction, now: Instant) {
        match action {
            ButtonAction::TierReached { .. } | ButtonAction::ChannelSelectAdvanced { .. } => {
                self.indicator.request(Pattern::SingleFlash, now);
            }
            ButtonAction::ShortPress { button } => self.short_press(button, now),
            ButtonAction::ArmMidiLearn => {
                self.router.arm_learn(now);
                self.indicator.request(Pattern::DoubleFlash, now);
            }
            ButtonAction::EnterChannelSelect { .. } => {
                self.indicator.request(Pattern::DoubleFlash, now);
            }
            ButtonAction::ChannelSelectCommitted { channel } => {
                self.router.set_listen_channel(channel);
                if let Err(err) = self.settings.save_midi_channel(channel) {
                    error!("[buttons] failed to persist MIDI channel: {:?}", err);
                }
                self.indicator.request(Pattern::TripleFlash, now);
            }
            ButtonAction::PairingReset => {
                self.router.abort_learn();
                self.pairing.reset(&mut self.settings);
            }
        }
    }

    fn short_press(&mut self, button: usize, now: Instant) {
        if self.router.learn_state() == LearnState::AwaitingSlot {
            match self.router.select_slot(button, now) {
                Ok(()) => self.indicator.request(Pattern::SingleFlash, now),
                Err(err) => warn!("[buttons] cannot learn into button {}: {:?}", button, err),
            }
            return;
        }
        if self.config.is_single_output() {
            self.toggle_output(now);
        } else if let Err(err) = self.select_output(button as u8 + 1, now) {
            warn!("[buttons] {:?}", err);
        }
    }

    fn select_output(&mut self, channel: u8, now: Instant) -> Result<()> {
        if self.switch.select(channel)? {
            info!("[device] output channel {}", channel);
            self.indicator.request(Pattern::SingleFlash, now);
        }
        Ok(())
    }

    fn toggle_output(&mut self, now: Instant) {
        self.switch.toggle();
        info!("[device] output toggled to {}", self.switch.active());
        self.indicator.request(Pattern::SingleFlash, now);
    }

    fn enter_update_mode(&mut self, now: Instant) {
        if self.update_mode_since.is_none() {
            self.router.abort_learn();
            self.update_mode_since = Some(now);
            warn!("[device] update mode entered");
        }
    }

    /// Run one operator command line and write the acknowledgement to `out`.
    pub fn execute<W: Write>(&mut self, line: &str, now: Instant, out: &mut W) -> core::fmt::Result {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(ParseError::Empty) => return Ok(()),
            Err(ParseError::InvalidLogLevel) => {
                return writeln!(out, "Invalid log level. Use setlog 0-4");
            }
            Err(ParseError::Unknown) => {
                writeln!(out, "Unknown command: {}", line.trim())?;
                return writeln!(out, "Type 'help' for command list.");
            }
        };
        debug!("[console] {:?}", command);

        if self.update_mode_since.is_some() {
            let suspended = match command {
                Command::PressButton(_) => Some("button presses are ignored"),
                Command::SetChannel(_) | Command::Off => Some("outputs are frozen"),
                Command::Pair => Some("pairing is suspended"),
                _ => None,
            };
            if let Some(reason) = suspended {
                return writeln!(out, "Update mode active, {reason}");
            }
        }

        match command {
            Command::Help => writeln!(out, "{HELP}"),
            Command::Status => self.write_status(out),
            Command::Pair => {
                self.router.abort_learn();
                self.pairing.reset(&mut self.settings);
                writeln!(out, "Pairing cleared, scanning for controller")
            }
            Command::SetLog(level) => {
                logfmt::set_log_level(level);
                if let Err(err) = self.settings.save_log_level(level) {
                    error!("[console] failed to persist log level: {:?}", err);
                }
                writeln!(out, "Log level set to {} ({})", level as u8, level.as_str())
            }
            Command::ChannelSelect => writeln!(
                out,
                "Hold button {} for 15-20 s and release, then press any button to step the \
                 MIDI channel. It is saved after {} s without presses. Current channel: {}",
                self.config.ladder_button + 1,
                self.config.channel_select_timeout.as_secs(),
                self.router.listen_channel().get()
            ),
            Command::SetChannel(channel) => match self.select_output(channel, now) {
                Ok(()) => writeln!(out, "Channel {channel} selected"),
                Err(_) => writeln!(
                    out,
                    "Invalid channel {channel}, use 1-{}",
                    self.switch.outputs()
                ),
            },
            Command::Off => {
                self.switch.off();
                writeln!(out, "All outputs off")
            }
            Command::PressButton(button) => {
                if button >= self.buttons.button_count() {
                    return writeln!(
                        out,
                        "Invalid button {}, use b1-b{}",
                        button + 1,
                        self.buttons.button_count()
                    );
                }
                let ctx = self.button_context(now);
                let mut actions = Actions::new();
                self.buttons.simulate_press(button, now, &ctx, &mut actions);
                for action in actions {
                    self.handle_button(action, now);
                }
                writeln!(out, "Button {} pressed", button + 1)
            }
            Command::Ota => {
                self.enter_update_mode(now);
                writeln!(
                    out,
                    "Update mode active, restarting in {} s",
                    self.config.update_mode_timeout.as_secs()
                )
            }
            Command::Reset => {
                self.request = Some(SystemRequest::Restart);
                writeln!(out, "Restarting")
            }
            Command::Debug => {
                self.write_status(out)?;
                self.write_perf(out, now)?;
                self.write_memory(out)
            }
            Command::Perf => self.write_perf(out, now),
            Command::Memory => self.write_memory(out),
            Command::Map => self.write_map(out),
        }
    }

    fn write_status<W: Write>(&self, out: &mut W) -> core::fmt::Result {
        let status = self.status();
        writeln!(out, "{} v{}", self.config.device_name, FIRMWARE_VERSION)?;
        match status.link {
            LinkState::Paired { peer, channel } => {
                writeln!(out, "Link: paired with {peer} on channel {channel}")?
            }
            LinkState::Unpaired => writeln!(out, "Link: unpaired")?,
            LinkState::Requesting { channel } | LinkState::AwaitingReply { channel, .. } => {
                writeln!(out, "Link: scanning channel {channel}")?
            }
        }
        match status.output {
            0 => writeln!(out, "Output: off")?,
            active => writeln!(out, "Output: channel {active} of {}", status.outputs)?,
        }
        writeln!(out, "MIDI channel: {}", status.midi_channel.get())?;
        match status.learn {
            LearnState::Idle => {}
            LearnState::AwaitingSlot => writeln!(out, "MIDI learn: press a channel button")?,
            LearnState::AwaitingProgram { slot } => {
                writeln!(out, "MIDI learn: waiting for program for channel {}", slot + 1)?
            }
        }
        if let Some(candidate) = status.channel_select {
            writeln!(out, "Channel select: candidate {}", candidate.get())?;
        }
        if status.update_mode {
            writeln!(out, "Update mode: active")?;
        }
        writeln!(out, "Log level: {}", status.log_level.as_str())
    }

    fn write_perf<W: Write>(&self, out: &mut W, now: Instant) -> core::fmt::Result {
        let m = &self.metrics;
        writeln!(out, "Loops: {}", m.count)?;
        writeln!(
            out,
            "Loop time us: last {} min {} max {} avg {}",
            m.last.as_micros(),
            m.min.as_micros(),
            m.max.as_micros(),
            m.average().as_micros()
        )?;
        writeln!(out, "Uptime: {} s", m.uptime(now).as_secs())?;
        writeln!(out, "MIDI bytes dropped: {}", self.decoder.dropped())
    }

    fn write_memory<W: Write>(&self, out: &mut W) -> core::fmt::Result {
        let Some(report) = self.memory.report() else {
            return writeln!(out, "Memory: no samples yet");
        };
        writeln!(
            out,
            "Free heap: {} B (initial {} B, change {} B)",
            report.current, report.initial, report.change
        )?;
        let verdict = match report.trend {
            HeapTrend::PotentialLeak => "potential memory leak detected",
            HeapTrend::Freed => "memory freed",
            HeapTrend::Stable => "memory stable",
        };
        writeln!(out, "Leak analysis: {verdict}")?;
        writeln!(out, "Low memory warnings: {}", self.memory.low_warnings())
    }

    fn write_map<W: Write>(&self, out: &mut W) -> core::fmt::Result {
        for (slot, program) in self.router.map().as_bytes().iter().enumerate() {
            writeln!(out, "Channel {}: program {}", slot + 1, program)?;
        }
        Ok(())
    }
}
