#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use core::ops::Range;

use amp_switcher::config::Config;
use amp_switcher::device::{Device, Hardware, SystemRequest};
use amp_switcher::flash::FlashStore;
use amp_switcher::link::{Inbox, MacAddress, Outbox};
use amp_switcher::{info, warn};
use defmt::{timestamp, unwrap};
use embassy_embedded_hal::adapter::BlockingAsync;
use embassy_executor::Spawner;
use embassy_time::{Duration, Instant, Ticker};
use esp_alloc as _;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::ledc::channel::{self as ledc_channel, ChannelIFace};
use esp_hal::ledc::timer::{self as ledc_timer, TimerIFace};
use esp_hal::ledc::{LSGlobalClkSource, Ledc, LowSpeed};
use esp_hal::peripherals::{self};
use esp_hal::time::Rate;
use esp_hal::timer::systimer::SystemTimer;
use esp_hal::uart::{self, Uart};
use esp_hal::usb_serial_jtag::UsbSerialJtag;
use esp_hal::{clock::CpuClock, timer::timg::TimerGroup};
use esp_println as _;
use esp_storage::FlashStorage;
use static_cell::StaticCell;

use crate::board::{Buttons, EspNowRadio, Relays, StatusLed};
use crate::tasks::console::{Console, Reply};
use crate::tasks::midi::{MIDI_BAUD, MidiPipe};
use crate::tasks::{console, midi, radio};

mod board;
mod tasks;

const TICK: Duration = Duration::from_millis(5);
/// The `nvs` partition of the default partition table.
const SETTINGS_FLASH: Range<u32> = 0x9000..0xF000;

static INBOX: Inbox = Inbox::new();
static OUTBOX: Outbox = Outbox::new();
static MIDI_IN: MidiPipe = MidiPipe::new();
static CONSOLE: Console = Console::new();

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    // Turn on the on-board LED when panicking to signal something went wrong.

    // SAFETY: we're panicking so we should be safe as the last and only one to use the pin.
    let led_pin = unsafe { peripherals::GPIO8::steal() };
    let _ = Output::new(led_pin, Level::Low, OutputConfig::default());

    loop {}
}

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

timestamp!("[{=u64:us}]", Instant::now().as_micros());

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) {
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(size: 72 * 1024);
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_preempt::start(timg0.timer0);

    let systimer = SystemTimer::new(peripherals.SYSTIMER);
    esp_hal_embassy::init(systimer.alarm0);

    let relays = Relays {
        lines: [
            Output::new(peripherals.GPIO4, Level::Low, OutputConfig::default()),
            Output::new(peripherals.GPIO5, Level::Low, OutputConfig::default()),
            Output::new(peripherals.GPIO6, Level::Low, OutputConfig::default()),
            Output::new(peripherals.GPIO7, Level::Low, OutputConfig::default()),
        ],
    };

    let pull_up = InputConfig::default().with_pull(Pull::Up);
    let buttons = Buttons {
        inputs: [
            Input::new(peripherals.GPIO0, pull_up),
            Input::new(peripherals.GPIO1, pull_up),
            Input::new(peripherals.GPIO3, pull_up),
            Input::new(peripherals.GPIO10, pull_up),
        ],
    };

    let led = {
        static LED_TIMER: StaticCell<ledc_timer::Timer<'static, LowSpeed>> = StaticCell::new();
        let mut ledc = Ledc::new(peripherals.LEDC);
        ledc.set_global_slow_clock(LSGlobalClkSource::APBClk);
        let timer = LED_TIMER.init(ledc.timer::<LowSpeed>(ledc_timer::Number::Timer0));
        unwrap!(timer.configure(ledc_timer::config::Config {
            duty: ledc_timer::config::Duty::Duty13Bit,
            clock_source: ledc_timer::LSClockSource::APBClk,
            frequency: Rate::from_khz(1),
        }));
        let mut channel = ledc.channel(ledc_channel::Number::Channel0, peripherals.GPIO8);
        unwrap!(channel.configure(ledc_channel::config::Config {
            timer,
            duty_pct: 0,
            pin_config: ledc_channel::config::PinConfig::PushPull,
        }));
        StatusLed { channel }
    };

    {
        let uart_config = uart::Config::default().with_baudrate(MIDI_BAUD);
        let midi_uart = unwrap!(Uart::new(peripherals.UART1, uart_config))
            .with_rx(peripherals.GPIO20)
            .with_tx(peripherals.GPIO21)
            .into_async();
        let (rx, tx) = midi_uart.split();
        spawner.must_spawn(midi::midi_in_task(rx, tx, &MIDI_IN));
    }

    {
        let (rx, tx) = UsbSerialJtag::new(peripherals.USB_DEVICE).into_async().split();
        spawner.must_spawn(console::console_task(rx, tx, &CONSOLE));
    }

    let radio = {
        static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
        let controller = RADIO.init(unwrap!(esp_radio::init()));
        let (mut wifi, interfaces) = unwrap!(esp_radio::wifi::new(
            controller,
            peripherals.WIFI,
            esp_radio::wifi::Config::default()
        ));
        unwrap!(wifi.set_mode(esp_radio::wifi::WifiMode::Sta));
        unwrap!(wifi.start());
        // The controller must stay alive for ESP-NOW to keep working.
        static WIFI: StaticCell<esp_radio::wifi::WifiController<'static>> = StaticCell::new();
        WIFI.init(wifi);

        let esp_now = interfaces.esp_now;
        let address = MacAddress(interfaces.sta.mac_address());
        let (manager, sender, receiver) = esp_now.split();
        spawner.must_spawn(radio::receive_task(receiver, &INBOX));
        spawner.must_spawn(radio::send_task(sender, &OUTBOX, &INBOX));
        EspNowRadio {
            manager,
            outbox: &OUTBOX,
            address,
        }
    };
    info!("[main] station address {}", radio.address);

    let hardware = Hardware {
        store: FlashStore::new(BlockingAsync::new(FlashStorage::new()), SETTINGS_FLASH),
        radio,
        relays,
        led,
    };
    let mut device = unwrap!(Device::boot(Config::default(), hardware, &INBOX, Instant::now()));

    let mut midi_buf = [0; 64];
    let mut ticker = Ticker::every(TICK);
    loop {
        let started = Instant::now();

        let len = MIDI_IN.try_read(&mut midi_buf).unwrap_or(0);
        device.feed_midi(&midi_buf[..len]);

        while let Ok(line) = CONSOLE.lines.try_receive() {
            let mut reply = Reply::new();
            if device.execute(&line, started, &mut reply).is_err() {
                warn!("[main] reply to '{}' truncated", line.as_str());
            }
            if CONSOLE.replies.try_send(reply).is_err() {
                warn!("[main] console busy, reply dropped");
            }
        }

        let free_heap = esp_alloc::HEAP.free();
        device.tick(started, &buttons.levels(), Some(free_heap));
        device.record_loop_time(Instant::now().saturating_duration_since(started));

        if let Some(SystemRequest::Restart) = device.take_system_request() {
            info!("[main] restarting");
            ticker.next().await;
            esp_hal::system::software_reset();
        }

        ticker.next().await;
    }
}
