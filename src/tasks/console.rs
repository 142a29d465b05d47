use core::mem;

use amp_switcher::warn;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embedded_io_async::{Read, Write};
use esp_hal::Async;
use esp_hal::usb_serial_jtag::{UsbSerialJtagRx, UsbSerialJtagTx};
use heapless::String;

pub type Line = String<64>;
pub type Reply = String<1536>;

/// Command lines in, acknowledgements out.
pub struct Console {
    pub lines: Channel<CriticalSectionRawMutex, Line, 2>,
    pub replies: Channel<CriticalSectionRawMutex, Reply, 1>,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            lines: Channel::new(),
            replies: Channel::new(),
        }
    }
}

#[embassy_executor::task]
pub async fn console_task(
    mut rx: UsbSerialJtagRx<'static, Async>,
    mut tx: UsbSerialJtagTx<'static, Async>,
    console: &'static Console,
) {
    let mut line = Line::new();
    let mut buf = [0; 32];
    loop {
        match select(rx.read(&mut buf), console.replies.receive()).await {
            Either::First(Ok(len)) => {
                for &byte in &buf[..len] {
                    match byte {
                        b'\r' | b'\n' if line.is_empty() => {}
                        b'\r' | b'\n' => {
                            if console.lines.try_send(mem::take(&mut line)).is_err() {
                                warn!("[console] busy, line dropped");
                            }
                        }
                        0x20..=0x7E => {
                            if line.push(byte as char).is_err() {
                                warn!("[console] line too long");
                                line.clear();
                            }
                        }
                        _ => {}
                    }
                }
            }
            Either::First(Err(_)) => {}
            Either::Second(reply) => {
                if tx.write_all(reply.as_bytes()).await.is_err() {
                    warn!("[console] write failed");
                }
            }
        }
    }
}
