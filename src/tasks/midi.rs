use amp_switcher::warn;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pipe::Pipe;
use esp_hal::Async;
use esp_hal::uart::{UartRx, UartTx};

pub const MIDI_BAUD: u32 = 31_250;

/// Raw MIDI bytes waiting for the tick loop.
pub type MidiPipe = Pipe<CriticalSectionRawMutex, 64>;

/// Read MIDI IN, echo it to MIDI OUT and hand it to the tick loop.
#[embassy_executor::task]
pub async fn midi_in_task(
    mut rx: UartRx<'static, Async>,
    mut tx: UartTx<'static, Async>,
    pipe: &'static MidiPipe,
) {
    let mut buf = [0; 16];
    loop {
        let len = match rx.read_async(&mut buf).await {
            Ok(len) => len,
            Err(err) => {
                warn!("[midi] uart read error: {}", err);
                continue;
            }
        };
        let bytes = &buf[..len];
        if let Err(err) = tx.write_async(bytes).await {
            warn!("[midi] thru write error: {}", err);
        }
        if pipe.try_write(bytes).map_or(true, |written| written < len) {
            warn!("[midi] pipe full, bytes dropped");
        }
    }
}
