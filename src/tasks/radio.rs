use amp_switcher::link::{Inbox, MacAddress, Outbox};
use amp_switcher::warn;
use esp_radio::esp_now::{EspNowReceiver, EspNowSender};

/// Copy every received ESP-NOW frame into the inbox. No decoding here; the
/// tick loop does that.
#[embassy_executor::task]
pub async fn receive_task(mut receiver: EspNowReceiver<'static>, inbox: &'static Inbox) {
    loop {
        let received = receiver.receive_async().await;
        let from = MacAddress(received.info.src_address);
        if !inbox.post_received(from, received.data()) {
            warn!("[radio] inbox full, dropped frame from {}", from);
        }
    }
}

/// Transmit queued frames one at a time and report each delivery status back
/// to the tick loop.
#[embassy_executor::task]
pub async fn send_task(
    mut sender: EspNowSender<'static>,
    outbox: &'static Outbox,
    inbox: &'static Inbox,
) {
    loop {
        let frame = outbox.next().await;
        let delivered = sender
            .send_async(&frame.to.octets(), &frame.payload)
            .await
            .is_ok();
        if !inbox.post_send_complete(frame.to, delivered) {
            warn!("[radio] inbox full, dropped send status for {}", frame.to);
        }
    }
}
