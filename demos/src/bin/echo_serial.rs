//! Opens a serial device and echoes back whatever it reads, ported from
//! `examples/serial/echo/echo_serial.cc`.
//!
//! Usage: `echo_serial <device> <baud_rate>`

use chanio_serial::SerialChannelBuilder;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let device = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let baud_rate: u32 = args.next().and_then(|s| s.parse().ok()).unwrap_or(115_200);

    let channel = Arc::new(
        SerialChannelBuilder::new(device.clone(), baud_rate)
            .build()
            .expect("valid serial configuration"),
    );

    let echo_target = channel.clone();
    channel.set_on_bytes(move |ctx| {
        echo_target.write_shared(ctx.data);
    });

    channel.start();
    tracing::info!(device, baud_rate, "serial echo running, press Ctrl+C to stop");
    let _ = tokio::signal::ctrl_c().await;
    channel.stop();
}
