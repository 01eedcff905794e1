//! Reads lines from stdin, sends each to an echo server, and prints what
//! comes back, ported from `examples/tcp/single-echo/echo_tcp_client.cc`.
//!
//! Usage: `echo_tcp_client <host> <port>`

use chanio_tcp::TcpClientBuilder;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(9000);

    let client = Arc::new(
        TcpClientBuilder::new(host.clone(), port)
            .on_bytes(|ctx| {
                if let Ok(text) = std::str::from_utf8(&ctx.data) {
                    println!("< {text}");
                }
            })
            .on_state(|state| tracing::debug!(%state, "link state changed"))
            .build()
            .expect("valid client configuration"),
    );
    client.start();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        client.write_copy(line.as_bytes());
    }
    client.stop();
}
