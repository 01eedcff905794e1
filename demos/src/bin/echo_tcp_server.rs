//! Echoes every byte a client sends back to that same client, ported from
//! `examples/tcp/single-echo/echo_tcp_server.cc` in the original.
//!
//! Usage: `echo_tcp_server <port>`

use chanio_tcp::TcpServerBuilder;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(9000);

    let server = Arc::new(
        TcpServerBuilder::new("0.0.0.0", port)
            .on_connect(|ctx| tracing::info!(client_id = ctx.client_id, from = %ctx.client_info, "client connected"))
            .on_disconnect(|ctx| tracing::info!(client_id = ctx.client_id, "client disconnected"))
            .on_error(|ctx| tracing::warn!(code = ?ctx.code, message = %ctx.message, "server error"))
            .build()
            .expect("valid server configuration"),
    );

    let echo_target = server.clone();
    server.set_on_data(move |ctx| {
        echo_target.send_to(ctx.client_id, ctx.data);
    });

    server.start();
    tracing::info!(port, "echo server listening, press Ctrl+C to stop");
    let _ = tokio::signal::ctrl_c().await;
    server.stop();
}
