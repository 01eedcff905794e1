//! TCP client and multi-client server transports built on Tokio, wired on
//! top of the runtime-agnostic primitives in `chanio-core`.

mod error_map;

pub mod client;
pub mod server;
pub mod session;

pub use client::{TcpClient, TcpClientBuilder, TcpClientConfig};
pub use server::{TcpServer, TcpServerBuilder, TcpServerConfig};
pub use session::{Session, SessionRegistry};
