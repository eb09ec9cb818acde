//! Trade feed client and exchange with gap recovery.
//!
//! This crate provides the types and logic used by the `market_feed` client,
//! the `exchange` server and the `player` tool:
//!
//! - `packet`: the fixed 17-byte trade frame and its codec
//! - `wire`: request frames and how a batch ends on the wire
//! - `gap`: reconstruction state and sequence gap detection
//! - `resend`: bounded, sequential recovery of missing sequences
//! - `exchange`: the exchange contract, its TCP client and the server
//! - `session`: the client state machine tying it together
//! - `store`: atomic JSON and CRC-framed capture output
//!
//! A session either persists a complete, gap-free set ordered by sequence
//! or fails with a [`FeedError`] and writes nothing.
pub mod error;
pub mod exchange;
pub mod gap;
pub mod packet;
pub mod resend;
pub mod session;
pub mod store;
pub mod wire;

pub use error::{FeedError, Result};
pub use exchange::{Exchange, ExchangeConfig, ExchangeServer, TcpExchange};
pub use packet::{Packet, Side, Symbol};
pub use session::{CancelToken, Session, SessionConfig, SessionState, SessionSummary};
pub use store::{Output, OutputFormat};

/// Install the `tracing` subscriber used by the binaries. `RUST_LOG`
/// overrides the default `info` level.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
