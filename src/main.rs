use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use market_feed::store::default_output_path;
use market_feed::wire::BatchFraming;
use market_feed::{CancelToken, Output, OutputFormat, Session, SessionConfig};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Request a trade stream, recover gaps and save the ordered result")]
struct Args {
    /// Exchange host
    #[arg(long, env = "FEED_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Exchange port
    #[arg(long, env = "FEED_PORT", default_value_t = 3001)]
    port: u16,

    /// Output file path; defaults to captures/trades_YYYY_MM_DD.json
    #[arg(long, env = "OUT_FILE")]
    out: Option<PathBuf>,

    /// Output format; a .bin output path implies capture
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// How the end of the initial batch is detected
    #[arg(long, value_enum, env = "FEED_FRAMING", default_value_t = BatchFraming::Counted)]
    framing: BatchFraming,

    /// Read timeout on the exchange connection; bounds how long Ctrl+C can take
    #[arg(long, env = "FEED_READ_TIMEOUT_MS", default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    read_timeout_ms: u64,

    /// Resend requests per missing sequence before giving up
    #[arg(long, env = "FEED_ATTEMPTS", default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    attempts: u32,

    /// Fail instead of chasing more than this many gaps in the initial batch
    #[arg(long, env = "FEED_MAX_MISSING", default_value_t = market_feed::gap::DEFAULT_MAX_MISSING)]
    max_missing: usize,
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    market_feed::init_logging();
    let args = Args::parse();

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || on_signal.cancel()) {
        warn!(error = %e, "could not install Ctrl+C handler");
    }

    let config = SessionConfig {
        framing: args.framing,
        read_timeout: Some(Duration::from_millis(args.read_timeout_ms)),
        attempts: args.attempts,
        max_missing: args.max_missing,
    };
    let output = Output::new(args.out.unwrap_or_else(default_output_path), args.format);

    let addr = format!("{}:{}", args.host, args.port);
    let mut session = Session::connect(addr.as_str(), config, cancel)
        .with_context(|| format!("connect to exchange at {addr}"))?;
    let summary = session.run(&output).context("feed session")?;

    info!(
        batch = summary.batch_len,
        gaps = ?summary.gaps,
        resends = summary.resends.requests,
        packets = summary.packets,
        path = %output.path.display(),
        "done"
    );
    Ok(())
}
