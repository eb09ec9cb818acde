use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use market_feed::{ExchangeConfig, ExchangeServer, Symbol};

#[derive(Debug, Parser)]
#[command(about = "Mock exchange serving a trade tape and answering resends")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "EXCHANGE_PORT", default_value_t = 3001)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "EXCHANGE_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Number of packets on the tape
    #[arg(long, env = "EXCHANGE_PACKETS", default_value_t = 5)]
    packets: usize,

    /// Instrument symbol, at most 4 ASCII characters
    #[arg(long, env = "EXCHANGE_SYMBOL", default_value = "SYMB")]
    symbol: String,

    /// Sequences left out of every stream-all batch (e.g. --drop 2,4)
    #[arg(long, value_delimiter = ',')]
    drop: Vec<i32>,
}

fn main() -> Result<()> {
    let _ = dotenv();
    market_feed::init_logging();
    let args = Args::parse();

    let symbol = Symbol::new(&args.symbol)
        .with_context(|| format!("symbol {:?} is not 1-4 ASCII characters", args.symbol))?;
    let config = ExchangeConfig { packets: args.packets, symbol, drop: args.drop };
    let server = ExchangeServer::bind((args.bind.as_str(), args.port), config)
        .with_context(|| format!("bind {}:{}", args.bind, args.port))?;
    server.serve().context("exchange server")?;
    Ok(())
}
