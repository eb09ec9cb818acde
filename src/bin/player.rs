use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use market_feed::store::read_capture;

#[derive(Debug, Parser)]
#[command(about = "Print a saved trade capture and check it is gap-free")]
struct Args {
    /// Input file path to read (capture .bin)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Only print the summary line
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (header, packets) = read_capture(&args.input)?;
    if !args.quiet {
        for p in &packets {
            println!(
                "seq={:>6} {} {:?} qty={:>8} price={:>10}{}",
                p.sequence,
                p.symbol,
                p.side,
                p.quantity,
                p.price,
                if p.is_filler() { " (filler)" } else { "" }
            );
        }
    }
    if let Some((i, w)) = packets.windows(2).enumerate().find(|(_, w)| w[1].sequence != w[0].sequence + 1) {
        bail!("sequence break after packet {}: {} -> {}", i, w[0].sequence, w[1].sequence);
    }
    eprintln!(
        "Read {} packets (capture v{}, created {}ns).",
        packets.len(),
        header.version,
        header.created_unix_ns
    );
    Ok(())
}
