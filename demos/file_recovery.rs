//! FEC-AL demo: encode a block, drop random symbols, recover them.
//!
//! Simulates protecting a file-sized buffer split into `input_count`
//! symbols. A configurable number of symbols are lost in transit and the
//! decoder rebuilds them from the recovery stream.

use anyhow::{bail, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use fecal::{Decoder, Encoder, Error};

#[derive(Parser)]
#[command(about = "Encode a block, drop symbols, recover them")]
struct Args {
    /// Number of original symbols in the block
    #[arg(long, default_value_t = 200)]
    input_count: usize,

    /// Bytes per symbol
    #[arg(long, default_value_t = 1300)]
    symbol_bytes: usize,

    /// Number of original symbols lost in transit
    #[arg(long, default_value_t = 40)]
    losses: usize,

    /// Recovery symbols transmitted beyond the minimum
    #[arg(long, default_value_t = 3)]
    extra: usize,

    /// Seed for data generation and loss selection
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.input_count == 0 || args.symbol_bytes == 0 {
        bail!("block must hold at least one symbol of at least one byte");
    }
    if args.losses > args.input_count {
        bail!("cannot lose more symbols than the block holds");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let total_bytes = (args.input_count * args.symbol_bytes) as u64;

    let originals: Vec<Vec<u8>> = (0..args.input_count)
        .map(|_| (0..args.symbol_bytes).map(|_| rng.gen()).collect())
        .collect();
    let slices: Vec<&[u8]> = originals.iter().map(|v| v.as_slice()).collect();

    let mut encoder = Encoder::new(&slices, total_bytes)?;

    let recovery_count = args.losses + args.extra;
    let mut recovery = Vec::with_capacity(recovery_count);
    for row in 0..recovery_count as u32 {
        let mut symbol = vec![0u8; args.symbol_bytes];
        encoder.encode(row, &mut symbol)?;
        recovery.push(symbol);
    }

    let mut columns: Vec<usize> = (0..args.input_count).collect();
    columns.shuffle(&mut rng);
    let lost = &columns[..args.losses];

    let mut decoder = Decoder::new(args.input_count, total_bytes)?;
    for (column, original) in originals.iter().enumerate() {
        if lost.contains(&column) {
            continue;
        }
        decoder.add_original(column, original)?;
    }

    let mut rows_used = 0;
    let mut recovered = match decoder.decode() {
        Ok(columns) => Some(columns),
        Err(Error::NeedMoreData) => None,
        Err(e) => bail!("decode failed: {e}"),
    };
    if recovered.is_none() {
        for (row, symbol) in recovery.iter().enumerate() {
            decoder.add_recovery(row as u32, symbol)?;
            rows_used = row + 1;
            match decoder.decode() {
                Ok(columns) => {
                    recovered = Some(columns);
                    break;
                }
                Err(Error::NeedMoreData) => continue,
                Err(e) => bail!("decode failed: {e}"),
            }
        }
    }

    let Some(recovered) = recovered else {
        bail!(
            "block did not decode with {} recovery symbols; retransmission needed",
            recovery_count
        );
    };

    for &column in &recovered {
        if decoder.get(column)? != &originals[column][..] {
            bail!("recovered symbol {column} does not match the original");
        }
    }

    println!(
        "block: {} symbols x {} bytes ({} bytes total)",
        args.input_count, args.symbol_bytes, total_bytes
    );
    println!(
        "lost {} symbols, recovered {} using {} recovery symbols ({} overhead)",
        args.losses,
        recovered.len(),
        rows_used,
        rows_used - args.losses
    );
    println!("all recovered symbols verified");

    Ok(())
}
