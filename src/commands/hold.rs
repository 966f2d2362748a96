use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};

use crate::cli::HoldArgs;

/// Open the FIFO for writing (blocking until the peer reads) and send the
/// rendezvous byte. Drivers use this to acknowledge a server-side pipe.
pub fn run_hold(args: HoldArgs) -> Result<()> {
    let mut pipe = OpenOptions::new()
        .write(true)
        .open(&args.fifo_path)
        .with_context(|| format!("Failed to open FIFO: {:?}", args.fifo_path))?;
    pipe.write_all(b"1")
        .with_context(|| format!("Failed to write to FIFO: {:?}", args.fifo_path))?;
    Ok(())
}
