use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use log::info;

use crate::cli::IndexArgs;
use crate::seq_index::SeqIndex;

pub fn run_index(args: IndexArgs) -> Result<()> {
    info!("Starting index command with args: {:?}", args);

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Indexing {}", args.seqs_file.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let index = SeqIndex::build(&args.seqs_file)
        .with_context(|| format!("Failed to index sequence file: {:?}", args.seqs_file))?;

    spinner.finish_with_message(format!("Indexed {} records", index.len()));

    index
        .save(&args.index_file)
        .with_context(|| format!("Failed to write index file: {:?}", args.index_file))?;

    info!("Successfully wrote index to {:?}", args.index_file);
    Ok(())
}
