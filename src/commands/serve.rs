//! Long-lived batch server.
//!
//! Pre-loads both sequence indexes and the mapping table, then accepts batch
//! names on a well-known FIFO. Each accepted batch gets its own pair of
//! FIFOs, a worker on the thread pool, and a fresh set of per-k filter
//! pairs. The driver streams target ids into the batch pipe; the worker
//! feeds the supporting mapped sequences through the counting/solid filter
//! pair and saves the solid filters when the batch's end sentinel arrives.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_utils::sync::WaitGroup;
use log::{debug, error, info};

use crate::bloom::{FilterPair, fill_filters};
use crate::cli::ServeArgs;
use crate::errors::TargetedBfsError;
use crate::guard::bind_to_parent;
use crate::mappings::AllMappings;
use crate::pipes::{Tokens, confirm_pipe, make_pipe, read_token};
use crate::seq_index::{SeqCursor, SeqIndex};

const MX_THRESHOLD_MIN: u32 = 1;
const MX_THRESHOLD_MAX: u32 = 30;

const BATCH_NAME_INPUT_PIPE: &str = "batch_name_input";
const BATCH_TARGET_IDS_INPUT_READY_PIPE: &str = "batch_target_ids_input_ready";
const TARGET_IDS_INPUT_PIPE: &str = "target_ids_input";
const BFS_READY_PIPE: &str = "bfs_ready";
const SEPARATOR: &str = "-";
const BF_EXTENSION: &str = ".bf";
const END_SYMBOL: &str = "x";

/// Linear model from ingested mapped bases to the k-mer base threshold,
/// fitted on read sets at the coverage this pipeline runs at.
const KMER_THRESHOLD_INTERCEPT: f64 = 4.66943;
const KMER_THRESHOLD_SLOPE: f64 = 2.11391e-7;
const KMER_THRESHOLD_MIN: u32 = 4;
const KMER_THRESHOLD_MAX: u32 = 13;

/// 0 means all logical cores.
fn get_num_threads(cli_threads: usize) -> usize {
    if cli_threads == 0 {
        num_cpus::get()
    } else {
        cli_threads
    }
}

fn mappings_bases_to_kmer_threshold(mappings_bases: u64) -> u32 {
    let estimate = KMER_THRESHOLD_INTERCEPT + mappings_bases as f64 * KMER_THRESHOLD_SLOPE;
    estimate.round().clamp(
        f64::from(KMER_THRESHOLD_MIN),
        f64::from(KMER_THRESHOLD_MAX),
    ) as u32
}

/// Immutable per-process configuration, fixed at argument parsing.
pub struct ServeConfig {
    pub cbf_bytes: usize,
    pub bf_bytes: usize,
    pub hash_num: u32,
    pub k_values: Vec<u32>,
    pub subsample_max_per_10kbp: f64,
}

/// Read-only state shared by the acceptor and every batch worker.
struct ServeContext {
    target_index: SeqIndex,
    mapped_index: SeqIndex,
    all_mappings: AllMappings,
    config: ServeConfig,
}

pub fn run_serve(args: ServeArgs, threads: usize) -> Result<()> {
    info!("Starting serve command with args: {:?}", args);

    // Reject filter parameters the workers would otherwise trip over
    // mid-batch.
    if args.cbf_bytes == 0 || args.bf_bytes == 0 {
        return Err(TargetedBfsError::BadArgs("filter sizes must be nonzero".to_string()).into());
    }
    if args.hash_num == 0 {
        return Err(TargetedBfsError::BadArgs("hash count must be at least 1".to_string()).into());
    }

    bind_to_parent();

    let threads = get_num_threads(threads);
    let config = ServeConfig {
        cbf_bytes: args.cbf_bytes,
        bf_bytes: args.bf_bytes,
        hash_num: args.hash_num,
        k_values: args.kmer_sizes.clone(),
        subsample_max_per_10kbp: args.subsample_max_per_10kbp,
    };

    let target_index = SeqIndex::load(&args.target_index, &args.target_seqs)
        .with_context(|| format!("Failed to load target index: {:?}", args.target_index))?;
    let mapped_index = SeqIndex::load(&args.mapped_index, &args.mapped_seqs)
        .with_context(|| format!("Failed to load mapped index: {:?}", args.mapped_index))?;
    let all_mappings = AllMappings::load(
        &args.mappings,
        &target_index,
        MX_THRESHOLD_MIN,
        MX_THRESHOLD_MAX,
        args.mx_max_per_10kbp,
    )
    .with_context(|| format!("Failed to load mappings: {:?}", args.mappings))?;

    let ctx = Arc::new(ServeContext {
        target_index,
        mapped_index,
        all_mappings,
        config,
    });

    serve(ctx, threads)
}

/// Accept loop. A single acceptor reads batch names; workers run on the
/// pool. Ends on the `x` sentinel (or a writer that sends nothing), after
/// draining in-flight batches.
fn serve(ctx: Arc<ServeContext>, threads: usize) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Failed to build worker thread pool")?;

    let batch_name_pipe = Path::new(BATCH_NAME_INPUT_PIPE);
    let ready_pipe = Path::new(BATCH_TARGET_IDS_INPUT_READY_PIPE);
    make_pipe(batch_name_pipe)?;
    make_pipe(ready_pipe)?;

    info!("Accepting batch names at {}", BATCH_NAME_INPUT_PIPE);

    let wg = WaitGroup::new();
    loop {
        let batch_name = read_token(batch_name_pipe)?;
        if batch_name.is_empty() || batch_name == END_SYMBOL {
            break;
        }
        debug!("Accepted batch {}", batch_name);

        let target_ids_pipe = PathBuf::from(format!(
            "{batch_name}{SEPARATOR}{TARGET_IDS_INPUT_PIPE}"
        ));
        let bfs_ready_pipe = PathBuf::from(format!("{batch_name}{SEPARATOR}{BFS_READY_PIPE}"));
        make_pipe(&target_ids_pipe)?;
        make_pipe(&bfs_ready_pipe)?;

        // Rendezvous: the per-batch FIFOs exist, tell the driver. Blocks
        // until the driver has the ready pipe open for reading.
        confirm_pipe(ready_pipe)?;

        let ctx = Arc::clone(&ctx);
        let wg = wg.clone();
        pool.spawn(move || {
            if let Err(e) = serve_batch(&ctx, &batch_name, &target_ids_pipe, &bfs_ready_pipe) {
                error!("Batch {} failed: {}", batch_name, e);
                std::process::exit(1);
            }
            drop(wg);
        });
    }

    wg.wait();
    let _ = fs::remove_file(batch_name_pipe);
    let _ = fs::remove_file(ready_pipe);

    info!("Targeted BF builder done");
    Ok(())
}

/// One batch: fresh filter pairs, stream target ids until the sentinel,
/// save the solid filters, confirm, clean up the batch FIFOs.
fn serve_batch(
    ctx: &ServeContext,
    batch_name: &str,
    target_ids_pipe: &Path,
    bfs_ready_pipe: &Path,
) -> Result<(), TargetedBfsError> {
    let config = &ctx.config;
    let pairs: Vec<FilterPair> = config
        .k_values
        .iter()
        .map(|&k| FilterPair::new(config.cbf_bytes, config.bf_bytes, config.hash_num, k))
        .collect::<Result<_, _>>()?;

    let mut cursor = ctx.mapped_index.cursor()?;
    let mut tokens = Tokens::new(BufReader::new(File::open(target_ids_pipe)?));
    while let Some(target_id) = tokens.next_token()? {
        if target_id == END_SYMBOL {
            break;
        }
        process_target(ctx, &target_id, &mut cursor, &pairs)?;
    }

    for (k, pair) in config.k_values.iter().zip(&pairs) {
        let bf_path = PathBuf::from(format!("{batch_name}{SEPARATOR}k{k}{BF_EXTENSION}"));
        pair.bf.save(&bf_path)?;
    }

    confirm_pipe(bfs_ready_pipe)?;

    let _ = fs::remove_file(target_ids_pipe);
    let _ = fs::remove_file(bfs_ready_pipe);

    debug!("Batch {} complete", batch_name);
    Ok(())
}

/// Feed one target's supporting sequences through the batch's filters.
///
/// The mapped sequences are ranked by `(phred_avg desc, id asc)` and capped
/// at `target_len * subsample_max_per_10kbp / 10000`. Ingestion is
/// sequential: the order in which k-mers cross the counting threshold
/// decides the solid filter contents, and the ranked order keeps that
/// deterministic.
fn process_target(
    ctx: &ServeContext,
    target_id: &str,
    cursor: &mut SeqCursor<'_>,
    pairs: &[FilterPair],
) -> Result<(), TargetedBfsError> {
    if !ctx.target_index.seq_exists(target_id) {
        debug!("Target {} not in index, skipping", target_id);
        return Ok(());
    }
    let target_len = ctx.target_index.get_seq_len(target_id)?;

    let mappings = ctx.all_mappings.get(target_id);
    if mappings.is_empty() {
        return Ok(());
    }

    let cap =
        (target_len as f64 * ctx.config.subsample_max_per_10kbp / 10_000.0) as usize;
    let take = mappings.len().min(cap);
    if take == 0 {
        return Ok(());
    }

    let mut ranked = Vec::with_capacity(mappings.len());
    for m in mappings {
        let phred_avg = ctx.mapped_index.get_phred_avg(&m.seq_id)?;
        ranked.push((m.seq_id.as_str(), phred_avg));
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut mappings_bases: u64 = 0;
    for (id, _) in &ranked[..take] {
        mappings_bases += ctx.mapped_index.get_seq_len(id)?;
    }
    let base_threshold = mappings_bases_to_kmer_threshold(mappings_bases);

    for (id, _) in &ranked[..take] {
        let seq = cursor.get_seq(id)?;
        fill_filters(
            seq,
            ctx.config.hash_num,
            &ctx.config.k_values,
            base_threshold,
            pairs,
        )?;
    }
    Ok(())
}
