use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    #[clap(
        short,
        long,
        global = true,
        default_value_t = 0,
        help = "Number of threads to use (0 for all logical cores)"
    )]
    pub threads: usize,

    #[clap(short, long, global = true, action = clap::ArgAction::Count, help = "Verbosity level (e.g., -v, -vv)")]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve per-batch targeted Bloom filters over the named-pipe protocol
    Serve(ServeArgs),
    /// Build a byte-offset index for a FASTA/FASTQ file
    Index(IndexArgs),
    /// Write the rendezvous byte to a FIFO and exit
    Hold(HoldArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[clap(long, required = true, help = "Target sequences (FASTA/FASTQ)")]
    pub target_seqs: PathBuf,

    #[clap(long, required = true, help = "Byte-offset index for the target sequences")]
    pub target_index: PathBuf,

    #[clap(
        long,
        required = true,
        help = "Mappings between targets and mapped sequences (ntLink triples or SAM, optionally gzipped)"
    )]
    pub mappings: PathBuf,

    #[clap(long, required = true, help = "Mapped sequences (FASTA/FASTQ)")]
    pub mapped_seqs: PathBuf,

    #[clap(long, required = true, help = "Byte-offset index for the mapped sequences")]
    pub mapped_index: PathBuf,

    #[clap(
        long,
        default_value_t = 150.0,
        help = "Mapped seqs allowed per target per 10 kbp before adaptive minimizer thresholding"
    )]
    pub mx_max_per_10kbp: f64,

    #[clap(
        long,
        default_value_t = 120.0,
        help = "Mapped seqs ingested per target per 10 kbp of target length"
    )]
    pub subsample_max_per_10kbp: f64,

    #[clap(short, long, required = true, num_args = 1.., help = "K-mer sizes, one filter pair per k")]
    pub kmer_sizes: Vec<u32>,

    #[clap(
        long,
        default_value_t = 10 * 1024 * 1024,
        help = "Counting Bloom filter size in bytes"
    )]
    pub cbf_bytes: usize,

    #[clap(
        long,
        default_value_t = 512 * 1024,
        help = "Solid k-mer Bloom filter size in bytes"
    )]
    pub bf_bytes: usize,

    #[clap(long, default_value_t = 4, help = "Hashes per k-mer")]
    pub hash_num: u32,
}

#[derive(Parser, Debug)]
pub struct IndexArgs {
    #[clap(help = "Input FASTA/FASTQ file")]
    pub seqs_file: PathBuf,

    #[clap(help = "Output index file")]
    pub index_file: PathBuf,
}

#[derive(Parser, Debug)]
pub struct HoldArgs {
    #[clap(help = "FIFO to write the rendezvous byte to")]
    pub fifo_path: PathBuf,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}
