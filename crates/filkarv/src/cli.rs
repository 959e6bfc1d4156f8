use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub(crate) struct Cli {
    /// Increase log verbosity (-v: info, -vv: debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Scan a file and write the meta-directory tree
    Scan {
        /// The file to scan
        path: PathBuf,
        /// Directory the meta-directory tree is materialised in
        #[arg(short, long)]
        unpack_directory: PathBuf,
        /// Scratch directory for parser temporary files (defaults to a
        /// subdirectory of the system temp dir)
        #[arg(long)]
        temporary_directory: Option<PathBuf>,
        /// Worker pool size (defaults to the CPU count)
        #[arg(short = 'j', long)]
        workers: Option<usize>,
        /// Idle worker timeout in seconds
        #[arg(long)]
        job_wait_time: Option<u64>,
        /// Skip the TLSH digest for files larger than this many bytes
        #[arg(long)]
        tlsh_maximum: Option<u64>,
    },
    /// Print labels and metadata of one meta-directory
    Show {
        /// Path to a meta-directory (e.g. <unpack-root>/root)
        md_path: PathBuf,
        /// Dump the whole info record as JSON
        #[arg(long)]
        json: bool,
    },
}
