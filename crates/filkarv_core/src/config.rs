//! Configuration of a scan
//!
//! The environment is immutable once the scheduler starts and is shared
//! freely between workers.

use std::path::PathBuf;
use std::time::Duration;

/// Everything a scan needs to know about its surroundings.
#[derive(Debug, derive_builder::Builder)]
#[non_exhaustive]
pub struct ScanEnvironment {
    /// Directory where meta-directories are materialised
    pub unpack_directory: PathBuf,
    /// Directory for parser scratch files
    pub temporary_directory: PathBuf,
    /// Per-file cap for parsers that read a format in one shot
    #[builder(default = "10 * 1024 * 1024")]
    pub max_bytes: u64,
    /// Streaming chunk size for digesting and extraction
    #[builder(default = "1024 * 1024")]
    pub read_size: usize,
    /// Window size used when sweeping a file for signatures
    #[builder(default = "1024")]
    pub signature_chunk_size: usize,
    /// Files larger than this do not get a TLSH digest
    #[builder(default = "50 * 1024 * 1024")]
    pub tlsh_maximum: u64,
    /// How long an idle worker waits before checking for termination
    #[builder(default = "Duration::from_secs(10)")]
    pub job_wait_time: Duration,
    /// Worker pool size
    #[builder(default = "num_cpus::get()")]
    pub workers: usize,
    /// Emit more detailed progress information
    #[builder(default = "false")]
    pub verbose: bool,
}

impl ScanEnvironment {
    /// Get a builder for this struct
    pub fn builder() -> ScanEnvironmentBuilder {
        Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let env = ScanEnvironment::builder()
            .unpack_directory(PathBuf::from("/tmp/unpack"))
            .temporary_directory(PathBuf::from("/tmp/scratch"))
            .build()
            .expect("defaults");
        assert_eq!(env.max_bytes, 10 * 1024 * 1024);
        assert_eq!(env.read_size, 1024 * 1024);
        assert_eq!(env.signature_chunk_size, 1024);
        assert_eq!(env.job_wait_time, Duration::from_secs(10));
        assert!(env.workers >= 1);
    }
}
