//! Single pass content digesting
//!
//! Every file entering the scheduler is read exactly once; this module
//! computes all digests plus the byte histogram used for content
//! labelling in that one pass.

use compact_str::CompactString;
use eyre::WrapErr;
use filkarv_types::ContentHashes;
use md5::Digest as _;
use sha1::Digest as _;
use std::io::ErrorKind;
use std::io::Read;

/// How much of the head of the file is retained for content sniffing
/// (shebang lines and the like).
const HEAD_LEN: usize = 1024;

/// Result of digesting one byte stream.
#[derive(Debug, Clone)]
pub struct DigestSummary {
    pub hashes: ContentHashes,
    pub size: u64,
    /// Count per byte value over the whole stream.
    pub histogram: Box<[u64; 256]>,
    /// The first bytes of the stream (up to 1 KiB).
    pub head: Vec<u8>,
}

impl DigestSummary {
    /// Number of distinct byte values present.
    pub fn distinct_bytes(&self) -> usize {
        self.histogram.iter().filter(|&&count| count > 0).count()
    }
}

/// Streaming digest state. Feed with [`Self::update`], then [`Self::finish`].
pub struct ContentDigest {
    sha256: ring::digest::Context,
    sha1: sha1::Sha1,
    md5: md5::Md5,
    tlsh: Option<tlsh2::TlshDefaultBuilder>,
    histogram: Box<[u64; 256]>,
    head: Vec<u8>,
    size: u64,
}

impl ContentDigest {
    /// `with_tlsh` is off for files above the configured TLSH maximum.
    pub fn new(with_tlsh: bool) -> Self {
        Self {
            sha256: ring::digest::Context::new(&ring::digest::SHA256),
            sha1: sha1::Sha1::new(),
            md5: md5::Md5::new(),
            tlsh: with_tlsh.then(tlsh2::TlshDefaultBuilder::new),
            histogram: Box::new([0; 256]),
            head: Vec::with_capacity(HEAD_LEN),
            size: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.sha1.update(data);
        self.md5.update(data);
        if let Some(tlsh) = self.tlsh.as_mut() {
            tlsh.update(data);
        }
        for &byte in data {
            self.histogram[usize::from(byte)] += 1;
        }
        if self.head.len() < HEAD_LEN {
            let take = (HEAD_LEN - self.head.len()).min(data.len());
            self.head.extend_from_slice(&data[..take]);
        }
        self.size += data.len() as u64;
    }

    pub fn finish(self) -> DigestSummary {
        let sha256 = self.sha256.finish();
        let sha256 = sha256.as_ref().try_into().expect("Invalid digest length");
        let sha1 = self.sha1.finalize();
        let sha1 = sha1.as_slice().try_into().expect("Invalid digest length");
        let md5 = self.md5.finalize();
        let md5 = md5.as_slice().try_into().expect("Invalid digest length");
        // TLSH has a minimum input size; below it no digest is produced
        let tlsh = self.tlsh.and_then(|builder| {
            let tlsh = builder.build()?;
            let hash = tlsh.hash();
            Some(CompactString::from(String::from_utf8_lossy(hash.as_ref())))
        });
        DigestSummary {
            hashes: ContentHashes {
                sha256,
                sha1,
                md5,
                tlsh,
            },
            size: self.size,
            histogram: self.histogram,
            head: self.head,
        }
    }
}

/// Digest an entire reader in `read_size` sized chunks.
pub fn digest_reader(
    reader: &mut impl Read,
    read_size: usize,
    with_tlsh: bool,
) -> eyre::Result<DigestSummary> {
    let mut digest = ContentDigest::new(with_tlsh);
    let mut buffer = vec![0; read_size.max(4096)];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => digest.update(&buffer[..n]),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => Err(e).wrap_err("IO error while digesting")?,
        }
    }
    Ok(digest.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sha1::Digest as _;

    #[test]
    fn test_empty_input() {
        let summary = digest_reader(&mut std::io::empty(), 4096, true).expect("digest");
        assert_eq!(summary.size, 0);
        assert_eq!(summary.distinct_bytes(), 0);
        // Well known digests of the empty string
        assert_eq!(
            faster_hex::hex_string(&summary.hashes.sha256),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            faster_hex::hex_string(&summary.hashes.md5),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(summary.hashes.tlsh, None);
    }

    #[test]
    fn test_histogram_and_head() {
        let data = b"abba\x00";
        let summary = digest_reader(&mut &data[..], 2, false).expect("digest");
        assert_eq!(summary.size, 5);
        assert_eq!(summary.histogram[usize::from(b'a')], 2);
        assert_eq!(summary.histogram[usize::from(b'b')], 2);
        assert_eq!(summary.histogram[0], 1);
        assert_eq!(summary.distinct_bytes(), 3);
        assert_eq!(summary.head, data);
        assert_eq!(
            faster_hex::hex_string(&summary.hashes.sha1),
            faster_hex::hex_string(&{
                let mut h = sha1::Sha1::new();
                h.update(data);
                let out: [u8; 20] = h.finalize().into();
                out
            })
        );
    }
}
