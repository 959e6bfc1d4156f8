//! Content digests of a scanned file

use compact_str::CompactString;

/// All digests computed over one byte sequence in a single streaming pass.
///
/// TLSH is absent for files that are too small to produce a digest or that
/// exceed the configured `tlsh_maximum`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContentHashes {
    #[serde(
        serialize_with = "crate::utils::buffer_to_hex",
        deserialize_with = "crate::utils::hex_to_buffer"
    )]
    pub sha256: [u8; 32],
    #[serde(
        serialize_with = "crate::utils::buffer_to_hex",
        deserialize_with = "crate::utils::hex_to_buffer"
    )]
    pub sha1: [u8; 20],
    #[serde(
        serialize_with = "crate::utils::buffer_to_hex",
        deserialize_with = "crate::utils::hex_to_buffer"
    )]
    pub md5: [u8; 16],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlsh: Option<CompactString>,
}

impl std::fmt::Display for ContentHashes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", faster_hex::hex_string(&self.sha256))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hex_round_trip() {
        let hashes = ContentHashes {
            sha256: [0xab; 32],
            sha1: [0x01; 20],
            md5: [0xff; 16],
            tlsh: None,
        };
        let encoded = serde_cbor::to_vec(&hashes).expect("encode");
        let decoded: ContentHashes = serde_cbor::from_slice(&encoded).expect("decode");
        assert_eq!(hashes, decoded);
    }
}
