//! Internal helpers

/// Serializes `buffer` to a lowercase hex string.
pub(crate) fn buffer_to_hex<T, S>(buffer: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: serde::Serializer,
{
    let buffer = buffer.as_ref();
    // We only use this for digests, so small buffers. On the stack it goes:
    let mut buf = [0u8; 128];
    let s = faster_hex::hex_encode(buffer, &mut buf)
        .expect("This shouldn't fail on the data we use it for");
    serializer.serialize_str(s[0..buffer.len() * 2].as_ref())
}

/// Deserializes a lowercase hex string into a fixed size buffer.
pub(crate) fn hex_to_buffer<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    let s = compact_str::CompactString::deserialize(deserializer)?;
    let mut buf = [0u8; N];
    if s.len() != N * 2 {
        return Err(serde::de::Error::invalid_length(s.len(), &"hex digest"));
    }
    faster_hex::hex_decode(s.as_bytes(), &mut buf).map_err(serde::de::Error::custom)?;
    Ok(buf)
}
