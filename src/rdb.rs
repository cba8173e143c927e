use bytes::Bytes;

/// An empty RDB file, sent verbatim after `FULLRESYNC` in place of a real
/// point-in-time snapshot.
const EMPTY_RDB_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

const MAGIC: &[u8] = b"REDIS";

/// Decodes the built-in empty snapshot payload.
pub fn empty_snapshot() -> Result<Bytes, hex::FromHexError> {
    hex::decode(EMPTY_RDB_HEX).map(Bytes::from)
}

/// Returns the four-digit format version if `payload` starts with an RDB header.
pub fn header_version(payload: &[u8]) -> Option<&str> {
    if payload.len() < 9 || &payload[..5] != MAGIC {
        return None;
    }
    std::str::from_utf8(&payload[5..9])
        .ok()
        .filter(|v| v.bytes().all(|b| b.is_ascii_digit()))
}
