use crc::{Crc, CRC_32_ISO_HDLC, CRC_64_ECMA_182};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Hash of an AoR or contact URI, used to pick a shard and to short-circuit
/// byte comparisons during lookups.
pub fn key_hash(key: &str) -> u32 {
    CRC32.checksum(key.as_bytes())
}

/// Shard index for `hash` in a table of `size` shards. `size` is a power of two.
pub fn shard_of(hash: u32, size: usize) -> usize {
    (hash as usize) & (size - 1)
}

/// CRC-64 of a journal frame.
pub fn frame_checksum(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}
