//! CRC-32 frame trailer.

/// Size of the checksum trailer
pub const CHECKSUM_SIZE: usize = 4;

/// CRC-32 over `bytes`, starting from `seed`.
///
/// Plaintext frames use seed 0; encrypted frames use the negotiated
/// checksum key so a frame cannot be re-checksummed without the key.
pub fn frame_checksum(seed: u32, bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(bytes);
    hasher.finalize()
}
