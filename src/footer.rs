//! The 32-byte block footer (§3, §6) and the checksum operations the storage
//! core treats opaquely: compute, clear, and verify over the 32 footer bytes
//! and the preceding `blockSize - 32` bytes of payload.
//!
//! Layout mirrors the teacher's `RootHeader`: a `#[repr(C)]`,
//! `bytemuck::Pod`/`Zeroable` struct read straight off the tail of a block
//! buffer, with the checksum itself computed via xxh3 (the teacher's
//! algorithm of choice, via `xxhash-rust`).

use bytemuck::{Pod, Zeroable};

/// Size in bytes of every block footer.
pub const FOOTER_SIZE: usize = 32;

/// Checksum state stored at footer byte 28.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumState {
    NotValid = 0,
    Valid = 1,
    MustBeRecomputed = 2,
}

impl ChecksumState {
    fn from_u8(v: u8) -> ChecksumState {
        match v {
            1 => ChecksumState::Valid,
            2 => ChecksumState::MustBeRecomputed,
            _ => ChecksumState::NotValid,
        }
    }
}

/// Raw, `#[repr(C)]` view of the 32-byte footer, laid out exactly as the
/// wire format table in §6 describes it (little-endian throughout).
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawFooter {
    block_type: u8,
    _reserved0: u8,
    file_id: u16,
    index_value: u32,
    snapshot_sequence: u32,
    checksum_bytes: [u8; 16],
    checksum_state: u8,
    _reserved1: [u8; 3],
}

const _: () = assert!(std::mem::size_of::<RawFooter>() == FOOTER_SIZE);

/// A parsed view over a block's trailing footer bytes.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub block_type: u8,
    pub file_id: u16,
    pub index_value: u32,
    pub snapshot_sequence: u32,
    pub checksum: u64,
    pub state: ChecksumState,
}

impl Footer {
    /// Parse the trailing `FOOTER_SIZE` bytes of `block` into a `Footer`.
    ///
    /// # Panics
    /// Panics if `block` is shorter than `FOOTER_SIZE`.
    pub fn read(block: &[u8]) -> Footer {
        let start = block.len() - FOOTER_SIZE;
        let raw: &RawFooter = bytemuck::from_bytes(&block[start..]);
        let checksum = u64::from_le_bytes(raw.checksum_bytes[0..8].try_into().unwrap());
        Footer {
            block_type: raw.block_type,
            file_id: u16::from_le(raw.file_id),
            index_value: u32::from_le(raw.index_value),
            snapshot_sequence: u32::from_le(raw.snapshot_sequence),
            checksum,
            state: ChecksumState::from_u8(raw.checksum_state),
        }
    }

    /// Write identification fields (type/file id/index/snapshot) into the
    /// trailing footer of `block`, marking the checksum as
    /// `MustBeRecomputed`. Does not compute the checksum itself; call
    /// [`compute_checksum`] afterward.
    ///
    /// # Panics
    /// Panics if `block` is shorter than `FOOTER_SIZE`.
    pub fn write_identity(
        block: &mut [u8],
        block_type: u8,
        file_id: u16,
        index_value: u32,
        snapshot_sequence: u32,
    ) {
        let start = block.len() - FOOTER_SIZE;
        let raw: &mut RawFooter = bytemuck::from_bytes_mut(&mut block[start..]);
        raw.block_type = block_type;
        raw.file_id = file_id.to_le();
        raw.index_value = index_value.to_le();
        raw.snapshot_sequence = snapshot_sequence.to_le();
        raw.checksum_state = ChecksumState::MustBeRecomputed as u8;
        raw.checksum_bytes = [0u8; 16];
    }

    /// Clear the checksum state to `NotValid` without touching identity
    /// fields, used before a block is overwritten in place.
    pub fn clear_checksum_state(block: &mut [u8]) {
        let start = block.len() - FOOTER_SIZE;
        let raw: &mut RawFooter = bytemuck::from_bytes_mut(&mut block[start..]);
        raw.checksum_state = ChecksumState::NotValid as u8;
    }
}

/// Compute the xxh3 checksum over `block[..block.len() - FOOTER_SIZE]`,
/// write it into the footer's checksum bytes, and mark the state `Valid`.
///
/// # Panics
/// Panics if `block` is shorter than `FOOTER_SIZE`.
pub fn compute_checksum(block: &mut [u8]) {
    let payload_len = block.len() - FOOTER_SIZE;
    let hash = xxhash_rust::xxh3::xxh3_64(&block[..payload_len]);
    let start = payload_len;
    let raw: &mut RawFooter = bytemuck::from_bytes_mut(&mut block[start..]);
    raw.checksum_bytes[0..8].copy_from_slice(&hash.to_le_bytes());
    raw.checksum_bytes[8..16].fill(0);
    raw.checksum_state = ChecksumState::Valid as u8;
}

/// Verify that `block`'s footer checksum matches its payload. A footer whose
/// state is `NotValid` always fails verification; `MustBeRecomputed` is
/// treated as not-yet-verifiable (also a failure) until recomputed.
pub fn verify_checksum(block: &[u8]) -> bool {
    let footer = Footer::read(block);
    if footer.state != ChecksumState::Valid {
        return false;
    }
    let payload_len = block.len() - FOOTER_SIZE;
    let hash = xxhash_rust::xxh3::xxh3_64(&block[..payload_len]);
    hash == footer.checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Vec<u8> {
        vec![0xABu8; 4096]
    }

    #[test]
    fn roundtrip_identity_and_checksum() {
        let mut block = sample_block();
        Footer::write_identity(&mut block, 7, 42, 99, 3);
        compute_checksum(&mut block);
        let footer = Footer::read(&block);
        assert_eq!(footer.block_type, 7);
        assert_eq!(footer.file_id, 42);
        assert_eq!(footer.index_value, 99);
        assert_eq!(footer.snapshot_sequence, 3);
        assert_eq!(footer.state, ChecksumState::Valid);
        assert!(verify_checksum(&block));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut block = sample_block();
        Footer::write_identity(&mut block, 1, 1, 1, 1);
        compute_checksum(&mut block);
        block[0] ^= 0xFF;
        assert!(!verify_checksum(&block));
    }

    #[test]
    fn not_valid_state_fails_verification() {
        let mut block = sample_block();
        Footer::write_identity(&mut block, 1, 1, 1, 1);
        compute_checksum(&mut block);
        Footer::clear_checksum_state(&mut block);
        assert!(!verify_checksum(&block));
    }
}
