/// Soft-reset record.
///
/// Before replacing itself in place (live update), a running kernel writes
/// this record and re-enters the new image with `SOFT_RESET_MAGIC` instead
/// of the multiboot magic. The new kernel has no bootloader info at all, so
/// the record is the only source of the memory bound. It also tells the
/// heap how much space the preserved live-update state occupies.
///
/// Layout (little-endian):
///   0  magic u32           4  version u32
///   8  liveupdate_loc u64  16 liveupdate_size u64
///   24 high_mem u64        32 SHA-256 over bytes 0..32
use core::fmt;

use sha2::{Digest, Sha256};

use crate::{le32, le64};

/// Value the previous kernel passes instead of the multiboot magic.
pub const SOFT_RESET_MAGIC: u32 = 0xFEE1_DEAD;

const RECORD_VERSION: u32 = 1;
const DIGEST_OFFSET: usize = 32;

/// Total encoded size.
pub const RECORD_SIZE: usize = DIGEST_OFFSET + 32;

pub fn is_softreset_magic(magic: u32) -> bool {
    magic == SOFT_RESET_MAGIC
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftResetError {
    TooShort(usize),
    BadMagic(u32),
    BadVersion(u32),
    DigestMismatch,
    /// `high_mem` does not lie above the live-update area.
    InvalidBounds { liveupdate_end: u64, high_mem: u64 },
}

impl fmt::Display for SoftResetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoftResetError::TooShort(len) => {
                write!(f, "soft-reset record truncated ({} of {} bytes)", len, RECORD_SIZE)
            }
            SoftResetError::BadMagic(m) => write!(f, "soft-reset record has bad magic {:#x}", m),
            SoftResetError::BadVersion(v) => write!(f, "unsupported soft-reset record version {}", v),
            SoftResetError::DigestMismatch => write!(f, "soft-reset record digest mismatch"),
            SoftResetError::InvalidBounds { liveupdate_end, high_mem } => write!(
                f,
                "soft-reset high memory {:#x} below live-update end {:#x}",
                high_mem, liveupdate_end
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftResetRecord {
    pub liveupdate_loc: u64,
    pub liveupdate_size: u64,
    pub high_mem: u64,
}

impl SoftResetRecord {
    /// Decode and verify a record.
    pub fn parse(bytes: &[u8]) -> Result<Self, SoftResetError> {
        if bytes.len() < RECORD_SIZE {
            return Err(SoftResetError::TooShort(bytes.len()));
        }

        let magic = le32(bytes, 0);
        if magic != SOFT_RESET_MAGIC {
            return Err(SoftResetError::BadMagic(magic));
        }
        let version = le32(bytes, 4);
        if version != RECORD_VERSION {
            return Err(SoftResetError::BadVersion(version));
        }

        let digest = Sha256::digest(&bytes[..DIGEST_OFFSET]);
        if digest.as_slice() != &bytes[DIGEST_OFFSET..RECORD_SIZE] {
            return Err(SoftResetError::DigestMismatch);
        }

        let record = Self {
            liveupdate_loc: le64(bytes, 8),
            liveupdate_size: le64(bytes, 16),
            high_mem: le64(bytes, 24),
        };

        let liveupdate_end = record.liveupdate_loc.saturating_add(record.liveupdate_size);
        if record.high_mem <= liveupdate_end {
            return Err(SoftResetError::InvalidBounds { liveupdate_end, high_mem: record.high_mem });
        }

        Ok(record)
    }

    /// Encode with a fresh digest. Used by the live-update path of the
    /// outgoing kernel.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..4].copy_from_slice(&SOFT_RESET_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&RECORD_VERSION.to_le_bytes());
        out[8..16].copy_from_slice(&self.liveupdate_loc.to_le_bytes());
        out[16..24].copy_from_slice(&self.liveupdate_size.to_le_bytes());
        out[24..32].copy_from_slice(&self.high_mem.to_le_bytes());
        let digest = Sha256::digest(&out[..DIGEST_OFFSET]);
        out[DIGEST_OFFSET..].copy_from_slice(digest.as_slice());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SoftResetRecord {
        SoftResetRecord {
            liveupdate_loc: 0x3F00_0000,
            liveupdate_size: 0x40_0000,
            high_mem: 0x4000_0000,
        }
    }

    #[test]
    fn accepts_record_written_by_previous_kernel() {
        let raw = record().encode();
        assert_eq!(SoftResetRecord::parse(&raw), Ok(record()));
    }

    #[test]
    fn corrupted_field_fails_digest() {
        let mut raw = record().encode();
        raw[25] ^= 0x01;
        assert_eq!(SoftResetRecord::parse(&raw), Err(SoftResetError::DigestMismatch));
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut raw = record().encode();
        raw[0..4].copy_from_slice(&0x2BAD_B002u32.to_le_bytes());
        assert_eq!(SoftResetRecord::parse(&raw), Err(SoftResetError::BadMagic(0x2BAD_B002)));
    }

    #[test]
    fn high_mem_must_clear_liveupdate_area() {
        let bad = SoftResetRecord { high_mem: 0x3F40_0000, ..record() };
        let raw = bad.encode();
        assert!(matches!(
            SoftResetRecord::parse(&raw),
            Err(SoftResetError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn truncated_record_rejected() {
        let raw = record().encode();
        assert_eq!(SoftResetRecord::parse(&raw[..40]), Err(SoftResetError::TooShort(40)));
        assert!(is_softreset_magic(0xFEE1_DEAD));
        assert!(!is_softreset_magic(0x2BAD_B002));
    }
}
