//! Bulk-only transport wrappers (CBW/CSW).
//!
//! Both structures are little-endian and fixed size on the wire: the Command Block Wrapper is
//! 31 bytes, the Command Status Wrapper 13 bytes.

use crate::transfer::Direction;

pub const CBW_SIGNATURE: u32 = 0x4342_5355;
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// Capacity of the CBWCB field.
pub const CBW_CB_CAPACITY: usize = 16;
/// Command bytes the driver fills in (UFI/SCSI 10-byte commands).
pub const CDB_LEN: usize = 10;

pub const CBW_FLAGS_DIRECTION_IN: u8 = 0x80;

// The logical unit lives in bits 7..5 of CDB byte 1 for UFI and SCSI-2 style commands.
const CDB_LUN_SHIFT: u8 = 5;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("wrapper has {actual} bytes, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("bad wrapper signature {0:#010x}")]
    BadSignature(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cb: [u8; CBW_CB_CAPACITY],
}

impl CommandBlockWrapper {
    pub fn new(tag: u32, data_transfer_length: u32, direction: Direction, cdb: &[u8; CDB_LEN]) -> Self {
        let mut cb = [0u8; CBW_CB_CAPACITY];
        cb[..CDB_LEN].copy_from_slice(cdb);
        let flags = match direction {
            Direction::In => CBW_FLAGS_DIRECTION_IN,
            Direction::Out => 0,
        };
        Self {
            tag,
            data_transfer_length,
            flags,
            lun: (cdb[1] >> CDB_LUN_SHIFT) & 0x0f,
            cb_length: CDB_LEN as u8,
            cb,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.flags & CBW_FLAGS_DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut out = [0u8; CBW_LEN];
        out[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        out[12] = self.flags;
        out[13] = self.lun & 0x0f;
        out[14] = self.cb_length;
        out[15..31].copy_from_slice(&self.cb);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != CBW_LEN {
            return Err(WireError::InvalidLength {
                expected: CBW_LEN,
                actual: bytes.len(),
            });
        }
        let signature = read_u32(bytes, 0);
        if signature != CBW_SIGNATURE {
            return Err(WireError::BadSignature(signature));
        }
        let mut cb = [0u8; CBW_CB_CAPACITY];
        cb.copy_from_slice(&bytes[15..31]);
        Ok(Self {
            tag: read_u32(bytes, 4),
            data_transfer_length: read_u32(bytes, 8),
            flags: bytes[12],
            lun: bytes[13] & 0x0f,
            cb_length: bytes[14],
            cb,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CswStatus {
    Passed,
    Failed,
    PhaseError,
    Reserved(u8),
}

impl From<u8> for CswStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => CswStatus::Passed,
            1 => CswStatus::Failed,
            2 => CswStatus::PhaseError,
            other => CswStatus::Reserved(other),
        }
    }
}

impl From<CswStatus> for u8 {
    fn from(value: CswStatus) -> Self {
        match value {
            CswStatus::Passed => 0,
            CswStatus::Failed => 1,
            CswStatus::PhaseError => 2,
            CswStatus::Reserved(other) => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub residue: u32,
    pub status: CswStatus,
}

impl CommandStatusWrapper {
    /// Parses a CSW. Short, long, and mis-signed wrappers are transport violations.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != CSW_LEN {
            return Err(WireError::InvalidLength {
                expected: CSW_LEN,
                actual: bytes.len(),
            });
        }
        let signature = read_u32(bytes, 0);
        if signature != CSW_SIGNATURE {
            return Err(WireError::BadSignature(signature));
        }
        Ok(Self {
            tag: read_u32(bytes, 4),
            residue: read_u32(bytes, 8),
            status: CswStatus::from(bytes[12]),
        })
    }

    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut out = [0u8; CSW_LEN];
        out[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.residue.to_le_bytes());
        out[12] = self.status.into();
        out
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}
