//! Bootloader wire protocol: opcodes, request framing and the byte order
//! used for multi-byte fields.

use core::fmt;

use crate::crc::crc32;

/// Acknowledgment status byte
pub const BL_ACK: u8 = 0xCD;
/// Status byte the bootloader sends when a frame is rejected
pub const BL_NACK: u8 = 0xAB;

/// Largest data block carried by a single memory write frame
pub const MAX_CHUNK: usize = 128;

/// Start sector value requesting a mass erase
pub const MASS_ERASE: u8 = 0xFF;

/// Read protection status reported when the level could not be read
pub const RDP_READ_ERROR: u8 = 0xEE;

/// Length of the CRC trailer
pub const CRC_LEN: usize = 4;

/// Length byte plus opcode
pub const HEADER_LEN: usize = 2;

/// Largest payload that still fits the `u8` length field
pub const MAX_PAYLOAD: usize = u8::MAX as usize + 1 - HEADER_LEN - CRC_LEN;

/// Errors raised while building requests or interpreting responses
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unknown response code 0x{code:02x} for {command}")]
    UnknownResponseCode { command: Opcode, code: u8 },

    #[error("short response for {command}: expected {expected} bytes, got {actual}")]
    ShortResponse {
        command: Opcode,
        expected: usize,
        actual: usize,
    },

    #[error("{0} is not implemented by the bootloader")]
    NotImplemented(Opcode),

    #[error("unexpected response to {0}")]
    UnexpectedResponse(Opcode),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Opcode {
    /// Reads the bootloader vendor id and version
    GetVersion = 0x10,

    /// Reads the list of opcodes the bootloader supports
    GetHelp = 0x11,

    /// Reads the MCU chip identification number
    GetChipId = 0x12,

    /// Reads the flash read protection level
    GetReadProtection = 0x13,

    /// Jumps to an address specified by the host
    GoToAddress = 0x14,

    /// Mass erase, or erase a range of flash sectors
    EraseFlash = 0x15,

    /// Writes up to 128 bytes to flash starting from an address specified by the host
    WriteMemory = 0x16,

    /// Enables or disables write protection (declared, not implemented)
    WriteProtect = 0x17,

    /// Reads memory (declared, not implemented)
    ReadMemory = 0x18,

    /// Reads the sector write protection status (declared, not implemented)
    GetWriteProtection = 0x19,

    /// Reads the OTP area (declared, not implemented)
    ReadOtp = 0x1A,

    /// Changes the flash read protection level
    SetReadProtection = 0x1B,

    /// Jumps to the resident user application
    JumpToApplication = 0x1C,
}

impl Opcode {
    pub const ALL: [Opcode; 13] = [
        Opcode::GetVersion,
        Opcode::GetHelp,
        Opcode::GetChipId,
        Opcode::GetReadProtection,
        Opcode::GoToAddress,
        Opcode::EraseFlash,
        Opcode::WriteMemory,
        Opcode::WriteProtect,
        Opcode::ReadMemory,
        Opcode::GetWriteProtection,
        Opcode::ReadOtp,
        Opcode::SetReadProtection,
        Opcode::JumpToApplication,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|o| *o as u8 == v)
    }

    /// Whether the bootloader actually services this opcode
    pub fn is_implemented(&self) -> bool {
        !matches!(
            self,
            Opcode::WriteProtect
                | Opcode::ReadMemory
                | Opcode::GetWriteProtection
                | Opcode::ReadOtp
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::GetVersion => "GET_VERSION",
            Opcode::GetHelp => "GET_HELP",
            Opcode::GetChipId => "GET_CHIP_ID",
            Opcode::GetReadProtection => "GET_RDP_STATUS",
            Opcode::GoToAddress => "GO_TO_ADDR",
            Opcode::EraseFlash => "FLASH_ERASE",
            Opcode::WriteMemory => "MEM_WRITE",
            Opcode::WriteProtect => "EN_DIS_WRITE_PROTECT",
            Opcode::ReadMemory => "MEM_READ",
            Opcode::GetWriteProtection => "READ_SECTOR_STATUS",
            Opcode::ReadOtp => "OTP_READ",
            Opcode::SetReadProtection => "CHANGE_RDP_LEVEL",
            Opcode::JumpToApplication => "JUMP_TO_USER_APP",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.name(), *self as u8)
    }
}

/// Flash read protection level
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProtectionLevel {
    Level0,
    Level1,
    /// Reported by the device, never requested by the host
    Level2,
}

impl ProtectionLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ProtectionLevel::Level0),
            1 => Some(ProtectionLevel::Level1),
            2 => Some(ProtectionLevel::Level2),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ProtectionLevel::Level0 => 0,
            ProtectionLevel::Level1 => 1,
            ProtectionLevel::Level2 => 2,
        }
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LEVEL {}", self.as_u8())
    }
}

/// Flash erase selection
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Erase {
    /// Erase the whole user flash
    Mass,
    /// Erase `count` sectors starting at `start`
    Sectors { start: u8, count: u8 },
}

impl Erase {
    /// Build from the raw start/count pair, honouring the mass erase sentinel
    pub fn from_raw(start: u8, count: u8) -> Self {
        if start == MASS_ERASE {
            Erase::Mass
        } else {
            Erase::Sectors { start, count }
        }
    }

    fn to_bytes(&self) -> [u8; 2] {
        match self {
            Erase::Mass => [MASS_ERASE, 0x00],
            Erase::Sectors { start, count } => [*start, *count],
        }
    }
}

/// Extract byte `index` (1 = least significant) of a 32-bit word
pub fn word_byte(value: u32, index: u8) -> u8 {
    debug_assert!((1..=4).contains(&index));
    ((value >> (8 * u32::from(index - 1))) & 0xFF) as u8
}

/// Split a word into its transmission order (least significant byte first)
pub fn word_to_bytes(value: u32) -> [u8; 4] {
    [
        word_byte(value, 1),
        word_byte(value, 2),
        word_byte(value, 3),
        word_byte(value, 4),
    ]
}

/// A single host to bootloader request
#[derive(Debug, PartialEq, Clone)]
pub enum Request<'a> {
    GetVersion,
    GetHelp,
    GetChipId,
    GetReadProtection,
    GoToAddress { address: u32 },
    EraseFlash(Erase),
    /// One chunk of a memory write, at most [`MAX_CHUNK`] bytes
    WriteMemory { address: u32, data: &'a [u8] },
    SetReadProtection(ProtectionLevel),
    JumpToApplication,
}

impl<'a> Request<'a> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::GetVersion => Opcode::GetVersion,
            Request::GetHelp => Opcode::GetHelp,
            Request::GetChipId => Opcode::GetChipId,
            Request::GetReadProtection => Opcode::GetReadProtection,
            Request::GoToAddress { .. } => Opcode::GoToAddress,
            Request::EraseFlash(_) => Opcode::EraseFlash,
            Request::WriteMemory { .. } => Opcode::WriteMemory,
            Request::SetReadProtection(_) => Opcode::SetReadProtection,
            Request::JumpToApplication => Opcode::JumpToApplication,
        }
    }

    /// Opcode specific payload, validated before anything is sent
    pub fn payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Request::GetVersion
            | Request::GetHelp
            | Request::GetChipId
            | Request::GetReadProtection
            | Request::JumpToApplication => Vec::new(),

            Request::GoToAddress { address } => word_to_bytes(*address).to_vec(),

            Request::EraseFlash(erase) => erase.to_bytes().to_vec(),

            Request::WriteMemory { address, data } => {
                if data.is_empty() || data.len() > MAX_CHUNK {
                    return Err(ProtocolError::InvalidParameter(format!(
                        "memory write chunk of {} bytes (expected 1..={})",
                        data.len(),
                        MAX_CHUNK
                    )));
                }

                let mut p = Vec::with_capacity(5 + data.len());
                p.extend_from_slice(&word_to_bytes(*address));
                p.push(data.len() as u8);
                p.extend_from_slice(data);
                p
            }

            Request::SetReadProtection(level) => match level {
                ProtectionLevel::Level2 => {
                    return Err(ProtocolError::InvalidParameter(
                        "protection level 2 is not supported".to_string(),
                    ))
                }
                _ => vec![level.as_u8()],
            },
        };

        Ok(payload)
    }

    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        Frame::new(self.opcode(), self.payload()?)
    }
}

/// Encoded request frame
///
/// `[length][opcode][payload..][crc32 LE]` where `length` is the frame size
/// minus one and the CRC covers everything before it.
#[derive(Debug, PartialEq, Clone)]
pub struct Frame {
    pub length: u8,
    pub opcode: u8,
    pub payload: Vec<u8>,
    pub crc: u32,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if !opcode.is_implemented() {
            return Err(ProtocolError::NotImplemented(opcode));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::InvalidParameter(format!(
                "payload of {} bytes exceeds frame limit of {}",
                payload.len(),
                MAX_PAYLOAD
            )));
        }

        let length = (HEADER_LEN + payload.len() + CRC_LEN - 1) as u8;

        let mut covered = Vec::with_capacity(HEADER_LEN + payload.len());
        covered.push(length);
        covered.push(opcode as u8);
        covered.extend_from_slice(&payload);

        Ok(Self {
            length,
            opcode: opcode as u8,
            payload,
            crc: crc32(&covered),
        })
    }

    /// Serialized size in bytes
    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len() + CRC_LEN
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(self.len());
        b.push(self.length);
        b.push(self.opcode);
        b.extend_from_slice(&self.payload);
        b.extend_from_slice(&word_to_bytes(self.crc));
        b
    }
}
