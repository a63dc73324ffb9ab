//! Decoding of the payload that follows a bootloader acknowledgment.

use core::fmt;

use crate::protocol::{Opcode, ProtectionLevel, ProtocolError, RDP_READ_ERROR};

/// Bootloader identity
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Version {
    pub vendor: u8,
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Entry of the supported command list
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HelpEntry {
    Known(Opcode),
    Unknown(u8),
}

impl HelpEntry {
    fn from_u8(v: u8) -> Self {
        Opcode::from_u8(v).map(HelpEntry::Known).unwrap_or(HelpEntry::Unknown(v))
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReadProtection {
    Level(ProtectionLevel),
    /// The device failed to read its option bytes
    ReadError,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EraseStatus {
    /// Status 0: the bootloader uses this both for an invalid sector number
    /// and for an unsuccessful erase, the two cannot be told apart
    Failed,
    Success,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WriteStatus {
    /// Write failed or the address was rejected
    Failed,
    Success,
}

/// Decoded bootloader response
#[derive(Debug, PartialEq, Clone)]
pub enum Response {
    Version(Version),
    Help(Vec<HelpEntry>),
    ChipId(u16),
    ReadProtection(ReadProtection),
    /// Whether the jump address was accepted
    GoToAddress(bool),
    Erase(EraseStatus),
    Write(WriteStatus),
    /// Whether the protection level was changed
    ProtectionChanged(bool),
    /// Whether the jump happened, `false` when no application is present
    JumpToApplication(bool),
}

fn expect_len(command: Opcode, data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::ShortResponse {
            command,
            expected,
            actual: data.len(),
        });
    }
    if data.len() > expected && command != Opcode::GetHelp {
        debug!(
            "Ignoring {} trailing bytes in {} response",
            data.len() - expected,
            command
        );
    }
    Ok(())
}

fn flag(command: Opcode, code: u8) -> Result<bool, ProtocolError> {
    match code {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ProtocolError::UnknownResponseCode { command, code }),
    }
}

impl Response {
    /// Interpret the payload received for `command`
    pub fn decode(command: Opcode, data: &[u8]) -> Result<Self, ProtocolError> {
        let r = match command {
            Opcode::GetVersion => {
                expect_len(command, data, 4)?;
                Response::Version(Version {
                    vendor: data[0],
                    major: data[1],
                    minor: data[2],
                    patch: data[3],
                })
            }
            Opcode::GetHelp => {
                Response::Help(data.iter().map(|v| HelpEntry::from_u8(*v)).collect())
            }
            Opcode::GetChipId => {
                expect_len(command, data, 2)?;
                Response::ChipId(u16::from(data[1]) << 8 | u16::from(data[0]))
            }
            Opcode::GetReadProtection => {
                expect_len(command, data, 1)?;
                let status = match data[0] {
                    RDP_READ_ERROR => ReadProtection::ReadError,
                    code => ProtectionLevel::from_u8(code)
                        .map(ReadProtection::Level)
                        .ok_or(ProtocolError::UnknownResponseCode { command, code })?,
                };
                Response::ReadProtection(status)
            }
            Opcode::GoToAddress => {
                expect_len(command, data, 1)?;
                Response::GoToAddress(data[0] == 1)
            }
            Opcode::EraseFlash => {
                expect_len(command, data, 1)?;
                if flag(command, data[0])? {
                    Response::Erase(EraseStatus::Success)
                } else {
                    Response::Erase(EraseStatus::Failed)
                }
            }
            Opcode::WriteMemory => {
                expect_len(command, data, 1)?;
                if flag(command, data[0])? {
                    Response::Write(WriteStatus::Success)
                } else {
                    Response::Write(WriteStatus::Failed)
                }
            }
            Opcode::SetReadProtection => {
                expect_len(command, data, 1)?;
                Response::ProtectionChanged(flag(command, data[0])?)
            }
            Opcode::JumpToApplication => {
                expect_len(command, data, 1)?;
                Response::JumpToApplication(flag(command, data[0])?)
            }
            Opcode::WriteProtect
            | Opcode::ReadMemory
            | Opcode::GetWriteProtection
            | Opcode::ReadOtp => return Err(ProtocolError::NotImplemented(command)),
        };

        Ok(r)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Version(v) => {
                writeln!(f, "Bootloader Vendor ID : {}", v.vendor)?;
                write!(f, "Bootloader Version   : {}", v)
            }
            Response::Help(entries) => {
                write!(f, "Supported Commands :")?;
                for e in entries {
                    match e {
                        HelpEntry::Known(o) => write!(f, "\n   {:<22} --> 0x{:02x}", o.name(), *o as u8)?,
                        HelpEntry::Unknown(v) => write!(f, "\n   {:<22} --> 0x{:02x}", "UNKNOWN", v)?,
                    }
                }
                Ok(())
            }
            Response::ChipId(id) => write!(f, "Chip Identification Number : 0x{:04x}", id),
            Response::ReadProtection(ReadProtection::Level(l)) => {
                write!(f, "FLASH Protection : {}", l)
            }
            Response::ReadProtection(ReadProtection::ReadError) => {
                write!(f, "Error while reading FLASH protection level")
            }
            Response::GoToAddress(true) => write!(f, "Address Status is Valid"),
            Response::GoToAddress(false) => write!(f, "Address Status is Invalid"),
            Response::Erase(EraseStatus::Success) => write!(f, "Erase Status -> Successful Erase"),
            Response::Erase(EraseStatus::Failed) => {
                write!(f, "Erase Status -> Invalid Sector Number or Unsuccessful Erase")
            }
            Response::Write(WriteStatus::Success) => write!(f, "Write Status -> Write Successful"),
            Response::Write(WriteStatus::Failed) => {
                write!(f, "Write Status -> Write Failed or Invalid Address")
            }
            Response::ProtectionChanged(true) => write!(f, "ROP Level Changed"),
            Response::ProtectionChanged(false) => write!(f, "ROP Level Not Changed"),
            Response::JumpToApplication(true) => write!(f, "Jumped to user application"),
            Response::JumpToApplication(false) => write!(f, "There is no application burned yet"),
        }
    }
}
