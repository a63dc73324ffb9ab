//! Operator level commands, sequenced over a [`Programmer`].

use core::fmt;
use std::sync::atomic::AtomicBool;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{Erase, ProtectionLevel, Request};
use crate::response::Response;
use crate::transfer::{FlashWriteSession, Progress};
use crate::{Error, Programmer, SerialPort};

/// A logical bootloader operation with its parameters
#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    GetVersion,
    GetHelp,
    GetChipId,
    GetReadProtection,
    GoToAddress(u32),
    EraseFlash(Erase),
    /// Stream a complete image into flash, chunk by chunk
    WriteImage { address: u32, image: Vec<u8> },
    SetReadProtection(ProtectionLevel),
    JumpToApplication,
}

impl Command {
    /// Menu entries, in selector order (selector = index + 1)
    pub const MENU: [&'static str; 9] = [
        "Read the bootloader version",
        "Read the commands supported by the bootloader",
        "Read the MCU chip identification number",
        "Read the FLASH read protection level",
        "Jump to a specified address",
        "Mass erase or sector erase of the user flash",
        "Write a binary image into flash",
        "Change the read protection level of the user flash",
        "Jump to the user application",
    ];
}

/// Result of a command, ready for display
#[derive(Debug, PartialEq, Clone)]
pub enum Outcome {
    Response(Response),
    Transfer(FlashWriteSession),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Response(r) => write!(f, "{}", r),
            Outcome::Transfer(s) if s.cancelled => write!(
                f,
                "Write cancelled after {} of {} bytes",
                s.bytes_sent, s.total_len
            ),
            Outcome::Transfer(s) if s.all_chunks_ok => write!(
                f,
                "Payload written successfully ({} bytes at 0x{:08x})",
                s.bytes_sent, s.base_address
            ),
            Outcome::Transfer(s) => write!(
                f,
                "Payload written with errors: one or more of {} chunks rejected",
                s.chunks
            ),
        }
    }
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Execute a command to completion
    pub fn execute(&mut self, command: &Command) -> Result<Outcome, Error<E>> {
        let cancel = AtomicBool::new(false);
        self.execute_with(command, &cancel, |_| ())
    }

    /// Execute a command, with cancellation and progress for image writes
    pub fn execute_with(
        &mut self,
        command: &Command,
        cancel: &AtomicBool,
        progress: impl FnMut(&Progress),
    ) -> Result<Outcome, Error<E>> {
        let request = match command {
            Command::WriteImage { address, image } => {
                return self
                    .write_image(*address, &image[..], image.len() as u64, cancel, progress)
                    .map(Outcome::Transfer);
            }
            Command::GetVersion => Request::GetVersion,
            Command::GetHelp => Request::GetHelp,
            Command::GetChipId => Request::GetChipId,
            Command::GetReadProtection => Request::GetReadProtection,
            Command::GoToAddress(address) => Request::GoToAddress { address: *address },
            Command::EraseFlash(erase) => Request::EraseFlash(*erase),
            Command::SetReadProtection(level) => Request::SetReadProtection(*level),
            Command::JumpToApplication => Request::JumpToApplication,
        };

        self.transact(&request).map(Outcome::Response)
    }
}
