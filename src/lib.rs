//! TM4C123 custom UART bootloader host.
//!
//! Frames are `[len][opcode][payload..][crc32 LE]`, answered by a
//! `[0xCD][len]` acknowledgment and a command specific payload.

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod crc;
pub mod protocol;
pub mod response;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod mock;

pub use protocol::{Erase, Frame, Opcode, ProtectionLevel, ProtocolError, Request};
pub use response::{
    EraseStatus, HelpEntry, ReadProtection, Response, Version, WriteStatus,
};
pub use session::{Command, Outcome};
pub use transfer::{FlashWriteSession, Progress};

use protocol::BL_ACK;

/// Upper bound on bytes discarded by [`SerialPort::clear_input`]
pub const MAX_DRAIN: usize = 4096;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    /// Discard any bytes already waiting in the receive path
    fn clear_input(&mut self) -> Result<usize, E> {
        let mut n = 0;

        while n < MAX_DRAIN {
            match <Self as Read<u8>>::read(self) {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }

        Ok(n)
    }
}

/// Exchange progress of the current command
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Encoding,
    Transmitting,
    AwaitingAck,
    AwaitingPayload,
    Decoded,
    /// Entered on NACK, left when the next command starts
    Aborted,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("bootloader did not acknowledge (status 0x{0:02x})")]
    Nack(u8),

    #[error("timeout waiting for bootloader response")]
    ResponseTimeout,

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error("image read error: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("transfer interrupted after {bytes_sent} bytes: {cause:?}")]
    Interrupted {
        bytes_sent: u64,
        cause: Box<Error<SerialError>>,
    },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for each byte of a bootloader response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Pause after each memory write exchange
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub chunk_delay_ms: u32,

    /// Image bytes per memory write frame (1-128)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "128"))]
    pub chunk_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
            poll_delay_ms: 1,
            chunk_delay_ms: 100,
            chunk_size: protocol::MAX_CHUNK,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    _err: core::marker::PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Idle,
            options,
            port,
            delay,
            _err: core::marker::PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the underlying port and delay
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Reset the receive path between commands
    pub fn clear_input(&mut self) -> Result<(), Error<E>> {
        let n = self.port.clear_input()?;
        if n > 0 {
            debug!("Discarded {} stale bytes", n);
        }
        Ok(())
    }

    /// Run a single request/response exchange.
    ///
    /// The state ends as `Decoded` on success and `Aborted` on a NACK. Any
    /// other failure returns it to `Idle`.
    pub fn transact(&mut self, request: &Request) -> Result<Response, Error<E>> {
        self.state = State::Idle;

        let r = self.exchange(request);

        self.state = match &r {
            Ok(_) => State::Decoded,
            Err(Error::Nack(_)) => State::Aborted,
            Err(_) => State::Idle,
        };

        r
    }

    fn exchange(&mut self, request: &Request) -> Result<Response, Error<E>> {
        let command = request.opcode();

        self.state = State::Encoding;
        let frame = request.encode().map_err(Error::Protocol)?;

        debug!("Sending {}", command);
        self.send_frame(&frame)?;

        let len = self.await_ack()?;
        debug!("Preparing to receive {} bytes from the bootloader", len);

        self.state = State::AwaitingPayload;
        let mut data = vec![0u8; len as usize];
        self.read_exact(&mut data)?;
        trace!("Received: {:02x?}", data);

        Response::decode(command, &data).map_err(Error::Protocol)
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        self.state = State::Transmitting;

        let bytes = frame.to_bytes();
        trace!("Frame: {:02x?}", bytes);

        for b in bytes {
            block!(self.port.write(b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    /// Await the acknowledgment header, returning the length to follow
    fn await_ack(&mut self) -> Result<u8, Error<E>> {
        self.state = State::AwaitingAck;

        match self.read_byte()? {
            BL_ACK => {
                debug!("Received bootloader ack");
            }
            v => {
                debug!("Received bootloader nack: 0x{:02x}", v);
                return Err(Error::Nack(v));
            }
        }

        self.read_byte()
    }

    fn read_exact(&mut self, buff: &mut [u8]) -> Result<(), Error<E>> {
        for b in buff.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t: u32 = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(poll);
            t = t.saturating_add(poll);

            if t >= self.options.response_timeout_ms {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }

    /// Fetch the bootloader vendor id and version
    pub fn version(&mut self) -> Result<Version, Error<E>> {
        match self.transact(&Request::GetVersion)? {
            Response::Version(v) => Ok(v),
            r => Err(unexpected(Opcode::GetVersion, r)),
        }
    }

    /// Fetch the opcodes the bootloader reports as supported
    pub fn supported_commands(&mut self) -> Result<Vec<HelpEntry>, Error<E>> {
        match self.transact(&Request::GetHelp)? {
            Response::Help(h) => Ok(h),
            r => Err(unexpected(Opcode::GetHelp, r)),
        }
    }

    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        match self.transact(&Request::GetChipId)? {
            Response::ChipId(id) => Ok(id),
            r => Err(unexpected(Opcode::GetChipId, r)),
        }
    }

    pub fn read_protection(&mut self) -> Result<ReadProtection, Error<E>> {
        match self.transact(&Request::GetReadProtection)? {
            Response::ReadProtection(p) => Ok(p),
            r => Err(unexpected(Opcode::GetReadProtection, r)),
        }
    }

    /// Ask the bootloader to jump to `address`, returns whether it was accepted
    pub fn go_to_address(&mut self, address: u32) -> Result<bool, Error<E>> {
        match self.transact(&Request::GoToAddress { address })? {
            Response::GoToAddress(valid) => Ok(valid),
            r => Err(unexpected(Opcode::GoToAddress, r)),
        }
    }

    pub fn erase(&mut self, erase: Erase) -> Result<EraseStatus, Error<E>> {
        match self.transact(&Request::EraseFlash(erase))? {
            Response::Erase(s) => Ok(s),
            r => Err(unexpected(Opcode::EraseFlash, r)),
        }
    }

    /// Change the read protection level, returns whether it changed
    pub fn set_read_protection(&mut self, level: ProtectionLevel) -> Result<bool, Error<E>> {
        match self.transact(&Request::SetReadProtection(level))? {
            Response::ProtectionChanged(c) => Ok(c),
            r => Err(unexpected(Opcode::SetReadProtection, r)),
        }
    }

    /// Jump to the resident application, `false` if none is present
    pub fn jump_to_application(&mut self) -> Result<bool, Error<E>> {
        match self.transact(&Request::JumpToApplication)? {
            Response::JumpToApplication(j) => Ok(j),
            r => Err(unexpected(Opcode::JumpToApplication, r)),
        }
    }
}

fn unexpected<E>(command: Opcode, r: Response) -> Error<E> {
    error!("Unexpected response for {}: {:?}", command, r);
    Error::Protocol(ProtocolError::UnexpectedResponse(command))
}
