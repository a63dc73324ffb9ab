//! Test double for the bootloader side of the link.

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::crc::crc32;
use crate::protocol::{BL_ACK, BL_NACK, CRC_LEN};
use crate::SerialPort;

#[derive(Clone, PartialEq, Debug)]
pub struct StubError;

type Handler = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

/// Answers complete frames through `handler`, NACKing frames with a bad CRC
pub struct StubBootloader {
    rx: VecDeque<u8>,
    pending: Vec<u8>,
    frames: Vec<Vec<u8>>,
    handler: Handler,
}

/// Acknowledgment header followed by `payload`
pub fn ack(payload: &[u8]) -> Vec<u8> {
    let mut r = vec![BL_ACK, payload.len() as u8];
    r.extend_from_slice(payload);
    r
}

impl StubBootloader {
    pub fn new<F: FnMut(&[u8]) -> Vec<u8> + 'static>(handler: F) -> Self {
        Self {
            rx: VecDeque::new(),
            pending: Vec::new(),
            frames: Vec::new(),
            handler: Box::new(handler),
        }
    }

    /// Records frames but never answers
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    pub fn push_rx(&mut self, data: &[u8]) {
        self.rx.extend(data.iter());
    }

    /// Frames received so far
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    fn complete_frame(&mut self) {
        let frame = core::mem::take(&mut self.pending);
        let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);

        let reply = if u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]])
            == crc32(body)
        {
            (self.handler)(&frame)
        } else {
            vec![BL_NACK]
        };

        self.rx.extend(reply);
        self.frames.push(frame);
    }
}

impl Read<u8> for StubBootloader {
    type Error = StubError;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for StubBootloader {
    type Error = StubError;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.pending.push(word);
        if self.pending.len() == self.pending[0] as usize + 1 {
            self.complete_frame();
        }
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl SerialPort<StubError> for StubBootloader {}

/// Delay provider that only accumulates the requested time
#[derive(Default, Debug)]
pub struct CountingDelay {
    pub total_ms: u64,
    pub calls: usize,
}

impl DelayMs<u32> for CountingDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += u64::from(ms);
        self.calls += 1;
    }
}
