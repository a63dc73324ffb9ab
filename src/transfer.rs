//! Chunked image transfer into flash.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{ProtocolError, Request, MAX_CHUNK};
use crate::response::{Response, WriteStatus};
use crate::{unexpected, Error, Opcode, Programmer, SerialPort};

/// Progress information provided to the callback after each chunk
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Flash address of the chunk just written
    pub address: u32,
    /// Number of bytes that have been sent
    pub bytes_complete: u64,
    /// The total number of bytes to transfer
    pub bytes_total: u64,
    /// Whether the bootloader accepted this chunk
    pub chunk_ok: bool,
}

/// State of one image write, returned to the caller when the write ends
#[derive(Debug, Clone, PartialEq)]
pub struct FlashWriteSession {
    pub base_address: u32,
    /// Address the next chunk will be written to
    pub next_address: u32,
    pub total_len: u64,
    pub bytes_sent: u64,
    pub chunk_size: usize,
    pub chunks: usize,
    /// Cleared by the first rejected chunk, or by cancellation
    pub all_chunks_ok: bool,
    pub cancelled: bool,
}

impl FlashWriteSession {
    pub fn new(base_address: u32, total_len: u64, chunk_size: usize) -> Result<Self, ProtocolError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK {
            return Err(ProtocolError::InvalidParameter(format!(
                "chunk size {} outside 1..={}",
                chunk_size, MAX_CHUNK
            )));
        }
        let end = u64::from(base_address).checked_add(total_len);
        if end.map_or(true, |end| end > 1 << 32) {
            return Err(ProtocolError::InvalidParameter(format!(
                "{} bytes at 0x{:08x} runs past the end of the address space",
                total_len, base_address
            )));
        }

        Ok(Self {
            base_address,
            next_address: base_address,
            total_len,
            bytes_sent: 0,
            chunk_size,
            chunks: 0,
            all_chunks_ok: true,
            cancelled: false,
        })
    }

    pub fn remaining(&self) -> u64 {
        self.total_len - self.bytes_sent
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Length of the next chunk, zero once complete
    pub fn next_chunk_len(&self) -> usize {
        self.remaining().min(self.chunk_size as u64) as usize
    }

    /// Account for a chunk whose exchange completed
    pub fn record(&mut self, len: usize, ok: bool) {
        self.next_address = self.next_address.wrapping_add(len as u32);
        self.bytes_sent += len as u64;
        self.chunks += 1;
        self.all_chunks_ok &= ok;
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.all_chunks_ok = false;
    }
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Write `len` bytes from `image` to flash at `address`.
    ///
    /// Rejected chunks clear `all_chunks_ok` but the remaining chunks are
    /// still sent. `cancel` is checked before each chunk. Any NACK, timeout
    /// or image read failure aborts with [`Error::Interrupted`].
    pub fn write_image<R: io::Read>(
        &mut self,
        address: u32,
        mut image: R,
        len: u64,
        cancel: &AtomicBool,
        mut progress: impl FnMut(&Progress),
    ) -> Result<FlashWriteSession, Error<E>> {
        let mut session = FlashWriteSession::new(address, len, self.options.chunk_size)
            .map_err(Error::Protocol)?;

        info!(
            "Writing {} bytes at 0x{:08x} in chunks of {}",
            len, address, session.chunk_size
        );

        let mut buff = [0u8; MAX_CHUNK];

        while !session.is_complete() {
            if cancel.load(Ordering::Relaxed) {
                warn!("Write cancelled after {} bytes", session.bytes_sent);
                session.cancel();
                break;
            }

            let n = session.next_chunk_len();
            let chunk = &mut buff[..n];

            if let Err(e) = image.read_exact(chunk) {
                return Err(interrupted(&session, Error::Io(e.kind())));
            }

            let chunk_address = session.next_address;
            let request = Request::WriteMemory {
                address: chunk_address,
                data: chunk,
            };

            let ok = match self.transact(&request) {
                Ok(Response::Write(WriteStatus::Success)) => true,
                Ok(Response::Write(WriteStatus::Failed)) => {
                    warn!("Chunk at 0x{:08x} rejected: write failed or invalid address", chunk_address);
                    false
                }
                Ok(r) => return Err(interrupted(&session, unexpected(Opcode::WriteMemory, r))),
                Err(Error::Protocol(ProtocolError::UnknownResponseCode { code, .. })) => {
                    warn!("Chunk at 0x{:08x} returned unknown status 0x{:02x}", chunk_address, code);
                    false
                }
                Err(e) => return Err(interrupted(&session, e)),
            };

            session.record(n, ok);
            debug!("Bytes sent to the bootloader: {}", session.bytes_sent);

            progress(&Progress {
                address: chunk_address,
                bytes_complete: session.bytes_sent,
                bytes_total: len,
                chunk_ok: ok,
            });

            self.delay.delay_ms(self.options.chunk_delay_ms);
        }

        if session.all_chunks_ok {
            info!("Payload written successfully");
        }

        Ok(session)
    }

    /// Write an in-memory image without cancellation or progress reporting
    pub fn write_bytes(&mut self, address: u32, data: &[u8]) -> Result<FlashWriteSession, Error<E>> {
        let cancel = AtomicBool::new(false);
        self.write_image(address, data, data.len() as u64, &cancel, |_| ())
    }
}

fn interrupted<E: core::fmt::Debug>(session: &FlashWriteSession, cause: Error<E>) -> Error<E> {
    error!("Write aborted after {} bytes: {:?}", session.bytes_sent, cause);
    Error::Interrupted {
        bytes_sent: session.bytes_sent,
        cause: Box::new(cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ack, CountingDelay, StubBootloader};
    use crate::Options;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    fn chunk_lens(frames: &[Vec<u8>]) -> Vec<usize> {
        frames.iter().map(|f| f[6] as usize).collect()
    }

    fn chunk_addrs(frames: &[Vec<u8>]) -> Vec<u32> {
        frames
            .iter()
            .map(|f| u32::from_le_bytes([f[2], f[3], f[4], f[5]]))
            .collect()
    }

    fn accept_all() -> StubBootloader {
        StubBootloader::new(|_| ack(&[0x01]))
    }

    /// Rejects the `n`th memory write (0-based)
    fn reject_nth(n: usize) -> StubBootloader {
        let mut i = 0;
        StubBootloader::new(move |_| {
            let status = if i == n { 0x00 } else { 0x01 };
            i += 1;
            ack(&[status])
        })
    }

    #[test]
    fn chunk_plan() {
        for len in [0u64, 1, 127, 128, 129, 300, 1000].iter() {
            let mut s = FlashWriteSession::new(0x4000, *len, MAX_CHUNK).unwrap();
            let mut lens = vec![];
            let mut addrs = vec![];

            while !s.is_complete() {
                let n = s.next_chunk_len();
                addrs.push(s.next_address);
                lens.push(n);
                s.record(n, true);
            }

            assert_eq!(lens.iter().sum::<usize>() as u64, *len);
            if let Some((last, rest)) = lens.split_last() {
                assert!(rest.iter().all(|n| *n == MAX_CHUNK));
                assert!(*last >= 1 && *last <= MAX_CHUNK);
            }
            for (i, a) in addrs.iter().enumerate() {
                assert_eq!(*a as usize, 0x4000 + lens[..i].iter().sum::<usize>());
            }
            assert!(s.all_chunks_ok);
        }
    }

    #[test]
    fn session_rejects_bad_parameters() {
        assert!(FlashWriteSession::new(0, 10, 0).is_err());
        assert!(FlashWriteSession::new(0, 10, MAX_CHUNK + 1).is_err());
        assert!(FlashWriteSession::new(0xFFFF_FF00, 0x100, MAX_CHUNK).is_ok());
        assert!(FlashWriteSession::new(0xFFFF_FF00, 0x101, MAX_CHUNK).is_err());
        assert!(FlashWriteSession::new(0x8000, u64::MAX, MAX_CHUNK).is_err());
    }

    #[test]
    fn oversized_length_rejected_before_sending() {
        let cancel = AtomicBool::new(false);
        let mut p = Programmer::new(accept_all(), CountingDelay::default(), Options::default());

        let r = p.write_image(0x8000, &[0u8; 4][..], u64::MAX, &cancel, |_| ());
        assert!(matches!(
            r,
            Err(Error::Protocol(ProtocolError::InvalidParameter(_)))
        ));

        let (dev, _) = p.release();
        assert!(dev.frames().is_empty());
    }

    #[test]
    fn writes_300_bytes_in_three_chunks() {
        let data = image(300);
        let mut p = Programmer::new(accept_all(), CountingDelay::default(), Options::default());

        let s = p.write_bytes(0x0000_8000, &data).unwrap();

        assert!(s.all_chunks_ok);
        assert!(!s.cancelled);
        assert_eq!(s.bytes_sent, 300);
        assert_eq!(s.chunks, 3);
        assert_eq!(s.next_address, 0x0000_8000 + 300);

        let (dev, delay) = p.release();
        let frames = dev.frames();
        assert_eq!(chunk_lens(frames), vec![128, 128, 44]);
        assert_eq!(chunk_addrs(frames), vec![0x8000, 0x8080, 0x8100]);
        assert_eq!(&frames[2][7..7 + 44], &data[256..]);
        assert_eq!(delay.total_ms, 300);
    }

    #[test]
    fn single_rejected_chunk_fails_aggregate() {
        let data = image(300);

        for n in 0..3 {
            let mut p = Programmer::new(reject_nth(n), CountingDelay::default(), Options::default());
            let s = p.write_bytes(0x0000_8000, &data).unwrap();

            assert!(!s.all_chunks_ok, "chunk {}", n);
            assert_eq!(s.bytes_sent, 300);

            let (dev, _) = p.release();
            assert_eq!(dev.frames().len(), 3);
        }
    }

    #[test]
    fn unknown_status_counts_as_failure() {
        let data = image(200);
        let dev = StubBootloader::new(|_| ack(&[0x42]));
        let mut p = Programmer::new(dev, CountingDelay::default(), Options::default());

        let s = p.write_bytes(0, &data).unwrap();
        assert!(!s.all_chunks_ok);
        assert_eq!(s.chunks, 2);
    }

    #[test]
    fn progress_reported_per_chunk() {
        let data = image(130);
        let cancel = AtomicBool::new(false);
        let mut seen = vec![];

        let mut p = Programmer::new(reject_nth(1), CountingDelay::default(), Options::default());
        p.write_image(0x100, &data[..], 130, &cancel, |pr| seen.push(pr.clone()))
            .unwrap();

        assert_eq!(
            seen,
            vec![
                Progress { address: 0x100, bytes_complete: 128, bytes_total: 130, chunk_ok: true },
                Progress { address: 0x180, bytes_complete: 130, bytes_total: 130, chunk_ok: false },
            ]
        );
    }

    #[test]
    fn cancel_between_chunks() {
        let data = image(300);
        let cancel = AtomicBool::new(false);

        let mut p = Programmer::new(accept_all(), CountingDelay::default(), Options::default());
        let s = p
            .write_image(0, &data[..], 300, &cancel, |_| cancel.store(true, Ordering::Relaxed))
            .unwrap();

        assert!(s.cancelled);
        assert!(!s.all_chunks_ok);
        assert_eq!(s.bytes_sent, 128);

        let (dev, _) = p.release();
        assert_eq!(dev.frames().len(), 1);
    }

    #[test]
    fn timeout_mid_transfer_reports_partial_progress() {
        let mut i = 0;
        let dev = StubBootloader::new(move |_| {
            i += 1;
            if i == 1 {
                ack(&[0x01])
            } else {
                vec![]
            }
        });
        let options = Options {
            response_timeout_ms: 10,
            ..Options::default()
        };

        let mut p = Programmer::new(dev, CountingDelay::default(), options);
        let r = p.write_bytes(0, &image(300));

        assert_eq!(
            r,
            Err(Error::Interrupted {
                bytes_sent: 128,
                cause: Box::new(Error::ResponseTimeout)
            })
        );

        let (dev, _) = p.release();
        assert_eq!(dev.frames().len(), 2);
    }

    #[test]
    fn nack_mid_transfer_aborts() {
        let mut i = 0;
        let dev = StubBootloader::new(move |_| {
            i += 1;
            if i == 2 {
                vec![0xAB]
            } else {
                ack(&[0x01])
            }
        });

        let mut p = Programmer::new(dev, CountingDelay::default(), Options::default());
        let r = p.write_bytes(0, &image(400));

        assert_eq!(
            r,
            Err(Error::Interrupted {
                bytes_sent: 128,
                cause: Box::new(Error::Nack(0xAB))
            })
        );
    }

    #[test]
    fn short_image_aborts() {
        let data = image(100);
        let cancel = AtomicBool::new(false);

        let mut p = Programmer::new(accept_all(), CountingDelay::default(), Options::default());
        let r = p.write_image(0, &data[..], 200, &cancel, |_| ());

        assert_eq!(
            r,
            Err(Error::Interrupted {
                bytes_sent: 0,
                cause: Box::new(Error::Io(io::ErrorKind::UnexpectedEof))
            })
        );
    }

    #[test]
    fn empty_image_sends_nothing() {
        let mut p = Programmer::new(accept_all(), CountingDelay::default(), Options::default());
        let s = p.write_bytes(0x8000, &[]).unwrap();

        assert!(s.all_chunks_ok);
        assert_eq!(s.chunks, 0);

        let (dev, _) = p.release();
        assert!(dev.frames().is_empty());
    }

    #[test]
    fn custom_chunk_size() {
        let options = Options {
            chunk_size: 64,
            ..Options::default()
        };
        let mut p = Programmer::new(accept_all(), CountingDelay::default(), options);
        p.write_bytes(0, &image(150)).unwrap();

        let (dev, _) = p.release();
        assert_eq!(chunk_lens(dev.frames()), vec![64, 64, 22]);
    }
}
