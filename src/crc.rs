//! Frame integrity check used by the bootloader.

/// Generator polynomial
pub const CRC_POLY: u32 = 0x04C1_1DB7;

/// Initial accumulator value
pub const CRC_INIT: u32 = 0xFFFF_FFFF;

/// Compute the bootloader CRC32 over `data`.
///
/// Each byte is mixed into the low byte of the accumulator before 32
/// MSB-first shift steps, with no reflection and no final XOR. This is
/// what the bootloader checks against, so it is not interchangeable with
/// the common CRC-32 variants.
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(CRC_INIT, |mut crc, b| {
        crc ^= u32::from(*b);

        for _ in 0..32 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }

        crc
    })
}
