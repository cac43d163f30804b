//! CRC-16 used by the Kamstrup optical protocol
//!
//! Polynomial 0x1021, initial register 0, MSB first, shifted one message bit at
//! a time. Because message bits are shifted *into* the register, the CRC of a
//! message is obtained by running it over the message followed by two zero
//! bytes, and a frame that carries its own CRC leaves a residue of zero.

/// Generator polynomial (x^16 + x^12 + x^5 + 1)
pub const POLYNOMIAL: u16 = 0x1021;

/// Size of the CRC trailer in bytes
pub const CRC_LEN: usize = 2;

/// Bit-serial CRC-16 over every byte of `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut reg: u32 = 0;

    for &byte in data {
        let mut mask = 0x80u8;
        while mask > 0 {
            reg <<= 1;
            if byte & mask != 0 {
                reg |= 1;
            }
            mask >>= 1;
            if reg & 0x1_0000 != 0 {
                reg &= 0xFFFF;
                reg ^= u32::from(POLYNOMIAL);
            }
        }
    }

    // Only the low 16 bits can be set here
    (reg & 0xFFFF) as u16
}

/// Append a big-endian CRC trailer to `message`
///
/// Two placeholder zero bytes are pushed first and the CRC computed over the
/// whole buffer then overwrites them.
pub fn append_crc(message: &mut Vec<u8>) {
    message.extend_from_slice(&[0x00, 0x00]);
    let crc = crc16(message);
    let len = message.len();
    message[len - CRC_LEN..].copy_from_slice(&crc.to_be_bytes());
}

/// Check a frame that still carries its two CRC bytes
pub fn verify(frame: &[u8]) -> bool {
    crc16(frame) == 0
}
