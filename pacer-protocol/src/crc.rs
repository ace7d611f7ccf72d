//! Table-driven CRC-8 (polynomial 0x07, seed 0).
//!
//! The table is generated at compile time. A frame checksum covers every
//! byte between the sync byte and the checksum byte itself.

const POLYNOMIAL: u8 = 0x07;

/// Precomputed lookup table.
pub static CRC8_TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the CRC-8 of `bytes`.
pub fn crc8(bytes: &[u8]) -> u8 {
    crc8_update(0, bytes)
}

/// Folds `bytes` into a running checksum.
pub fn crc8_update(crc: u8, bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(crc, |crc, &byte| CRC8_TABLE[(crc ^ byte) as usize])
}
