//! CRC-16 over wire frames: polynomial `0x8408` (reversed CCITT), zero
//! initial value, no final xor. A frame is valid iff folding the CRC over
//! all of its bytes, start marker and trailing CRC included, leaves zero.

/// Fold one byte into a running CRC.
pub const fn update_crc(crc: u16, byte: u8) -> u16 {
    let mut result = crc ^ byte as u16;
    let mut bit = 0;
    while bit < 8 {
        if result & 0x0001 != 0 {
            result = (result >> 1) ^ 0x8408;
        } else {
            result >>= 1;
        }
        bit += 1;
    }
    result
}

/// CRC-16 of a byte slice, starting from zero.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &b| update_crc(crc, b))
}
