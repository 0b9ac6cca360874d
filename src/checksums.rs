// src/checksums.rs
//
// Checksum and byte-index helpers used by the framing engine.

// ============================================================================
// Byte Index Resolution (Negative Indexing Support)
// ============================================================================

/// Resolve a byte index, supporting Python-style negative indexing.
/// Negative indices count from the end: -1 = last byte, -2 = second-to-last, etc.
///
/// Returns `None` when a negative index reaches before the start of the frame.
/// Positive indices are returned as-is; the caller bounds-checks them against
/// the number of bytes it wants to read.
pub fn resolve_byte_index(index: i32, frame_length: usize) -> Option<usize> {
    if index >= 0 {
        Some(index as usize)
    } else {
        frame_length.checked_sub(index.unsigned_abs() as usize)
    }
}

// ============================================================================
// CRC-16
// ============================================================================

/// Reflect (reverse) the bits of a 16-bit value.
fn reflect16(mut value: u16) -> u16 {
    let mut result: u16 = 0;
    for _ in 0..16 {
        result = (result << 1) | (value & 1);
        value >>= 1;
    }
    result
}

/// Shift one byte through a reflected (LSB-first) CRC-16 register.
fn crc16_reflected_byte(crc: u16, byte: u8, reflected_poly: u16) -> u16 {
    let mut crc = crc ^ byte as u16;
    for _ in 0..8 {
        if crc & 0x0001 != 0 {
            crc = (crc >> 1) ^ reflected_poly;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// CRC-16 with arbitrary parameters.
///
/// # Arguments
/// * `data` - The data to calculate CRC over
/// * `polynomial` - The CRC polynomial in normal (MSB-first) form, e.g. 0x8005
/// * `init` - Initial register value
/// * `xor_out` - Final XOR value
/// * `reflect` - Whether input and output are reflected (LSB-first)
pub fn crc16_parameterised(data: &[u8], polynomial: u16, init: u16, xor_out: u16, reflect: bool) -> u16 {
    let mut crc = init;

    if reflect {
        let reflected_poly = reflect16(polynomial);
        for &byte in data {
            crc = crc16_reflected_byte(crc, byte, reflected_poly);
        }
    } else {
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ polynomial;
                } else {
                    crc <<= 1;
                }
            }
        }
    }

    crc ^ xor_out
}

/// CRC-16/MODBUS: polynomial 0x8005 reflected (0xA001), init 0xFFFF, no final XOR.
/// Transmitted low byte first.
pub fn crc16_modbus_checksum(data: &[u8]) -> u16 {
    crc16_parameterised(data, 0x8005, 0xFFFF, 0x0000, true)
}

/// 0x8005 bit-reversed
const CRC16_MODBUS_POLY_REFLECTED: u16 = 0xA001;

/// Initial register for an incremental CRC-16/MODBUS.
pub const CRC16_MODBUS_INIT: u16 = 0xFFFF;

/// Feed one byte into an incremental CRC-16/MODBUS register.
/// Folding every byte of `data` from `CRC16_MODBUS_INIT` equals `crc16_modbus_checksum(data)`.
pub fn crc16_modbus_step(crc: u16, byte: u8) -> u16 {
    crc16_reflected_byte(crc, byte, CRC16_MODBUS_POLY_REFLECTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Byte Index Resolution Tests
    // ========================================================================

    #[test]
    fn test_resolve_byte_index_positive() {
        assert_eq!(resolve_byte_index(0, 10), Some(0));
        assert_eq!(resolve_byte_index(5, 10), Some(5));
        assert_eq!(resolve_byte_index(12, 10), Some(12));
    }

    #[test]
    fn test_resolve_byte_index_negative() {
        assert_eq!(resolve_byte_index(-1, 10), Some(9));
        assert_eq!(resolve_byte_index(-10, 10), Some(0));
        // -2 on an 8-byte frame is the same byte as 6
        assert_eq!(resolve_byte_index(-2, 8), resolve_byte_index(6, 8));
    }

    #[test]
    fn test_resolve_byte_index_before_start() {
        assert_eq!(resolve_byte_index(-11, 10), None);
        assert_eq!(resolve_byte_index(-1, 0), None);
    }

    // ========================================================================
    // CRC-16 Tests
    // ========================================================================

    #[test]
    fn test_crc16_modbus_check_value() {
        // Standard check value for CRC-16/MODBUS over "123456789"
        assert_eq!(crc16_modbus_checksum(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_modbus_read_holding_registers() {
        // 01 03 00 00 00 0A -> CRC C5 CD (transmitted low byte first)
        let crc = crc16_modbus_checksum(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(crc & 0xFF, 0xC5);
        assert_eq!(crc >> 8, 0xCD);
    }

    #[test]
    fn test_crc16_ccitt_false_check_value() {
        // CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, not reflected
        assert_eq!(crc16_parameterised(b"123456789", 0x1021, 0xFFFF, 0x0000, false), 0x29B1);
    }

    #[test]
    fn test_crc16_empty_is_init() {
        assert_eq!(crc16_modbus_checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc16_modbus_step_matches_block() {
        let data = [0x11, 0x06, 0x00, 0x01, 0x00, 0x03, 0xFF, 0xDB];
        let stepped = data.iter().fold(CRC16_MODBUS_INIT, |crc, &b| crc16_modbus_step(crc, b));
        assert_eq!(stepped, crc16_modbus_checksum(&data));
    }

    #[test]
    fn test_reflected_poly_constant() {
        assert_eq!(reflect16(0x8005), CRC16_MODBUS_POLY_REFLECTED);
        let stepped = b"123456789"
            .iter()
            .fold(CRC16_MODBUS_INIT, |crc, &b| crc16_modbus_step(crc, b));
        assert_eq!(stepped, 0x4B37);
    }
}
