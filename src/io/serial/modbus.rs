// src/io/serial/modbus.rs
//
// Modbus RTU frame boundary detection for byte logs without inter-frame timing.
//
// Boundaries come from the function code's expected ADU length (Modbus
// Application Protocol Specification v1.1b3, request and response forms)
// confirmed by the trailing CRC-16. Lengths below include the address byte
// and the two CRC bytes. Function codes whose length cannot be derived from
// the header (43 and anything unlisted) fall back to scanning for a CRC match.

use crate::checksums::{crc16_modbus_checksum, crc16_modbus_step, CRC16_MODBUS_INIT};

/// Smallest legal RTU ADU: address, function, CRC
pub(crate) const MIN_ADU: usize = 4;
/// Largest legal RTU ADU
pub(crate) const MAX_ADU: usize = 256;

/// One possible ADU length for the bytes at the head of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Candidate {
    Len(usize),
    /// Length depends on a byte-count field not received yet
    Pending,
}

/// Outcome of matching a frame at the head of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Match {
    Frame(usize),
    NeedMore,
    NoMatch,
}

/// Length derived from a byte-count field at `index`, plus `fixed` bytes around it.
fn counted(adu: &[u8], index: usize, fixed: usize) -> Candidate {
    match adu.get(index) {
        Some(&count) => Candidate::Len(fixed + count as usize),
        None => Candidate::Pending,
    }
}

/// Read response length from the byte count at `adu[2]`. A count of zero, or
/// one that is not a whole number of `unit`-byte items, cannot be a response.
fn read_response(adu: &[u8], unit: u8) -> Option<Candidate> {
    match adu.get(2) {
        None => Some(Candidate::Pending),
        Some(&count) if count == 0 || count % unit != 0 => None,
        Some(&count) => Some(Candidate::Len(5 + count as usize)),
    }
}

/// Candidate ADU lengths for the function code at `adu[1]`, response form first
/// where both exist. `None` when the table has no entry for the function code.
pub(crate) fn candidate_lengths(adu: &[u8]) -> Option<Vec<Candidate>> {
    use Candidate::{Len, Pending};

    let function = *adu.get(1)?;
    if function & 0x80 != 0 {
        // Exception response: addr, fc|0x80, exception code, CRC
        return Some(vec![Len(5)]);
    }

    let candidates: Vec<Candidate> = match function {
        // Read coils / discrete inputs
        0x01 | 0x02 => read_response(adu, 1).into_iter().chain([Len(8)]).collect(),
        // Read holding / input registers
        0x03 | 0x04 => read_response(adu, 2).into_iter().chain([Len(8)]).collect(),
        // Write single coil / register (response echoes request)
        0x05 | 0x06 => vec![Len(8)],
        // Read exception status
        0x07 => vec![Len(4), Len(5)],
        // Diagnostics
        0x08 => vec![Len(8)],
        // Get comm event counter
        0x0B => vec![Len(4), Len(8)],
        // Get comm event log / report server id
        0x0C | 0x11 => vec![Len(4), counted(adu, 2, 5)],
        // Write multiple coils / registers
        0x0F | 0x10 => vec![Len(8), counted(adu, 6, 9)],
        // Read / write file record
        0x14 | 0x15 => vec![counted(adu, 2, 5)],
        // Mask write register
        0x16 => vec![Len(10)],
        // Read/write multiple registers
        0x17 => std::iter::once(counted(adu, 10, 13)).chain(read_response(adu, 2)).collect(),
        // Read FIFO queue: request is a pointer, response has a 16-bit byte count
        0x18 => {
            let response = match (adu.get(2), adu.get(3)) {
                (Some(&hi), Some(&lo)) => Len(6 + u16::from_be_bytes([hi, lo]) as usize),
                _ => Pending,
            };
            vec![Len(6), response]
        }
        _ => return None,
    };
    Some(candidates)
}

/// Whether the last two bytes of `frame` are the CRC of the rest (low byte first).
pub(crate) fn crc_ok(frame: &[u8]) -> bool {
    if frame.len() < MIN_ADU {
        return false;
    }
    let (data, crc) = frame.split_at(frame.len() - 2);
    crc16_modbus_checksum(data) == u16::from_le_bytes([crc[0], crc[1]])
}

/// Shortest prefix of `adu` (within MIN_ADU..=MAX_ADU) that ends in a valid CRC.
/// Runs one incremental CRC pass instead of re-checksumming every prefix.
pub(crate) fn scan_crc_length(adu: &[u8]) -> Option<usize> {
    let limit = adu.len().min(MAX_ADU);
    if limit < MIN_ADU {
        return None;
    }
    let mut crc = crc16_modbus_step(crc16_modbus_step(CRC16_MODBUS_INIT, adu[0]), adu[1]);
    for len in MIN_ADU..=limit {
        if crc == u16::from_le_bytes([adu[len - 2], adu[len - 1]]) {
            return Some(len);
        }
        crc = crc16_modbus_step(crc, adu[len - 2]);
    }
    None
}

/// Try to match a CRC-valid frame at the head of `adu`.
/// With `at_end`, no more bytes will arrive so pending lengths cannot complete.
pub(crate) fn match_frame(adu: &[u8], at_end: bool) -> Match {
    if adu.len() < MIN_ADU {
        return if at_end { Match::NoMatch } else { Match::NeedMore };
    }

    match candidate_lengths(adu) {
        Some(candidates) => {
            let mut pending = false;
            for candidate in candidates {
                match candidate {
                    Candidate::Len(n) if !(MIN_ADU..=MAX_ADU).contains(&n) => {}
                    Candidate::Len(n) if n <= adu.len() => {
                        if crc_ok(&adu[..n]) {
                            return Match::Frame(n);
                        }
                    }
                    Candidate::Len(_) | Candidate::Pending => pending = true,
                }
            }
            if pending && !at_end {
                Match::NeedMore
            } else {
                Match::NoMatch
            }
        }
        None => match scan_crc_length(adu) {
            Some(n) => Match::Frame(n),
            None if !at_end && adu.len() < MAX_ADU => Match::NeedMore,
            None => Match::NoMatch,
        },
    }
}

/// The table's first in-range length for the head of `adu` that fits in the
/// available bytes. Used as the frame boundary when a CRC failure is tolerated.
pub(crate) fn primary_length(adu: &[u8]) -> Option<usize> {
    candidate_lengths(adu)?.into_iter().find_map(|c| match c {
        Candidate::Len(n) if (MIN_ADU..=MAX_ADU).contains(&n) && n <= adu.len() => Some(n),
        _ => None,
    })
}

/// Boundary for a frame whose CRC failure is tolerated: the table length
/// after which a CRC-valid frame starts, else the first table length that
/// fits. `NeedMore` while the bytes that would decide are still missing.
pub(crate) fn tolerated_length(adu: &[u8], at_end: bool) -> Match {
    let lengths: Vec<usize> = match candidate_lengths(adu) {
        Some(candidates) => candidates
            .into_iter()
            .filter_map(|c| match c {
                Candidate::Len(n) if (MIN_ADU..=MAX_ADU).contains(&n) && n <= adu.len() => Some(n),
                _ => None,
            })
            .collect(),
        None => return Match::NoMatch,
    };

    let mut undecided = false;
    for &len in &lengths {
        match match_frame(&adu[len..], at_end) {
            Match::Frame(_) => return Match::Frame(len),
            Match::NeedMore => undecided = true,
            Match::NoMatch => {}
        }
    }
    if undecided && adu.len() < 2 * MAX_ADU {
        return Match::NeedMore;
    }
    lengths.first().map_or(Match::NoMatch, |&len| Match::Frame(len))
}

/// Smallest non-zero offset at which a complete CRC-valid frame starts,
/// searched within one maximum ADU.
pub(crate) fn resync_offset(adu: &[u8]) -> Option<usize> {
    (1..adu.len().min(MAX_ADU + 1)).find(|&k| matches!(match_frame(&adu[k..], true), Match::Frame(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::framer::append_modbus_crc;

    #[test]
    fn test_read_holding_request_matches_fixed_length() {
        let adu = append_modbus_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(match_frame(&adu, false), Match::Frame(8));
    }

    #[test]
    fn test_read_holding_response_uses_byte_count() {
        let adu = append_modbus_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]);
        assert_eq!(adu.len(), 9);
        assert_eq!(match_frame(&adu, false), Match::Frame(9));
        // Truncated response waits for the rest
        assert_eq!(match_frame(&adu[..7], false), Match::NeedMore);
        assert_eq!(match_frame(&adu[..7], true), Match::NoMatch);
    }

    #[test]
    fn test_exception_response() {
        let adu = append_modbus_crc(&[0x01, 0x83, 0x02]);
        assert_eq!(candidate_lengths(&adu), Some(vec![Candidate::Len(5)]));
        assert_eq!(match_frame(&adu, false), Match::Frame(5));
    }

    #[test]
    fn test_write_multiple_request_byte_count_at_offset_six() {
        let adu = append_modbus_crc(&[0x11, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        assert_eq!(adu.len(), 13);
        assert_eq!(match_frame(&adu, false), Match::Frame(13));
    }

    #[test]
    fn test_unknown_function_scans_for_crc() {
        let adu = append_modbus_crc(&[0x01, 0x2B, 0x0E, 0x01, 0x00]);
        assert_eq!(candidate_lengths(&adu), None);
        assert_eq!(scan_crc_length(&adu), Some(adu.len()));
        assert_eq!(match_frame(&adu, false), Match::Frame(adu.len()));
    }

    #[test]
    fn test_resync_finds_next_frame() {
        let mut stream = vec![0x55, 0x66, 0x77];
        stream.extend(append_modbus_crc(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]));
        assert_eq!(resync_offset(&stream), Some(3));
    }

    #[test]
    fn test_read_request_cannot_be_taken_for_response() {
        // Start address 0x0000 puts a zero where a response has its byte count
        let request = append_modbus_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(candidate_lengths(&request), Some(vec![Candidate::Len(8)]));
        // Odd byte count cannot hold whole registers
        let odd = [0x01, 0x04, 0x03, 0x00];
        assert_eq!(candidate_lengths(&odd), Some(vec![Candidate::Len(8)]));
        // Coils pack bits, so any non-zero count is possible
        let coils = [0x01, 0x01, 0x03, 0x00];
        assert_eq!(
            candidate_lengths(&coils),
            Some(vec![Candidate::Len(8), Candidate::Len(8)])
        );
    }

    #[test]
    fn test_tolerated_length_picks_boundary_before_valid_frame() {
        // 0x02 in the start address reads as a 2-byte count (length 7)
        let mut corrupted = append_modbus_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        corrupted[2] = 0x02;
        let response = append_modbus_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]);
        let mut stream = corrupted.clone();
        stream.extend_from_slice(&response);

        assert_eq!(match_frame(&stream, false), Match::NoMatch);
        assert_eq!(primary_length(&stream), Some(7));
        assert_eq!(tolerated_length(&stream, false), Match::Frame(8));
        // Nothing follows yet: wait, unless the stream is over
        assert_eq!(tolerated_length(&corrupted, false), Match::NeedMore);
        assert_eq!(tolerated_length(&corrupted, true), Match::Frame(7));
    }

    #[test]
    fn test_primary_length_skips_pending() {
        let head = [0x01, 0x10, 0x00, 0x01];
        assert_eq!(primary_length(&head), None);
        let adu = [0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00];
        assert_eq!(primary_length(&adu), Some(8));
    }
}
