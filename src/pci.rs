//! ISO-TP Protocol Control Information (PCI) encode/decode.
//!
//! Frame type lives in the top nibble of the first data byte:
//! `0` Single Frame, `1` First Frame, `2` Consecutive Frame, `3` Flow
//! Control. See §4.3 of the spec this module implements for the exact
//! layouts.

use std::time::Duration;

/// Maximum ISO-TP payload length addressable by the 12-bit First Frame
/// length field.
pub const MAX_PAYLOAD_LEN: usize = 4095;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    fn nibble(self) -> u8 {
        match self {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        }
    }

    fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0 => Some(FlowStatus::ContinueToSend),
            1 => Some(FlowStatus::Wait),
            2 => Some(FlowStatus::Overflow),
            _ => None,
        }
    }
}

/// A decoded ISO-TP frame body (the part after the raw CAN id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciFrame<'a> {
    Single(&'a [u8]),
    First { total_len: u16, data: &'a [u8] },
    Consecutive { seq: u8, data: &'a [u8] },
    FlowControl { status: FlowStatus, bs: u8, st_min: u8 },
}

/// Parse the PCI and payload of an inbound CAN frame's data bytes.
///
/// Returns `Err(())` for anything malformed: unknown PCI nibble, a declared
/// length exceeding the bytes actually present, a zero-length Single Frame,
/// or a First Frame declaring a total length of 7 or less (which must have
/// been sent as a Single Frame instead). Callers treat a parse failure as
/// `IsoTpError::ProtocolError` and drop the frame; no connection state
/// changes.
pub fn decode(data: &[u8]) -> Result<PciFrame<'_>, ()> {
    let b0 = *data.first().ok_or(())?;
    match b0 >> 4 {
        0x0 => {
            let len = (b0 & 0x0F) as usize;
            if len == 0 || len > 7 || data.len() < 1 + len {
                return Err(());
            }
            Ok(PciFrame::Single(&data[1..1 + len]))
        }
        0x1 => {
            if data.len() < 2 {
                return Err(());
            }
            let total_len = (((b0 & 0x0F) as u16) << 8) | data[1] as u16;
            if total_len as usize <= 7 {
                return Err(());
            }
            let available = data.len().saturating_sub(2).min(6);
            Ok(PciFrame::First {
                total_len,
                data: &data[2..2 + available],
            })
        }
        0x2 => {
            if data.is_empty() {
                return Err(());
            }
            Ok(PciFrame::Consecutive {
                seq: b0 & 0x0F,
                data: &data[1..],
            })
        }
        0x3 => {
            if data.len() < 3 {
                return Err(());
            }
            let status = FlowStatus::from_nibble(b0 & 0x0F).ok_or(())?;
            Ok(PciFrame::FlowControl {
                status,
                bs: data[1],
                st_min: data[2],
            })
        }
        _ => Err(()),
    }
}

/// `data.len()` must be 1..=7.
pub fn encode_single_frame(data: &[u8]) -> Vec<u8> {
    debug_assert!(!data.is_empty() && data.len() <= 7);
    let mut buf = Vec::with_capacity(1 + data.len());
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
    buf
}

/// `first` must be <= 6 bytes; `total_len` must be in 8..=4095.
pub fn encode_first_frame(total_len: u16, first: &[u8]) -> Vec<u8> {
    debug_assert!(first.len() <= 6);
    let mut buf = Vec::with_capacity(2 + first.len());
    buf.push(0x10 | ((total_len >> 8) as u8 & 0x0F));
    buf.push((total_len & 0xFF) as u8);
    buf.extend_from_slice(first);
    buf
}

/// `chunk` must be 1..=7 bytes; `seq` is masked to 4 bits.
pub fn encode_consecutive_frame(seq: u8, chunk: &[u8]) -> Vec<u8> {
    debug_assert!(!chunk.is_empty() && chunk.len() <= 7);
    let mut buf = Vec::with_capacity(1 + chunk.len());
    buf.push(0x20 | (seq & 0x0F));
    buf.extend_from_slice(chunk);
    buf
}

pub fn encode_flow_control(status: FlowStatus, bs: u8, st_min: u8) -> [u8; 3] {
    [0x30 | status.nibble(), bs, st_min]
}

/// Decode a received STmin byte into the minimum inter-frame gap a sender
/// must honor. Reserved values fall back to 127 ms, the conservative upper
/// bound the spec mandates.
pub fn decode_st_min(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw as u64 - 0xF0) * 100),
        _ => Duration::from_millis(127),
    }
}

/// Validate a locally-advertised STmin byte (we should never advertise a
/// reserved value).
pub fn is_valid_st_min(raw: u8) -> bool {
    matches!(raw, 0x00..=0x7F | 0xF1..=0xF9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_frame() {
        let frame = [0x02, 0x68, 0x69];
        assert_eq!(decode(&frame), Ok(PciFrame::Single(&[0x68, 0x69])));
    }

    #[test]
    fn rejects_zero_length_single_frame() {
        assert!(decode(&[0x00]).is_err());
    }

    #[test]
    fn decodes_first_frame() {
        // S2: write(bytes(range(20)))
        let frame = [0x10, 0x14, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05];
        assert_eq!(
            decode(&frame),
            Ok(PciFrame::First {
                total_len: 20,
                data: &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05]
            })
        );
    }

    #[test]
    fn rejects_first_frame_with_short_total_len() {
        let frame = [0x10, 0x07, 0, 0, 0, 0, 0, 0];
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn decodes_consecutive_frame() {
        let frame = [0x21, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C];
        assert_eq!(
            decode(&frame),
            Ok(PciFrame::Consecutive {
                seq: 1,
                data: &[0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C]
            })
        );
    }

    #[test]
    fn decodes_flow_control() {
        let frame = [0x30, 0x02, 0x0A];
        assert_eq!(
            decode(&frame),
            Ok(PciFrame::FlowControl {
                status: FlowStatus::ContinueToSend,
                bs: 2,
                st_min: 0x0A
            })
        );
    }

    #[test]
    fn st_min_milliseconds_range() {
        assert_eq!(decode_st_min(0x00), Duration::from_millis(0));
        assert_eq!(decode_st_min(0x7F), Duration::from_millis(127));
    }

    #[test]
    fn st_min_microseconds_range() {
        assert_eq!(decode_st_min(0xF1), Duration::from_micros(100));
        assert_eq!(decode_st_min(0xF9), Duration::from_micros(900));
    }

    #[test]
    fn st_min_reserved_falls_back_to_conservative_bound() {
        assert_eq!(decode_st_min(0x80), Duration::from_millis(127));
        assert_eq!(decode_st_min(0xFA), Duration::from_millis(127));
    }

    #[test]
    fn round_trip_single_frame() {
        let encoded = encode_single_frame(&[0x68, 0x69]);
        assert_eq!(decode(&encoded), Ok(PciFrame::Single(&[0x68, 0x69])));
    }
}
