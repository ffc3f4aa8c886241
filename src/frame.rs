//! CAN frame representation (C1 data model).
//!
//! Layout and bit conventions are carried over from the kernel's
//! `struct can_frame` (see `socketcan.rs` in the original Linux SocketCAN
//! bindings this crate is descended from), but the id width is tracked
//! explicitly as a `bool` rather than inferred from an `EFF_FLAG` bit packed
//! into the id, since ISO-TP connections fix their id width at creation time
//! and never mix standard/extended frames on one address pair.

use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Maximum number of data bytes in a classic CAN frame.
pub const MAX_FRAME_DATA: usize = 8;

/// Valid bits in an 11-bit standard frame id.
pub const SFF_MASK: u32 = 0x7FF;

/// Valid bits in a 29-bit extended frame id.
pub const EFF_MASK: u32 = 0x1FFF_FFFF;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame data longer than 8 bytes")]
    TooMuchData,
    #[error("CAN id {0:#x} exceeds the addressable range")]
    IdTooLarge(u32),
}

/// A single classic CAN frame: an 11- or 29-bit identifier plus up to 8
/// data bytes. Carries an optional receive timestamp: `None` for a frame an
/// application or the protocol engine is about to send, `Some` once an
/// adapter's `recv()` has stamped it with a monotonic receive time (§4.2:
/// "yields the next inbound frame with a monotonic timestamp").
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; MAX_FRAME_DATA],
    timestamp: Option<Instant>,
}

impl CanFrame {
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > MAX_FRAME_DATA {
            return Err(FrameError::TooMuchData);
        }
        let mask = if extended { EFF_MASK } else { SFF_MASK };
        if id > mask {
            return Err(FrameError::IdTooLarge(id));
        }

        let mut buf = [0u8; MAX_FRAME_DATA];
        buf[..data.len()].copy_from_slice(data);

        Ok(Self {
            id,
            extended,
            len: data.len() as u8,
            data: buf,
            timestamp: None,
        })
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline(always)]
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The monotonic time this frame was received, if it was stamped by an
    /// adapter's `recv()`. `None` for a frame that has not yet gone over
    /// the wire.
    #[inline(always)]
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Attach a receive timestamp. Called by `CanAdapter` implementations
    /// from `recv()`, per §4.2/§6's `recv() -> (id, data, timestamp)`
    /// contract; use a monotonic clock (§9: "do not rely on wall-clock").
    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Key used by the demultiplexer to route an inbound frame to a
    /// connection: id width and value together, since standard and
    /// extended ids occupy independent spaces.
    #[inline(always)]
    pub(crate) fn route_key(&self) -> (bool, u32) {
        (self.extended, self.id)
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("{:#x}", self.id))
            .field("extended", &self.extended)
            .field("data", &self.data())
            .finish()
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}#{}", self.id, hex::encode_upper(self.data()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_data() {
        let data = [0u8; 9];
        assert_eq!(CanFrame::new(0x100, false, &data), Err(FrameError::TooMuchData));
    }

    #[test]
    fn rejects_id_outside_standard_range() {
        assert_eq!(
            CanFrame::new(0x800, false, &[]),
            Err(FrameError::IdTooLarge(0x800))
        );
        assert!(CanFrame::new(0x800, true, &[]).is_ok());
    }

    #[test]
    fn data_is_truncated_to_len() {
        let frame = CanFrame::new(0x100, false, &[1, 2, 3]).unwrap();
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.len(), 3);
    }
}
