//! Recognized per-connection configuration options (§6).

use crate::error::IsoTpError;
use crate::pci::is_valid_st_min;

/// Options accepted by `NetworkHandle::open_connection` /
/// `NetworkHandle::create_connection`. Every field mirrors the option table
/// in §6 of the spec; there is no persisted state, CLI, or environment
/// variable involved, matching the teacher crate's own convention of taking
/// every parameter as an explicit constructor argument.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// If set, all outbound frames are padded to 8 bytes with this value.
    pub padding: Option<u8>,
    /// 29-bit vs 11-bit CAN id. `None` auto-detects from `id >= 0x800`.
    pub extended_id: Option<bool>,
    /// Our advertised Block Size in flow-control frames we send.
    pub block_size: u8,
    /// Our advertised STmin, already encoded per the STmin byte table
    /// (`0x00..=0x7F` milliseconds, `0xF1..=0xF9` hundreds of microseconds).
    pub st_min: u8,
    /// Max WAIT frames we will emit as a receiver before aborting.
    pub wftmax: u8,
    /// Adapter loopback toggle, passed through to the adapter unchanged.
    pub receive_own_messages: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            padding: None,
            extended_id: None,
            block_size: 0,
            st_min: 0,
            wftmax: 0,
            receive_own_messages: false,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_padding(mut self, byte: u8) -> Self {
        self.padding = Some(byte);
        self
    }

    pub fn with_extended_id(mut self, extended: bool) -> Self {
        self.extended_id = Some(extended);
        self
    }

    pub fn with_block_size(mut self, bs: u8) -> Self {
        self.block_size = bs;
        self
    }

    pub fn with_st_min(mut self, st_min: u8) -> Self {
        self.st_min = st_min;
        self
    }

    pub fn with_wftmax(mut self, wftmax: u8) -> Self {
        self.wftmax = wftmax;
        self
    }

    pub fn with_receive_own_messages(mut self, enabled: bool) -> Self {
        self.receive_own_messages = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), IsoTpError> {
        if !is_valid_st_min(self.st_min) {
            return Err(IsoTpError::InvalidConfiguration(
                "st_min must be 0x00..=0x7F or 0xF1..=0xF9",
            ));
        }
        Ok(())
    }

    pub(crate) fn resolve_extended_id(&self, tx_id: u32, rx_id: u32) -> bool {
        self.extended_id.unwrap_or(tx_id >= 0x800 || rx_id >= 0x800)
    }
}
