use crate::consts::tokens;

use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub start_bit, _: 7;
}

impl R1Response {
    /// Card is ready, no error.
    pub const READY_STATE: Self = Self(0x00);
    /// Card is in idle state, no error.
    pub const IN_IDLE_STATE: Self = Self(0x01);
    /// Legacy card rejecting an unknown command while idle.
    pub const IN_IDLE_AND_ILLEGAL: Self = Self(0x05);
    /// Nothing but the idle line was sampled.
    pub const NO_RESPONSE: Self = Self(tokens::NO_RESPONSE);

    /// A response token has the start bit cleared.
    pub fn is_valid(&self) -> bool {
        !self.start_bit()
    }

    /// Ready or idle; anything above is an error report.
    pub fn is_ok(&self) -> bool {
        self.0 <= Self::IN_IDLE_STATE.0
    }

    /// Raw token value.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl From<u8> for R1Response {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for R1Response {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "R1Response(0x{:02X})", self.0)
    }
}

/// Response of the card to a data block.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataResponse {
    /// Block accepted.
    Accepted,
    /// Block rejected, CRC mismatch on the card side.
    CrcError,
    /// Block rejected, the card failed to program it.
    WriteError,
    /// Anything else, including a missing response.
    Unknown(u8),
}

impl From<u8> for DataResponse {
    fn from(raw: u8) -> Self {
        match raw & tokens::DATA_RES_MASK {
            tokens::DATA_RES_ACCEPTED if raw & 0x11 == 0x01 => DataResponse::Accepted,
            tokens::DATA_RES_CRC_ERROR if raw & 0x11 == 0x01 => DataResponse::CrcError,
            tokens::DATA_RES_WRITE_ERROR if raw & 0x11 == 0x01 => DataResponse::WriteError,
            _ => DataResponse::Unknown(raw),
        }
    }
}
