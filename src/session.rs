use crate::consts::BLOCK_SHIFT;

use diskio::{Status, StatusFlag};

/// Card type.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    /// Not negotiated yet.
    None,
    /// Standard capacity SD card, byte addressed.
    SD,
    /// High capacity SD card, block addressed.
    SDHC,
    /// MultiMediaCard, byte addressed.
    MMC,
    /// Negotiation failed.
    Unknown,
}

impl CardType {
    /// Block index cards take the sector number as command argument.
    pub fn is_block_addressed(&self) -> bool {
        matches!(self, CardType::SDHC)
    }
}

/// Parameters negotiated with the single active card on the bus.
#[derive(Debug, Clone)]
pub struct CardSession {
    pub(crate) frequency: u32,
    pub(crate) card_type: CardType,
    pub(crate) sector_count: u64,
    pub(crate) crc_enabled: bool,
    pub(crate) status: Status,
}

impl CardSession {
    pub(crate) fn new(frequency: u32) -> Self {
        CardSession {
            frequency,
            card_type: CardType::None,
            sector_count: 0,
            crc_enabled: true,
            status: StatusFlag::NotInitialized.into(),
        }
    }

    /// Bus frequency for card operations, capped after initialization.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Negotiated card type.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Number of 512-byte sectors decoded from the CSD register.
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Whether commands and data blocks carry checksums.
    pub fn crc_enabled(&self) -> bool {
        self.crc_enabled
    }

    /// Current status bits.
    pub fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn is_ready(&self) -> bool {
        !self.status.contains(StatusFlag::NotInitialized)
    }

    pub(crate) fn mark_uninitialized(&mut self) {
        self.status |= StatusFlag::NotInitialized;
    }

    pub(crate) fn set_flag(&mut self, flag: StatusFlag, on: bool) {
        if on {
            self.status |= flag;
        } else {
            self.status -= flag;
        }
    }

    /// Command argument addressing `sector`.
    pub(crate) fn address(&self, sector: u32) -> Option<u32> {
        if self.card_type.is_block_addressed() {
            Some(sector)
        } else {
            sector.checked_mul(1 << BLOCK_SHIFT)
        }
    }
}
