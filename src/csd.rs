use crate::consts::{BLOCK_SHIFT, BLOCK_SIZE_U64};

use bitfield::bitfield;
use size::{consts::KiB, Size};

/// Raw Card Specific Data register, as received after CMD9.
pub type CsdData = [u8; 16];

bitfield! {
    /// Version 1 layout, used by MMC and standard capacity SD cards.
    /// Capacity is `(C_SIZE + 1) * 2^(C_SIZE_MULT + 2) * 2^READ_BL_LEN` bytes.
    pub struct CsdV1(u128);
    pub u8, version, _: 127, 126;
    pub u8, read_block_length, _: 83, 80;
    pub u16, device_size, _: 73, 62;
    pub u8, device_size_multiplier, _: 49, 47;
    pub erase_single_block_enabled, _: 46;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, crc, _: 7, 1;
}

bitfield! {
    /// Version 2 layout, used by high capacity cards.
    /// Capacity is `(C_SIZE + 1)` units of 512 KiB.
    pub struct CsdV2(u128);
    pub u8, version, _: 127, 126;
    pub u8, read_block_length, _: 83, 80;
    pub u32, device_size, _: 69, 48;
    pub erase_single_block_enabled, _: 46;
    pub permanent_write_protection, _: 13;
    pub temporary_write_protection, _: 12;
    pub u8, crc, _: 7, 1;
}

/// Card Specific Data in whichever layout the card reported.
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
}

/// Represents capacity provider.
pub trait CapacityProvider {
    /// Returns the card capacity in bytes.
    fn card_capacity(&self) -> Size;

    /// Returns the card capacity in 512-byte blocks.
    fn card_capacity_blocks(&self) -> u64;
}

/// The layout is selected by the structure version in the first byte, not by
/// the negotiated card type: MMC and SD v1 cards both report version 0.
impl From<CsdData> for Csd {
    fn from(csd_data: CsdData) -> Self {
        let raw = u128::from_be_bytes(csd_data);
        if csd_data[0] >> 6 == 0x01 {
            Csd::V2(CsdV2(raw))
        } else {
            Csd::V1(CsdV1(raw))
        }
    }
}

impl Csd {
    /// Either write protection flag is set.
    pub fn write_protected(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
            Csd::V2(csd) => csd.permanent_write_protection() || csd.temporary_write_protection(),
        }
    }
}

impl CsdV1 {
    fn capacity_bytes(&self) -> u64 {
        let shift = u32::from(self.device_size_multiplier()) + 2 + u32::from(self.read_block_length());
        (u64::from(self.device_size()) + 1) << shift
    }
}

impl CapacityProvider for CsdV1 {
    fn card_capacity(&self) -> Size {
        Size::from_bytes(self.capacity_bytes())
    }

    fn card_capacity_blocks(&self) -> u64 {
        self.capacity_bytes() >> BLOCK_SHIFT
    }
}

impl CapacityProvider for CsdV2 {
    fn card_capacity(&self) -> Size {
        Size::from_bytes(self.card_capacity_blocks() * BLOCK_SIZE_U64)
    }

    fn card_capacity_blocks(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * (KiB as u64)
    }
}

impl CapacityProvider for Csd {
    fn card_capacity(&self) -> Size {
        match self {
            Csd::V1(csd) => csd.card_capacity(),
            Csd::V2(csd) => csd.card_capacity(),
        }
    }

    fn card_capacity_blocks(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn v1_layout_2gb_class() {
        let csd = Csd::from(hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5"));
        let Csd::V1(v1) = &csd else {
            panic!("expected a version 1 layout");
        };
        assert_eq!(v1.version(), 0);
        assert_eq!(v1.read_block_length(), 9);
        assert_eq!(v1.device_size(), 3874);
        assert_eq!(v1.device_size_multiplier(), 7);
        assert_eq!(v1.crc(), 0x52);
        assert!(!csd.write_protected());
        assert_eq!(csd.card_capacity_blocks(), 1_984_000);
        assert_eq!(csd.card_capacity(), Size::from_bytes(1_015_808_000u64));
    }

    #[test]
    fn v1_layout_with_1024_byte_read_blocks() {
        let csd = Csd::from(hex!("00 7F 00 32 5B 5A 83 AF 7F FF CF 80 16 80 00 6F"));
        assert!(matches!(csd, Csd::V1(_)));
        assert_eq!(csd.card_capacity_blocks(), 3_864_576);
        assert_eq!(csd.card_capacity(), Size::from_bytes(1_978_662_912u64));
    }

    #[test]
    fn v2_layout() {
        let csd = Csd::from(hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B"));
        let Csd::V2(v2) = &csd else {
            panic!("expected a version 2 layout");
        };
        assert_eq!(v2.version(), 1);
        assert_eq!(v2.device_size(), 7529);
        assert!(v2.erase_single_block_enabled());
        assert_eq!(csd.card_capacity_blocks(), 7_710_720);
        assert_eq!(csd.card_capacity(), Size::from_bytes(3_947_888_640u64));
    }

    #[test]
    fn v2_layout_8gb() {
        let csd = Csd::from(hex!("40 0E 00 32 5B 59 00 00 3A 91 7F 80 0A 40 00 05"));
        assert_eq!(csd.card_capacity_blocks(), 15_353_856);
    }

    #[test]
    fn write_protection_flags() {
        let mut data = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");
        data[14] |= 0x10;
        assert!(Csd::from(data).write_protected());

        let mut data = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
        data[14] |= 0x20;
        assert!(Csd::from(data).write_protected());
    }
}
