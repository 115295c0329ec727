/// Sector size, fixed for every card type.
pub const BLOCK_SIZE: usize = 512;
/// Sector size as u64.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;
/// Shift converting a sector index into a byte address.
pub const BLOCK_SHIFT: u32 = 9;

pub mod commands {
    /// CMD base value.
    pub const CMD_BASE: u8 = 0x40;
    /// ACMD flag, stripped before framing.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_OP_COND - MMC style operating condition polling.
    pub const CMD1: u8 = CMD_BASE + 1;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = CMD_BASE + 9;
    /// STOP_TRANSMISSION - end multiple block read sequence.
    pub const CMD12: u8 = CMD_BASE + 12;
    /// SEND_STATUS - read the card status register.
    pub const CMD13: u8 = CMD_BASE + 13;
    /// SET_BLOCKLEN - set the block length for standard capacity cards.
    pub const CMD16: u8 = CMD_BASE + 16;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card.
    pub const CMD18: u8 = CMD_BASE + 18;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = CMD_BASE + 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
    pub const CMD25: u8 = CMD_BASE + 25;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// CRC_ON_OFF - enable or disable CRC checking.
    pub const CMD59: u8 = CMD_BASE + 59;
    /// SEND_NUM_WR_BLOCKS - number of well written blocks of the last
    /// multiple block write.
    pub const ACMD22: u8 = CMD_BASE + ACMD_FLAG + 22;
    /// SET_WR_BLK_ERASE_COUNT - pre-erase before a multiple block write.
    pub const ACMD23: u8 = CMD_BASE + ACMD_FLAG + 23;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = CMD_BASE + ACMD_FLAG + 41;
    /// SET_CLR_CARD_DETECT - connect/disconnect the card detect pull-up.
    pub const ACMD42: u8 = CMD_BASE + ACMD_FLAG + 42;

    /// Command index without the transmission bits and ACMD flag.
    pub const fn index(cmd: u8) -> u8 {
        cmd & !(CMD_BASE | ACMD_FLAG)
    }
}

pub mod tokens {
    /// Byte clocked out while receiving.
    pub const RECEIVE: u8 = 0xFF;
    /// No response on the bus.
    pub const NO_RESPONSE: u8 = 0xFF;
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for the status field of a data response token.
    pub const DATA_RES_MASK: u8 = 0x0E;
    /// Data accepted.
    pub const DATA_RES_ACCEPTED: u8 = 0x04;
    /// Data rejected due to a CRC error.
    pub const DATA_RES_CRC_ERROR: u8 = 0x0A;
    /// Data rejected due to a write error.
    pub const DATA_RES_WRITE_ERROR: u8 = 0x0C;
    /// Checksum placeholder for commands sent without CRC.
    pub const CRC7_PLACEHOLDER: u8 = 0x01;
    /// Checksum placeholder for data blocks sent without CRC.
    pub const CRC16_PLACEHOLDER: u16 = 0xFFFF;
}

pub mod args {
    /// CMD8 argument: 2.7-3.6V supply, 0xAA check pattern.
    pub const IF_COND_CHECK: u32 = 0x0000_01AA;
    /// Mask of the echoed voltage and check pattern.
    pub const IF_COND_ECHO_MASK: u32 = 0x0000_0FFF;
    /// ACMD41 argument for hosts supporting high capacity cards.
    pub const OP_COND_HCS: u32 = 0x4010_0000;
    /// ACMD41/CMD1 argument for legacy cards (3.2-3.4V window).
    pub const OP_COND_LEGACY: u32 = 0x0010_0000;
    /// OCR 3.2-3.3V window bit.
    pub const OCR_3V3: u32 = 1 << 20;
    /// OCR card capacity status bit.
    pub const OCR_CCS: u32 = 1 << 30;
    /// CMD59 argument enabling CRC checking.
    pub const CRC_ON: u32 = 0x0000_0001;
}
