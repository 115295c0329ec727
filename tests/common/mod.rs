#![allow(dead_code)]

//! Byte level SD card model behind the driver's bus traits.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use hex_literal::hex;
use sdspi_diskio::{crc16, crc7, Clock, SdMmcSpi, SpiBus, SpiSettings, BLOCK_SIZE};
use switch_hal::OutputSwitch;

/// Version 1 layout, 1_984_000 sectors.
pub const CSD_V1: [u8; 16] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
/// Version 1 layout with 1024-byte read blocks, 3_864_576 sectors.
pub const CSD_V1_1K: [u8; 16] = hex!("00 7F 00 32 5B 5A 83 AF 7F FF CF 80 16 80 00 6F");
/// Version 2 layout, 7_710_720 sectors.
pub const CSD_V2: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Sdhc,
    SdV2,
    SdV1,
    Mmc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub index: u8,
    pub app: bool,
    pub arg: u32,
}

enum Phase {
    Command,
    Stream { next: u32 },
    AwaitToken { sector: u32, multiple: bool },
    Data { sector: u32, multiple: bool, buf: Vec<u8> },
}

pub struct CardModel {
    pub kind: Kind,
    pub csd: [u8; 16],

    /// Never drives the bus.
    pub dead: bool,
    /// Stays idle through every operating condition poll.
    pub never_ready: bool,
    /// Answers CMD59 with illegal command.
    pub reject_crc: bool,
    /// Number of sector data blocks sent with a broken CRC.
    pub corrupt_reads: usize,
    /// Number of written blocks answered with a CRC rejection.
    pub reject_writes: usize,
    /// Reject the block after this many were accepted in one multiple write.
    pub stop_multi_write_after: Option<usize>,
    /// Operating condition polls answered idle before going ready.
    pub op_cond_polls: usize,
    /// Number of sector reads answered with data error token 0x04.
    pub data_error_tokens: usize,
    /// Number of command frames answered with the command CRC error bit.
    pub command_crc_errors: usize,
    /// Answer this command index with this R1 token, every time.
    pub error_token: Option<(u8, u8)>,
    /// Leave the next command unanswered, then hold MISO low once selected
    /// again.
    pub silent_then_busy: bool,

    pub commands: Vec<Command>,
    pub writes: HashMap<u32, usize>,
    pub accepted_bytes: usize,
    pub begins: usize,
    pub ends: usize,
    pub cs_switches: usize,
    pub frequencies: Vec<u32>,
    pub crc_failures: usize,
    pub now: u32,
    pub sectors: HashMap<u32, [u8; BLOCK_SIZE]>,

    selected: bool,
    idle: bool,
    app: bool,
    crc_on: bool,
    busy: usize,
    polls: usize,
    run_written: usize,
    stalled: bool,
    hold_low: bool,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    phase: Phase,
}

impl CardModel {
    pub fn new(kind: Kind) -> Self {
        let csd = match kind {
            Kind::Sdhc => CSD_V2,
            Kind::SdV2 => CSD_V1_1K,
            Kind::SdV1 | Kind::Mmc => CSD_V1,
        };

        CardModel {
            kind,
            csd,
            dead: false,
            never_ready: false,
            reject_crc: false,
            corrupt_reads: 0,
            reject_writes: 0,
            stop_multi_write_after: None,
            op_cond_polls: 2,
            data_error_tokens: 0,
            command_crc_errors: 0,
            error_token: None,
            silent_then_busy: false,
            commands: Vec::new(),
            writes: HashMap::new(),
            accepted_bytes: 0,
            begins: 0,
            ends: 0,
            cs_switches: 0,
            frequencies: Vec::new(),
            crc_failures: 0,
            now: 0,
            sectors: HashMap::new(),
            selected: false,
            idle: false,
            app: false,
            crc_on: false,
            busy: 0,
            polls: 0,
            run_written: 0,
            stalled: false,
            hold_low: false,
            frame: Vec::new(),
            out: VecDeque::new(),
            phase: Phase::Command,
        }
    }

    /// Number of times a command was received.
    pub fn count(&self, index: u8, app: bool) -> usize {
        self.commands
            .iter()
            .filter(|c| c.index == index && c.app == app)
            .count()
    }

    pub fn args(&self, index: u8, app: bool) -> Vec<u32> {
        self.commands
            .iter()
            .filter(|c| c.index == index && c.app == app)
            .map(|c| c.arg)
            .collect()
    }

    pub fn fill_sector(&mut self, sector: u32, byte: u8) {
        self.sectors.insert(sector, [byte; BLOCK_SIZE]);
    }

    fn select(&mut self, selected: bool) {
        self.cs_switches += 1;
        self.selected = selected;
        if selected && self.stalled {
            self.hold_low = true;
        }
        if !selected {
            self.out.clear();
            self.frame.clear();
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected || self.dead {
            return 0xFF;
        }
        if self.hold_low {
            return 0x00;
        }

        if let Phase::Data { buf, .. } = &mut self.phase {
            buf.push(mosi);
            if buf.len() == BLOCK_SIZE + 2 {
                if let Phase::Data {
                    sector,
                    multiple,
                    buf,
                } = std::mem::replace(&mut self.phase, Phase::Command)
                {
                    self.finish_data(sector, multiple, &buf);
                }
            }
            return 0xFF;
        }

        if !self.frame.is_empty() || mosi & 0xC0 == 0x40 {
            if self.frame.is_empty() {
                self.out.clear();
            }
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let frame = std::mem::take(&mut self.frame);
                self.command(&frame);
            }
            return 0xFF;
        }

        if let Phase::AwaitToken { sector, multiple } = self.phase {
            match mosi {
                0xFE if !multiple => {
                    self.phase = Phase::Data {
                        sector,
                        multiple,
                        buf: Vec::with_capacity(BLOCK_SIZE + 2),
                    };
                    return 0xFF;
                }
                0xFC if multiple => {
                    self.phase = Phase::Data {
                        sector,
                        multiple,
                        buf: Vec::with_capacity(BLOCK_SIZE + 2),
                    };
                    return 0xFF;
                }
                0xFD if multiple => {
                    self.phase = Phase::Command;
                    self.busy += 2;
                    return 0xFF;
                }
                _ => {}
            }
        }

        if let Some(byte) = self.out.pop_front() {
            return byte;
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        if let Phase::Stream { next } = self.phase {
            self.phase = Phase::Stream { next: next + 1 };
            self.queue_sector(next);
            return self.out.pop_front().unwrap_or(0xFF);
        }

        0xFF
    }

    fn r1(&self) -> u8 {
        u8::from(self.idle)
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.out.push_back(0xFF);
        self.out.extend(bytes.iter().copied());
    }

    fn data_block(&mut self, payload: &[u8], crc: u16) {
        self.out.push_back(0xFF);
        self.out.push_back(0xFE);
        self.out.extend(payload.iter().copied());
        self.out.extend(crc.to_be_bytes());
    }

    fn queue_sector(&mut self, sector: u32) {
        if self.data_error_tokens > 0 {
            self.data_error_tokens -= 1;
            self.out.extend([0xFF, 0x04]);
            return;
        }
        let data = self.sectors.get(&sector).copied().unwrap_or([0u8; BLOCK_SIZE]);
        let mut crc = crc16(&data);
        if self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            crc ^= 0xFFFF;
        }
        self.data_block(&data, crc);
    }

    fn sector(&self, arg: u32) -> u32 {
        if self.kind == Kind::Sdhc {
            arg
        } else {
            assert_eq!(arg % BLOCK_SIZE as u32, 0, "unaligned byte address");
            arg / BLOCK_SIZE as u32
        }
    }

    fn op_cond(&mut self) {
        if !self.never_ready {
            self.polls += 1;
            if self.polls > self.op_cond_polls {
                self.idle = false;
            }
        }
        let r1 = self.r1();
        self.respond(&[r1]);
    }

    fn command(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = std::mem::take(&mut self.app);
        self.commands.push(Command { index, app, arg });

        if std::mem::take(&mut self.silent_then_busy) {
            self.stalled = true;
            return;
        }
        if self.command_crc_errors > 0 {
            self.command_crc_errors -= 1;
            let r1 = self.r1() | 0x08;
            self.respond(&[r1]);
            return;
        }
        match self.error_token {
            Some((failing, token)) if failing == index && !app => {
                self.respond(&[token]);
                return;
            }
            _ => {}
        }

        if (self.crc_on || index == 0 || index == 8) && frame[5] != (crc7(&frame[..5]) << 1) | 1 {
            self.crc_failures += 1;
            let r1 = self.r1() | 0x08;
            self.respond(&[r1]);
            return;
        }

        let r1 = self.r1();
        match (app, index) {
            (_, 0) => {
                self.idle = true;
                self.crc_on = false;
                self.busy = 0;
                self.polls = 0;
                self.phase = Phase::Command;
                self.respond(&[0x01]);
            }
            (false, 59) => {
                if self.reject_crc {
                    self.respond(&[0x05]);
                } else {
                    self.crc_on = arg & 1 != 0;
                    self.respond(&[r1]);
                }
            }
            (false, 8) => match self.kind {
                Kind::Sdhc | Kind::SdV2 => {
                    let echo = (arg & 0xFFF).to_be_bytes();
                    self.respond(&[r1, echo[0], echo[1], echo[2], echo[3]]);
                }
                Kind::SdV1 | Kind::Mmc => self.respond(&[0x05]),
            },
            (false, 58) => {
                let mut ocr: u32 = 0x00FF_8000;
                if !self.idle {
                    ocr |= 0x8000_0000;
                    if self.kind == Kind::Sdhc {
                        ocr |= 1 << 30;
                    }
                }
                let ocr = ocr.to_be_bytes();
                self.respond(&[r1, ocr[0], ocr[1], ocr[2], ocr[3]]);
            }
            (false, 55) => {
                if self.kind == Kind::Mmc {
                    self.respond(&[0x05]);
                } else {
                    self.app = true;
                    self.respond(&[r1]);
                }
            }
            (true, 41) | (false, 1) => self.op_cond(),
            (true, 42) | (true, 23) | (false, 16) => self.respond(&[0x00]),
            (true, 22) => {
                self.respond(&[0x00]);
                let count = (self.run_written as u32).to_be_bytes();
                self.data_block(&count, crc16(&count));
            }
            (false, 9) => {
                self.respond(&[0x00]);
                let csd = self.csd;
                self.data_block(&csd, crc16(&csd));
            }
            (false, 12) => {
                self.phase = Phase::Command;
                self.respond(&[0x00]);
            }
            (false, 13) => self.respond(&[0x00, 0x00]),
            (false, 17) => {
                let sector = self.sector(arg);
                self.respond(&[0x00]);
                self.queue_sector(sector);
            }
            (false, 18) => {
                let next = self.sector(arg);
                self.phase = Phase::Stream { next };
                self.respond(&[0x00]);
            }
            (false, 24) => {
                let sector = self.sector(arg);
                self.phase = Phase::AwaitToken {
                    sector,
                    multiple: false,
                };
                self.respond(&[0x00]);
            }
            (false, 25) => {
                let sector = self.sector(arg);
                self.run_written = 0;
                self.phase = Phase::AwaitToken {
                    sector,
                    multiple: true,
                };
                self.respond(&[0x00]);
            }
            _ => self.respond(&[r1 | 0x04]),
        }
    }

    fn finish_data(&mut self, sector: u32, multiple: bool, buf: &[u8]) {
        let (data, crc) = buf.split_at(BLOCK_SIZE);
        let crc = u16::from_be_bytes([crc[0], crc[1]]);

        let accepted = if multiple && self.stop_multi_write_after == Some(self.run_written) {
            self.stop_multi_write_after = None;
            false
        } else if self.reject_writes > 0 {
            self.reject_writes -= 1;
            false
        } else if self.crc_on && crc != crc16(data) {
            self.crc_failures += 1;
            false
        } else {
            true
        };

        if accepted {
            let mut sector_data = [0u8; BLOCK_SIZE];
            sector_data.copy_from_slice(data);
            self.sectors.insert(sector, sector_data);
            *self.writes.entry(sector).or_insert(0) += 1;
            self.accepted_bytes += BLOCK_SIZE;
            self.run_written += 1;
            self.busy += 1;
            self.out.push_back(0x05);
        } else {
            self.out.push_back(0x0B);
        }

        if multiple {
            self.phase = Phase::AwaitToken {
                sector: if accepted { sector + 1 } else { sector },
                multiple,
            };
        }
    }
}

pub struct SimSpi(Rc<RefCell<CardModel>>);
pub struct SimCs(Rc<RefCell<CardModel>>);
pub struct SimClock(Rc<RefCell<CardModel>>);

impl Transfer<u8> for SimSpi {
    type Error = BusError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

impl SpiBus for SimSpi {
    fn begin_transaction(&mut self, settings: &SpiSettings) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        card.begins += 1;
        card.frequencies.push(settings.frequency);
        Ok(())
    }

    fn end_transaction(&mut self) {
        self.0.borrow_mut().ends += 1;
    }
}

impl OutputSwitch for SimCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(true);
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(false);
        Ok(())
    }
}

impl DelayMs<u32> for SimClock {
    fn delay_ms(&mut self, ms: u32) {
        let mut card = self.0.borrow_mut();
        card.now = card.now.wrapping_add(ms);
    }
}

impl Clock for SimClock {
    fn now_ms(&mut self) -> u32 {
        let mut card = self.0.borrow_mut();
        card.now = card.now.wrapping_add(1);
        card.now
    }
}

pub type Driver = SdMmcSpi<SimSpi, SimCs, SimClock>;

pub fn driver(card: CardModel, frequency: u32) -> (Driver, Rc<RefCell<CardModel>>) {
    init_logger();
    let card = Rc::new(RefCell::new(card));
    let driver = SdMmcSpi::new(
        SimSpi(card.clone()),
        SimCs(card.clone()),
        SimClock(card.clone()),
        frequency,
    );
    (driver, card)
}
