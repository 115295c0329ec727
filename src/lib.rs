//! SD/MMC over SPI block device driver written in Embedded Rust, that inspired by
//! [embedded-sdmmc](https://crates.io/crates/embedded-sdmmc).
//!
//! This crate lets a microcontroller use an SD card as the storage behind a
//! FAT filesystem. [`SdMmcSpi`] negotiates the card type, checksums and block
//! length, then reads and writes 512-byte sectors through the
//! [`DiskioDevice`] interface.
//!
//! ## Features
//!
//! * `log` (default): log messages with the `log` crate.
//! * `defmt-log`: turn off the default features and enable this one to log
//!   over defmt instead.
//! * `sparse-disk` (default): [`SparseDisk`], a sparse in-memory image for
//!   testing filesystem code on the host. Needs `alloc`.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "sparse-disk")]
extern crate alloc;

mod block_io;
mod bus;
mod config;
mod consts;
mod crc;
mod csd;
mod init;
mod response;
mod retry;
mod session;
#[cfg(feature = "sparse-disk")]
mod sparse;
mod transaction;

pub use crate::bus::{Clock, SpiBus, SpiSettings};
pub use crate::config::{DefaultSdMmcSpiConfig, SdMmcSpiConfig};
pub use crate::consts::BLOCK_SIZE;
pub use crate::crc::{crc16, crc7};
pub use crate::csd::{CapacityProvider, Csd, CsdData, CsdV1, CsdV2};
pub use crate::init::InitState;
pub use crate::response::{DataResponse, R1Response};
pub use crate::session::{CardSession, CardType};
#[cfg(feature = "sparse-disk")]
pub use crate::sparse::{SparseDisk, SparseDiskError};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    consts::{commands, BLOCK_SIZE_U64},
    retry::Attempt,
    transaction::Transaction,
};

use core::{cell::RefCell, marker::PhantomData};
use embedded_hal::blocking::spi::Transfer;
use size::Size;
use switch_hal::OutputSwitch;

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
compile_error!("Must enable either log or defmt-log");

#[cfg(feature = "defmt-log")]
use defmt::{error, info, warn};
#[cfg(feature = "log")]
use log::{error, info, warn};

/// [`SdMmcSpi`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// The card stayed busy after being selected.
    SelectTimeout,
    /// No response token, or no data token, within the budget.
    TokenTimeout,
    /// The card reported a checksum error on a command.
    CommandCrcError(u8),
    /// CRC mismatch on a received data block (card, host).
    CrcError(u16, u16),
    /// The card rejected a written data block because of its CRC.
    CrcRejected,
    /// The card answered with a definite error token.
    CardError(u8),
    /// The card sent a data error token instead of a data block.
    DataToken(u8),
    /// The card failed to program a data block.
    WriteError(u8),
    /// The card could not be identified.
    UnknownCard,
    /// Sector address does not fit the command argument.
    InvalidArgument,
}

/// Error type alias.
pub type ErrorFor<Spi, Cs> =
    Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;

impl<T, S> Error<T, S> {
    /// Worth another attempt: the card may answer correctly next time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SelectTimeout
                | Error::TokenTimeout
                | Error::CommandCrcError(_)
                | Error::DataToken(_)
                | Error::CrcError(_, _)
                | Error::CrcRejected
        )
    }

    /// Failure of the SPI peripheral or chip select pin, not the card.
    pub fn is_bus(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::SelectError(_))
    }

    /// Variant name, for logging without formatting the inner errors.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Transport(_) => "Transport",
            Error::SelectError(_) => "SelectError",
            Error::SelectTimeout => "SelectTimeout",
            Error::TokenTimeout => "TokenTimeout",
            Error::CommandCrcError(_) => "CommandCrcError",
            Error::CrcError(_, _) => "CrcError",
            Error::CrcRejected => "CrcRejected",
            Error::CardError(_) => "CardError",
            Error::DataToken(_) => "DataToken",
            Error::WriteError(_) => "WriteError",
            Error::UnknownCard => "UnknownCard",
            Error::InvalidArgument => "InvalidArgument",
        }
    }

    pub(crate) fn into_attempt<R>(self) -> Attempt<R, Self> {
        if self.is_transient() {
            Attempt::Retry(self)
        } else {
            Attempt::Fatal(self)
        }
    }
}

impl<T, S> From<Error<T, S>> for DiskioError<Error<T, S>> {
    fn from(err: Error<T, S>) -> Self {
        match err {
            Error::InvalidArgument => DiskioError::InvalidArgument,
            err => DiskioError::Hardware(err),
        }
    }
}

/// SD Card SPI driver.
///
/// `Spi` - SPI bus.
/// `Cs` - Chip select output switch.
/// `Clk` - Millisecond clock.
/// `Config` - Config implementation of driver config trait.
///
/// Only one driver may talk to a physical bus at a time; if other threads
/// share the bus, wrap every call in a lock held for the whole call.
pub struct SdMmcSpi<Spi, Cs, Clk, Config = DefaultSdMmcSpiConfig>
where
    Spi: SpiBus,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdMmcSpiConfig,
{
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    clock: RefCell<Clk>,
    session: RefCell<CardSession>,
    config: PhantomData<Config>,
}

type DiskResult<Spi, Cs> = Result<(), DiskioError<ErrorFor<Spi, Cs>>>;

impl<Spi, Cs, Clk, Config> SdMmcSpi<Spi, Cs, Clk, Config>
where
    Spi: SpiBus,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdMmcSpiConfig,
{
    /// Creates a new [`SdMmcSpi<Spi, Cs, Clk, Config>`].
    ///
    /// `spi` - SPI bus.
    /// `cs` - chip select output switch, `on` selects the card.
    /// `clock` - millisecond clock.
    /// `frequency` - bus frequency after initialization, capped at
    /// [`SdMmcSpiConfig::MAX_FREQUENCY`].
    ///
    /// The card is not touched until [`DiskioDevice::initialize`].
    pub fn new(spi: Spi, cs: Cs, clock: Clk, frequency: u32) -> Self {
        SdMmcSpi {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            clock: RefCell::new(clock),
            session: RefCell::new(CardSession::new(frequency)),
            config: PhantomData::<Config>,
        }
    }

    /// Negotiated session parameters.
    pub fn session(&self) -> CardSession {
        self.session.borrow().clone()
    }

    /// Negotiated card type.
    pub fn card_type(&self) -> CardType {
        self.session.borrow().card_type()
    }

    /// Number of 512-byte sectors on the card, 0 until initialized.
    pub fn sector_count(&self) -> u64 {
        self.session.borrow().sector_count()
    }

    /// Card capacity.
    pub fn card_size(&self) -> Size {
        Size::from_bytes(self.sector_count() * BLOCK_SIZE_U64)
    }

    /// Mark the card as write protected, e.g. from a write protect switch.
    pub fn set_write_protected(&mut self, protected: bool) {
        self.session
            .get_mut()
            .set_flag(StatusFlag::WriteProtected, protected);
    }

    /// Put the card back to idle and hand back the peripherals.
    pub fn release(self) -> (Spi, Cs, Clk) {
        info!("SD release invoked");
        if let Ok(mut transaction) = self.transaction(self.frequency()) {
            if transaction.command_transaction(commands::CMD0, 0x0000_0000).is_err() {
                warn!("SD did not acknowledge idle reset on release");
            }
        }
        (
            self.spi.into_inner(),
            self.cs.into_inner(),
            self.clock.into_inner(),
        )
    }

    fn frequency(&self) -> u32 {
        self.session.borrow().frequency
    }

    /// Open a bus scope at `frequency`.
    fn transaction(
        &self,
        frequency: u32,
    ) -> Result<Transaction<'_, Spi, Cs, Clk, Config>, ErrorFor<Spi, Cs>> {
        Transaction::begin(
            self.spi.borrow_mut(),
            self.cs.borrow_mut(),
            self.clock.borrow_mut(),
            self.session.borrow_mut(),
            SpiSettings::new(frequency),
        )
    }

    /// Validate buffer for read/write and return the first sector and the
    /// sector count.
    fn validate_buffer(
        buf_len: usize,
        lba: Lba,
    ) -> Result<(u32, u32), DiskioError<ErrorFor<Spi, Cs>>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            return Err(DiskioError::InvalidArgument);
        }
        let count =
            u32::try_from(buf_len / BLOCK_SIZE).map_err(|_| DiskioError::InvalidArgument)?;
        let sector = u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)?;
        sector
            .checked_add(count)
            .ok_or(DiskioError::InvalidArgument)?;

        Ok((sector, count))
    }

    /// Validate initialized.
    fn validate_initialized(&self) -> DiskResult<Spi, Cs> {
        if self.session.borrow().is_ready() {
            Ok(())
        } else {
            Err(DiskioError::NotInitialized)
        }
    }
}

impl<Spi, Cs, Clk, Config> DiskioDevice for SdMmcSpi<Spi, Cs, Clk, Config>
where
    Spi: SpiBus,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdMmcSpiConfig,
    <Spi as Transfer<u8>>::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = ErrorFor<Spi, Cs>;

    fn status(&self) -> Status {
        self.session.borrow().status()
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.session.get_mut().mark_uninitialized();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if self.session.get_mut().is_ready() {
            warn!("SD already is initialized");
            return Ok(());
        }

        self.transaction(Config::INIT_FREQUENCY)?.run_init()?;
        Ok(())
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let (sector, count) = Self::validate_buffer(buf.len(), lba)?;
        self.validate_initialized()?;

        let mut transaction = self.transaction(self.frequency())?;
        if count == 1 {
            transaction.read_sector(buf, sector)?;
        } else {
            transaction.read_sectors(buf, sector)?;
        }

        Ok(())
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let (sector, count) = Self::validate_buffer(buf.len(), lba)?;
        self.validate_initialized()?;
        if self.status().contains(StatusFlag::WriteProtected) {
            return Err(DiskioError::WriteProtected);
        }

        let mut transaction = self.transaction(self.frequency())?;
        if count == 1 {
            transaction.write_sector(buf, sector)?;
        } else {
            transaction.write_sectors(buf, sector)?;
        }

        Ok(())
    }

    fn ioctl(&self, cmd: IoctlCmd<'_>) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => {}
            IoctlCmd::GetSectorCount(count) => *count = self.sector_count(),
            IoctlCmd::GetSectorSize(size) => *size = BLOCK_SIZE,
            IoctlCmd::GetBlockSize(size) => *size = 1,
            IoctlCmd::CtrlTrim(_) => return Err(DiskioError::NotSupported),
        }

        Ok(())
    }
}
