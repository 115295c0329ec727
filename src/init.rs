//! Card initialization state machine.

use crate::{
    bus::{Clock, SpiBus},
    config::SdMmcSpiConfig,
    consts::{args, commands, BLOCK_SIZE},
    csd::{CapacityProvider, Csd, CsdData},
    response::R1Response,
    retry::{retry, Attempt},
    session::CardType,
    transaction::Transaction,
    Error, ErrorFor,
};

use diskio::StatusFlag;
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info};
#[cfg(feature = "log")]
use log::{debug, error, info};

/// Steps of the negotiation with a freshly powered card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Nothing sent yet.
    Start,
    /// The card acknowledged the reset and is idle in SPI mode.
    IdleReset,
    /// CRC checking was turned on, or the card does not support it.
    CrcNegotiated,
    /// The card answered the interface condition check: SD v2.
    V2Branch,
    /// No interface condition answer: SD v1 or MMC.
    LegacyBranch,
    /// The card left idle state as this type.
    TypeResolved(CardType),
    /// Block length is 512 bytes.
    BlockLengthSet,
    /// Session is usable.
    Ready,
    /// Negotiation failed.
    Unknown,
}

impl<'a, Spi, Cs, Clk, Config> Transaction<'a, Spi, Cs, Clk, Config>
where
    Spi: SpiBus,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdMmcSpiConfig,
{
    /// Drive the state machine to [`InitState::Ready`] or
    /// [`InitState::Unknown`].
    pub(crate) fn run_init(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("SD initialize started");

        self.session.card_type = CardType::None;
        self.session.sector_count = 0;
        self.session.crc_enabled = true;
        self.session.mark_uninitialized();
        self.session.set_flag(StatusFlag::ErrorOccured, false);

        let mut state = InitState::Start;
        let mut failure = Error::UnknownCard;

        loop {
            state = match state {
                InitState::Ready => break,
                InitState::Unknown => {
                    error!("SD initialization failed: {}", failure.name());
                    self.session.card_type = CardType::Unknown;
                    self.session.sector_count = 0;
                    self.session.mark_uninitialized();
                    self.session.set_flag(StatusFlag::ErrorOccured, true);
                    return Err(failure);
                }
                current => match self.init_step(current) {
                    Ok(next) => {
                        debug!("SD init: {:?} -> {:?}", current, next);
                        next
                    }
                    Err(err) => {
                        if err.is_bus() {
                            failure = err;
                        }
                        InitState::Unknown
                    }
                },
            };
        }

        self.session.set_flag(StatusFlag::NotInitialized, false);

        info!(
            "SD successfully initialized, type: {:?}, sectors: {}, crc: {}",
            self.session.card_type,
            self.session.sector_count,
            self.session.crc_enabled
        );

        Ok(())
    }

    /// One transition. Card level failures map to [`InitState::Unknown`],
    /// bus failures are returned.
    pub(crate) fn init_step(&mut self, state: InitState) -> Result<InitState, ErrorFor<Spi, Cs>> {
        let next = match state {
            InitState::Start => {
                self.clock_idle(Config::INIT_CLOCK_BYTES)?;
                match self.command_transaction(commands::CMD0, 0x0000_0000) {
                    Ok(response) if response.r1 == R1Response::IN_IDLE_STATE => {
                        InitState::IdleReset
                    }
                    result => self.unexpected(commands::CMD0, result)?,
                }
            }
            InitState::IdleReset => match self.command_transaction(commands::CMD59, args::CRC_ON) {
                Ok(response) if response.r1 == R1Response::IN_IDLE_STATE => {
                    InitState::CrcNegotiated
                }
                Err(Error::CardError(token)) if token == R1Response::IN_IDLE_AND_ILLEGAL.bits() => {
                    info!("SD card does not support CRC, continuing without");
                    self.session.crc_enabled = false;
                    InitState::CrcNegotiated
                }
                result => self.unexpected(commands::CMD59, result)?,
            },
            InitState::CrcNegotiated => match self.send_if_cond() {
                Ok((r1, echo))
                    if r1 == R1Response::IN_IDLE_STATE && echo == args::IF_COND_CHECK =>
                {
                    InitState::V2Branch
                }
                Err(err) if err.is_bus() => return Err(err),
                _ => InitState::LegacyBranch,
            },
            InitState::V2Branch => {
                if !self.ocr_supports_3v3()? {
                    return Ok(InitState::Unknown);
                }
                if !self.poll_op_cond(commands::ACMD41, args::OP_COND_HCS, false)? {
                    return Ok(InitState::Unknown);
                }
                match self.read_ocr() {
                    Ok((r1, ocr)) if r1 == R1Response::READY_STATE => {
                        if (ocr & args::OCR_CCS) != 0 {
                            InitState::TypeResolved(CardType::SDHC)
                        } else {
                            InitState::TypeResolved(CardType::SD)
                        }
                    }
                    Err(err) if err.is_bus() => return Err(err),
                    _ => InitState::Unknown,
                }
            }
            InitState::LegacyBranch => {
                if !self.ocr_supports_3v3()? {
                    return Ok(InitState::Unknown);
                }
                if self.poll_op_cond(commands::ACMD41, args::OP_COND_LEGACY, false)? {
                    InitState::TypeResolved(CardType::SD)
                } else if self.poll_op_cond(commands::CMD1, args::OP_COND_LEGACY, true)? {
                    InitState::TypeResolved(CardType::MMC)
                } else {
                    InitState::Unknown
                }
            }
            InitState::TypeResolved(card_type) => {
                self.session.card_type = card_type;

                if card_type != CardType::MMC {
                    match self.command_transaction(commands::ACMD42, 0x0000_0000) {
                        Ok(response) if response.r1 == R1Response::READY_STATE => {}
                        result => return self.unexpected(commands::ACMD42, result),
                    }
                }

                if card_type != CardType::SDHC {
                    match self.command_transaction(commands::CMD16, BLOCK_SIZE as u32) {
                        Ok(response) if response.r1 == R1Response::READY_STATE => {}
                        result => return self.unexpected(commands::CMD16, result),
                    }
                }

                InitState::BlockLengthSet
            }
            InitState::BlockLengthSet => match self.read_csd() {
                Ok(csd) => {
                    self.session.sector_count = csd.card_capacity_blocks();
                    if csd.write_protected() {
                        info!("SD card reports write protection");
                        self.session.set_flag(StatusFlag::WriteProtected, true);
                    }
                    self.session.frequency = self.session.frequency.min(Config::MAX_FREQUENCY);
                    InitState::Ready
                }
                Err(err) if err.is_bus() => return Err(err),
                Err(_) => InitState::Unknown,
            },
            InitState::Ready | InitState::Unknown => state,
        };

        Ok(next)
    }

    /// Log a response that does not lead anywhere. Bus errors propagate.
    fn unexpected(
        &mut self,
        cmd: u8,
        result: Result<crate::transaction::Response, ErrorFor<Spi, Cs>>,
    ) -> Result<InitState, ErrorFor<Spi, Cs>> {
        match result {
            Ok(response) => {
                error!(
                    "Wrong response from CMD{}: 0x{:02X}",
                    commands::index(cmd),
                    response.r1.bits()
                );
                Ok(InitState::Unknown)
            }
            Err(err) if err.is_bus() => Err(err),
            Err(err) => {
                error!("CMD{} failed: {}", commands::index(cmd), err.name());
                Ok(InitState::Unknown)
            }
        }
    }

    /// Idle card with the 3.3V window in its OCR.
    fn ocr_supports_3v3(&mut self) -> Result<bool, ErrorFor<Spi, Cs>> {
        match self.read_ocr() {
            Ok((r1, ocr)) => {
                let supported = r1 == R1Response::IN_IDLE_STATE && (ocr & args::OCR_3V3) != 0;
                if !supported {
                    error!("READ_OCR failed: 0x{:08X}", ocr);
                }
                Ok(supported)
            }
            Err(err) if err.is_bus() => Err(err),
            Err(_) => Ok(false),
        }
    }

    /// Repeat an operating condition command until the card reports ready or
    /// the polling budget runs out. Unless `through_errors` is set, anything
    /// but an idle response ends the loop early.
    fn poll_op_cond(
        &mut self,
        cmd: u8,
        arg: u32,
        through_errors: bool,
    ) -> Result<bool, ErrorFor<Spi, Cs>> {
        let deadline = self.deadline(Config::OP_COND_TIMEOUT_MS);
        loop {
            match self.command_transaction(cmd, arg) {
                Ok(response) if response.r1 == R1Response::READY_STATE => return Ok(true),
                Ok(response) if response.r1 == R1Response::IN_IDLE_STATE => {}
                Err(err) if err.is_bus() => return Err(err),
                _ if through_errors => {}
                _ => return Ok(false),
            }

            if self.expired(&deadline) {
                error!("CMD{} timed out waiting for ready", commands::index(cmd));
                return Ok(false);
            }
        }
    }

    /// Read the card specific data register.
    pub(crate) fn read_csd(&mut self) -> Result<Csd, ErrorFor<Spi, Cs>> {
        retry(Config::MAX_ATTEMPTS, |_| {
            if let Err(err) = self.select() {
                return Attempt::Fatal(err);
            }
            if let Err(err) = self.send_command(commands::CMD9, 0x0000_0000) {
                return self.abort(err);
            }

            let mut csd_data: CsdData = Default::default();
            let result = self.read_data(&mut csd_data);
            match (result, self.deselect()) {
                (Ok(()), Ok(())) => Attempt::Done(Csd::from(csd_data)),
                (Err(err), _) | (Ok(()), Err(err)) => err.into_attempt(),
            }
        })
    }
}
