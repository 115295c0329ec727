//! Bus scope and command engine.
//!
//! A [`Transaction`] brackets one public card operation: it configures the
//! bus on creation and, when dropped, releases chip select and ends the bus
//! transaction, whatever path the operation took to get there.

use crate::{
    bus::{Clock, Deadline, SpiBus, SpiSettings},
    config::SdMmcSpiConfig,
    consts::{
        args,
        commands::{self, ACMD_FLAG},
        tokens,
    },
    crc::{crc16, crc7},
    response::{DataResponse, R1Response},
    retry::{retry, Attempt},
    session::CardSession,
    Error, ErrorFor,
};

use core::{cell::RefMut, marker::PhantomData};
use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};
#[cfg(feature = "log")]
use log::{trace, warn};

/// Command response: R1 token and, for CMD8/CMD58/CMD13, the trailing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Response {
    pub r1: R1Response,
    pub payload: Option<u32>,
}

/// Bus held for one card operation.
pub(crate) struct Transaction<'a, Spi, Cs, Clk, Config>
where
    Spi: SpiBus,
    Cs: OutputSwitch,
{
    spi: RefMut<'a, Spi>,
    cs: RefMut<'a, Cs>,
    clock: RefMut<'a, Clk>,
    pub(crate) session: RefMut<'a, CardSession>,
    config: PhantomData<Config>,
}

impl<'a, Spi, Cs, Clk, Config> Drop for Transaction<'a, Spi, Cs, Clk, Config>
where
    Spi: SpiBus,
    Cs: OutputSwitch,
{
    fn drop(&mut self) {
        self.cs.off().ok();
        self.spi.end_transaction();
    }
}

impl<'a, Spi, Cs, Clk, Config> Transaction<'a, Spi, Cs, Clk, Config>
where
    Spi: SpiBus,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdMmcSpiConfig,
{
    /// Begin a bus transaction with `settings`.
    pub(crate) fn begin(
        mut spi: RefMut<'a, Spi>,
        cs: RefMut<'a, Cs>,
        clock: RefMut<'a, Clk>,
        session: RefMut<'a, CardSession>,
        settings: SpiSettings,
    ) -> Result<Self, ErrorFor<Spi, Cs>> {
        spi.begin_transaction(&settings).map_err(Error::Transport)?;
        Ok(Transaction {
            spi,
            cs,
            clock,
            session,
            config: PhantomData::<Config>,
        })
    }

    /// Send one byte and receive one byte.
    pub(crate) fn transfer(&mut self, data: u8) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.spi
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub(crate) fn receive(&mut self) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.transfer(tokens::RECEIVE)
    }

    /// Send a byte to the SD card.
    pub(crate) fn send(&mut self, data: u8) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card in one bulk transfer.
    pub(crate) fn receive_slice(&mut self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        data.fill(tokens::RECEIVE);
        self.spi.transfer(data).map_err(Error::Transport)?;
        Ok(())
    }

    /// Send a slice to the SD card.
    pub(crate) fn send_slice(&mut self, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Receive a big endian u16.
    pub(crate) fn receive_u16(&mut self) -> Result<u16, ErrorFor<Spi, Cs>> {
        let mut buf = [0u8; 2];
        self.receive_slice(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Receive a big endian u32.
    pub(crate) fn receive_u32(&mut self) -> Result<u32, ErrorFor<Spi, Cs>> {
        let mut buf = [0u8; 4];
        self.receive_slice(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Send a big endian u16.
    pub(crate) fn send_u16(&mut self, data: u16) -> Result<(), ErrorFor<Spi, Cs>> {
        self.send_slice(&data.to_be_bytes())
    }

    /// Release chip select.
    pub(crate) fn deselect(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.off().map_err(Error::SelectError)
    }

    /// Assert chip select and wait for the card to leave busy.
    pub(crate) fn select(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.on().map_err(Error::SelectError)?;
        match self.wait_not_busy(Config::SELECT_TIMEOUT_MS, Error::SelectTimeout) {
            Err(Error::SelectTimeout) => {
                warn!("SD select timed out");
                self.deselect()?;
                Err(Error::SelectTimeout)
            }
            result => result,
        }
    }

    /// Clock `count` idle bytes with chip select released.
    pub(crate) fn clock_idle(&mut self, count: usize) -> Result<(), ErrorFor<Spi, Cs>> {
        self.deselect()?;
        for _ in 0..count {
            self.send(tokens::RECEIVE)?;
        }

        Ok(())
    }

    /// Sleep for `ms` milliseconds.
    pub(crate) fn delay_ms(&mut self, ms: u32) {
        self.clock.delay_ms(ms);
    }

    /// Start a busy-poll deadline.
    pub(crate) fn deadline(&mut self, timeout_ms: u32) -> Deadline {
        Deadline::start(&mut *self.clock, timeout_ms)
    }

    /// Check a busy-poll deadline.
    pub(crate) fn expired(&mut self, deadline: &Deadline) -> bool {
        deadline.expired(&mut *self.clock)
    }

    /// Poll until the card drives a non-zero byte, or fail with `error`.
    pub(crate) fn wait_not_busy(
        &mut self,
        timeout_ms: u32,
        error: ErrorFor<Spi, Cs>,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let deadline = self.deadline(timeout_ms);
        loop {
            if self.receive()? != 0x00 {
                return Ok(());
            }
            if self.expired(&deadline) {
                return Err(error);
            }
        }
    }

    /// Frame and send a command, retrying transient failures.
    ///
    /// The card must already be selected. Only ready (0) and idle (1) tokens
    /// come back as `Ok`.
    pub(crate) fn send_command(
        &mut self,
        cmd: u8,
        arg: u32,
    ) -> Result<Response, ErrorFor<Spi, Cs>> {
        let result = retry(Config::MAX_ATTEMPTS, |attempt| {
            if attempt > 1 {
                warn!(
                    "Retrying CMD{}, attempt: {}",
                    commands::index(cmd),
                    attempt
                );
                if let Err(err) = self.backoff() {
                    return Self::silent(err).into_attempt();
                }
            }
            self.command_attempt(cmd, arg)
        });

        if let Err(Error::TokenTimeout) = result {
            warn!("No response to CMD{}, card needs init", commands::index(cmd));
            self.session.mark_uninitialized();
        }

        result
    }

    /// Select, run a single command and deselect.
    pub(crate) fn command_transaction(
        &mut self,
        cmd: u8,
        arg: u32,
    ) -> Result<Response, ErrorFor<Spi, Cs>> {
        self.select()?;
        let result = self.send_command(cmd, arg);
        self.deselect()?;

        result
    }

    /// A card that stays busy once selected has stopped answering as well.
    fn silent(err: ErrorFor<Spi, Cs>) -> ErrorFor<Spi, Cs> {
        match err {
            Error::SelectTimeout => Error::TokenTimeout,
            err => err,
        }
    }

    fn backoff(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.deselect()?;
        self.delay_ms(Config::RETRY_BACKOFF_MS);
        self.select()
    }

    fn command_attempt(&mut self, cmd: u8, arg: u32) -> Attempt<Response, ErrorFor<Spi, Cs>> {
        if (cmd & ACMD_FLAG) != 0 {
            let prefix = self.send_command(commands::CMD55, 0x0000_0000);
            if let Err(err) = self.deselect() {
                return Attempt::Fatal(err);
            }
            if let Err(err) = prefix {
                return Attempt::Fatal(err);
            }
            if let Err(err) = self.select() {
                return Attempt::Fatal(Self::silent(err));
            }
        }

        let mut frame = [
            cmd & !ACMD_FLAG,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
            tokens::RECEIVE,
        ];
        let crc_index = 5;

        frame[crc_index] = if self.session.crc_enabled
            || cmd == commands::CMD0
            || cmd == commands::CMD8
        {
            (crc7(&frame[..crc_index]) << 1) | 0x01
        } else {
            tokens::CRC7_PLACEHOLDER
        };

        let len = if cmd == commands::CMD12 { 7 } else { 6 };
        trace!(
            "CMD{} arg: 0x{:08X} crc: 0x{:02X}",
            commands::index(cmd),
            arg,
            frame[crc_index]
        );

        if let Err(err) = self.send_slice(&frame[..len]) {
            return Attempt::Fatal(err);
        }

        let r1 = match self.read_r1() {
            Ok(r1) => r1,
            Err(err) => return Attempt::Fatal(err),
        };

        if r1 == R1Response::NO_RESPONSE {
            return Attempt::Retry(Error::TokenTimeout);
        }
        if r1.command_crc_error() {
            return Attempt::Retry(Error::CommandCrcError(r1.bits()));
        }
        if !r1.is_ok() {
            warn!(
                "CMD{} error token: 0x{:02X}",
                commands::index(cmd),
                r1.bits()
            );
            return Attempt::Fatal(Error::CardError(r1.bits()));
        }

        let payload = match cmd {
            commands::CMD8 | commands::CMD58 => self.receive_u32().map(Some),
            commands::CMD13 => self.receive().map(|b| Some(u32::from(b))),
            _ => Ok(None),
        };

        match payload {
            Ok(payload) => Attempt::Done(Response { r1, payload }),
            Err(err) => Attempt::Fatal(err),
        }
    }

    /// Sample up to `R1_POLL_BYTES` bytes for a token with the start bit clear.
    fn read_r1(&mut self) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        for _ in 0..Config::R1_POLL_BYTES {
            let r1 = R1Response::from(self.receive()?);

            if r1.is_valid() {
                return Ok(r1);
            }
        }

        Ok(R1Response::NO_RESPONSE)
    }

    /// Read a data block: start token, payload, CRC16.
    pub(crate) fn read_data(&mut self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let deadline = self.deadline(Config::DATA_TOKEN_TIMEOUT_MS);
        let token = loop {
            let token = self.receive()?;
            if token != tokens::NO_RESPONSE {
                break token;
            }
            if self.expired(&deadline) {
                return Err(Error::TokenTimeout);
            }
        };

        if token != tokens::DATA_START_BLOCK {
            warn!("Data error token: 0x{:02X}", token);
            return Err(Error::DataToken(token));
        }

        self.receive_slice(data)?;

        let card_crc = self.receive_u16()?;
        if self.session.crc_enabled {
            let host_crc = crc16(data);
            if card_crc != host_crc {
                return Err(Error::CrcError(card_crc, host_crc));
            }
        }

        Ok(())
    }

    /// Write a data block after the card leaves busy and return its data
    /// response.
    pub(crate) fn write_data(
        &mut self,
        token: u8,
        data: &[u8],
    ) -> Result<DataResponse, ErrorFor<Spi, Cs>> {
        let crc = if self.session.crc_enabled {
            crc16(data)
        } else {
            tokens::CRC16_PLACEHOLDER
        };

        self.wait_not_busy(Config::WRITE_READY_TIMEOUT_MS, Error::TokenTimeout)?;

        self.send(token)?;
        self.send_slice(data)?;
        self.send_u16(crc)?;

        Ok(DataResponse::from(self.receive()?))
    }

    /// Query the card status register, which must be error free.
    pub(crate) fn send_status(&mut self) -> Result<(), ErrorFor<Spi, Cs>> {
        let response = self.command_transaction(commands::CMD13, 0x0000_0000)?;
        let status = response.payload.unwrap_or(0) as u8;

        if status != 0 {
            Err(Error::CardError(status))
        } else if response.r1 != R1Response::READY_STATE {
            Err(Error::CardError(response.r1.bits()))
        } else {
            Ok(())
        }
    }

    /// Read the operating conditions register.
    pub(crate) fn read_ocr(&mut self) -> Result<(R1Response, u32), ErrorFor<Spi, Cs>> {
        let response = self.command_transaction(commands::CMD58, 0x0000_0000)?;
        Ok((response.r1, response.payload.unwrap_or(0)))
    }

    /// Ask the card for its interface condition, returning the echoed
    /// voltage and check pattern.
    pub(crate) fn send_if_cond(&mut self) -> Result<(R1Response, u32), ErrorFor<Spi, Cs>> {
        let response = self.command_transaction(commands::CMD8, args::IF_COND_CHECK)?;
        Ok((
            response.r1,
            response.payload.unwrap_or(0) & args::IF_COND_ECHO_MASK,
        ))
    }
}
