//! Single and multiple sector transfers on a ready card.

use crate::{
    bus::{Clock, SpiBus},
    config::SdMmcSpiConfig,
    consts::{commands, tokens, BLOCK_SIZE},
    response::DataResponse,
    retry::{retry, Attempt},
    session::CardType,
    transaction::Transaction,
    Error, ErrorFor,
};

use switch_hal::OutputSwitch;

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};
#[cfg(feature = "log")]
use log::{debug, warn};

impl<'a, Spi, Cs, Clk, Config> Transaction<'a, Spi, Cs, Clk, Config>
where
    Spi: SpiBus,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdMmcSpiConfig,
{
    /// Release chip select and give up on this attempt.
    pub(crate) fn abort<T>(&mut self, err: ErrorFor<Spi, Cs>) -> Attempt<T, ErrorFor<Spi, Cs>> {
        self.deselect().ok();
        Attempt::Fatal(err)
    }

    fn address(&self, sector: u32) -> Result<u32, ErrorFor<Spi, Cs>> {
        self.session.address(sector).ok_or(Error::InvalidArgument)
    }

    /// Read one sector into `buf`.
    pub(crate) fn read_sector(
        &mut self,
        buf: &mut [u8],
        sector: u32,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let address = self.address(sector)?;

        retry(Config::MAX_ATTEMPTS, |attempt| {
            if attempt > 1 {
                warn!("Retrying read of sector {}, attempt: {}", sector, attempt);
            }
            if let Err(err) = self.select() {
                return Attempt::Fatal(err);
            }
            if let Err(err) = self.send_command(commands::CMD17, address) {
                return self.abort(err);
            }

            let result = self.read_data(buf);
            match (result, self.deselect()) {
                (Ok(()), Ok(())) => Attempt::Done(()),
                (Err(err), _) | (Ok(()), Err(err)) => err.into_attempt(),
            }
        })
    }

    /// Read consecutive sectors into `buf`, continuing from the first sector
    /// not yet received when an attempt fails.
    pub(crate) fn read_sectors(
        &mut self,
        buf: &mut [u8],
        sector: u32,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let count = buf.len() / BLOCK_SIZE;
        let mut done = 0;

        retry(Config::MAX_ATTEMPTS, |attempt| {
            if attempt > 1 {
                warn!(
                    "Resuming multiple read at sector {}, attempt: {}",
                    sector as usize + done,
                    attempt
                );
            }
            let address = match self.address(sector + done as u32) {
                Ok(address) => address,
                Err(err) => return Attempt::Fatal(err),
            };
            if let Err(err) = self.select() {
                return Attempt::Fatal(err);
            }
            if let Err(err) = self.send_command(commands::CMD18, address) {
                return self.abort(err);
            }

            let mut failure = None;
            for chunk in buf[done * BLOCK_SIZE..].chunks_mut(BLOCK_SIZE) {
                match self.read_data(chunk) {
                    Ok(()) => done += 1,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            if let Err(err) = self.send_command(commands::CMD12, 0x0000_0000) {
                return self.abort(err);
            }
            if let Err(err) = self.deselect() {
                return Attempt::Fatal(err);
            }

            match failure {
                Some(err) => err.into_attempt(),
                None => match self.send_status() {
                    Ok(()) => Attempt::Done(()),
                    Err(err) => Attempt::Fatal(err),
                },
            }
        })?;

        debug!("Read {} sectors from {}", count, sector);
        Ok(())
    }

    /// Write one sector from `buf`.
    pub(crate) fn write_sector(
        &mut self,
        buf: &[u8],
        sector: u32,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let address = self.address(sector)?;

        retry(Config::MAX_ATTEMPTS, |attempt| {
            if attempt > 1 {
                warn!("Retrying write of sector {}, attempt: {}", sector, attempt);
            }
            if let Err(err) = self.select() {
                return Attempt::Fatal(err);
            }
            if let Err(err) = self.send_command(commands::CMD24, address) {
                return self.abort(err);
            }

            let response = match self.write_data(tokens::DATA_START_BLOCK, buf) {
                Ok(response) => response,
                Err(err) => {
                    self.deselect().ok();
                    return err.into_attempt();
                }
            };
            if let Err(err) = self.deselect() {
                return Attempt::Fatal(err);
            }

            match response {
                DataResponse::CrcError => Attempt::Retry(Error::CrcRejected),
                DataResponse::WriteError => {
                    Attempt::Fatal(Error::WriteError(tokens::DATA_RES_WRITE_ERROR))
                }
                DataResponse::Accepted | DataResponse::Unknown(_) => match self.send_status() {
                    Ok(()) => Attempt::Done(()),
                    Err(err) => Attempt::Fatal(err),
                },
            }
        })
    }

    /// Write consecutive sectors from `buf`.
    ///
    /// When the card stops the transfer early it is asked how many blocks it
    /// programmed, and the next attempt continues from the first unwritten
    /// sector.
    pub(crate) fn write_sectors(
        &mut self,
        buf: &[u8],
        sector: u32,
    ) -> Result<(), ErrorFor<Spi, Cs>> {
        let count = buf.len() / BLOCK_SIZE;
        let mut written = 0;

        retry(Config::MAX_ATTEMPTS, |attempt| {
            let remaining = count - written;
            if attempt > 1 {
                warn!(
                    "Resuming multiple write at sector {}, remaining: {}, attempt: {}",
                    sector as usize + written,
                    remaining,
                    attempt
                );
            }
            let address = match self.address(sector + written as u32) {
                Ok(address) => address,
                Err(err) => return Attempt::Fatal(err),
            };

            if self.session.card_type != CardType::MMC {
                if let Err(err) = self.command_transaction(commands::ACMD23, remaining as u32) {
                    return Attempt::Fatal(err);
                }
            }

            if let Err(err) = self.select() {
                return Attempt::Fatal(err);
            }
            if let Err(err) = self.send_command(commands::CMD25, address) {
                return self.abort(err);
            }

            let mut accepted = 0;
            let mut last = DataResponse::Accepted;
            for chunk in buf[written * BLOCK_SIZE..].chunks(BLOCK_SIZE) {
                match self.write_data(tokens::WRITE_MULTIPLE, chunk) {
                    Ok(DataResponse::Accepted) => accepted += 1,
                    Ok(response) => {
                        last = response;
                        break;
                    }
                    Err(err) => return self.abort(err),
                }
            }

            let ready = self.wait_not_busy(Config::WRITE_READY_TIMEOUT_MS, Error::TokenTimeout);
            if let Err(err) = ready {
                return self.abort(err);
            }

            if accepted == remaining {
                if let Err(err) = self.send(tokens::STOP_TRAN) {
                    return self.abort(err);
                }
                if let Err(err) = self.deselect() {
                    return Attempt::Fatal(err);
                }
                return match self.send_status() {
                    Ok(()) => Attempt::Done(()),
                    Err(err) => Attempt::Fatal(err),
                };
            }

            if let Err(err) = self.send_command(commands::CMD12, 0x0000_0000) {
                return self.abort(err);
            }
            if let Err(err) = self.deselect() {
                return Attempt::Fatal(err);
            }

            match last {
                DataResponse::CrcError => {
                    let confirmed = self.written_blocks().min(remaining);
                    debug!(
                        "Multiple write stopped after {} of {} sectors, card confirmed {}",
                        accepted, remaining, confirmed
                    );
                    written += confirmed;
                    Attempt::Retry(Error::CrcRejected)
                }
                DataResponse::WriteError => {
                    Attempt::Fatal(Error::WriteError(tokens::DATA_RES_WRITE_ERROR))
                }
                DataResponse::Accepted => {
                    Attempt::Fatal(Error::WriteError(tokens::DATA_RES_ACCEPTED))
                }
                DataResponse::Unknown(raw) => Attempt::Fatal(Error::WriteError(raw)),
            }
        })?;

        debug!("Wrote {} sectors at {}", count, sector);
        Ok(())
    }

    /// Number of blocks the card programmed during the last multiple write.
    /// Zero when the card cannot tell.
    fn written_blocks(&mut self) -> usize {
        if self.session.card_type == CardType::MMC || self.select().is_err() {
            return 0;
        }

        let mut data = [0u8; 4];
        let result = match self.send_command(commands::ACMD22, 0x0000_0000) {
            Ok(_) => self.read_data(&mut data),
            Err(err) => Err(err),
        };
        self.deselect().ok();

        match result {
            Ok(()) => u32::from_be_bytes(data) as usize,
            Err(_) => 0,
        }
    }
}
