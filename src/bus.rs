//! Interfaces the driver needs from the board: the SPI bus with
//! transaction bracketing and a millisecond clock. Chip select comes from
//! [`switch_hal::OutputSwitch`].

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::spi::{Mode, MODE_0};

/// Clock and mode held for the duration of one card operation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SpiSettings {
    /// Bus frequency in Hz.
    pub frequency: u32,
    /// SPI mode, always mode 0 for SD cards.
    pub mode: Mode,
}

impl core::fmt::Debug for SpiSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpiSettings")
            .field("frequency", &self.frequency)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for SpiSettings {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "SpiSettings {{ frequency: {} }}", self.frequency)
    }
}

impl SpiSettings {
    /// MSB first, mode 0 at the given frequency.
    pub const fn new(frequency: u32) -> Self {
        SpiSettings {
            frequency,
            mode: MODE_0,
        }
    }
}

/// SPI bus shared with the card.
///
/// Single and bulk byte transfers come from [`Transfer`]; this trait adds the
/// bracketing that configures the bus for one card operation.
pub trait SpiBus: Transfer<u8> {
    /// Configure the bus and take it for one operation.
    fn begin_transaction(&mut self, settings: &SpiSettings) -> Result<(), Self::Error>;

    /// Give the bus back. Called exactly once for every successful
    /// [`begin_transaction`](SpiBus::begin_transaction).
    fn end_transaction(&mut self);
}

/// Monotonic millisecond clock with a blocking delay.
pub trait Clock: DelayMs<u32> {
    /// Milliseconds since an arbitrary origin, wrapping on overflow.
    fn now_ms(&mut self) -> u32;
}

/// Busy-poll deadline on a [`Clock`].
pub(crate) struct Deadline {
    start: u32,
    timeout_ms: u32,
}

impl Deadline {
    pub(crate) fn start<C: Clock>(clock: &mut C, timeout_ms: u32) -> Self {
        Deadline {
            start: clock.now_ms(),
            timeout_ms,
        }
    }

    pub(crate) fn expired<C: Clock>(&self, clock: &mut C) -> bool {
        clock.now_ms().wrapping_sub(self.start) >= self.timeout_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_debug_shows_frequency() {
        let settings = SpiSettings::new(400_000);
        assert!(settings.mode == MODE_0);
        assert_eq!(
            format!("{:?}", settings),
            "SpiSettings { frequency: 400000, .. }"
        );
    }
}
