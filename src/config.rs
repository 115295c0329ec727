/// Represents config for [`SdMmcSpi`](crate::SdMmcSpi).
///
/// All timeouts are wall-clock milliseconds measured with the driver
/// [`Clock`](crate::Clock).
pub trait SdMmcSpiConfig {
    /// Attempts for a command, a single-sector transfer or a multi-sector
    /// transfer before giving up.
    const MAX_ATTEMPTS: usize;
    /// Pause between two attempts of a command.
    const RETRY_BACKOFF_MS: u32;
    /// Max time to wait for the card after asserting chip select.
    const SELECT_TIMEOUT_MS: u32;
    /// Max time to wait for the data start token of a read.
    const DATA_TOKEN_TIMEOUT_MS: u32;
    /// Max time to wait for the card to leave busy before a data block.
    const WRITE_READY_TIMEOUT_MS: u32;
    /// Max time for each operating condition polling loop.
    const OP_COND_TIMEOUT_MS: u32;
    /// Bytes sampled while waiting for a command response.
    const R1_POLL_BYTES: usize;
    /// Padding bytes clocked with chip select released before reset.
    const INIT_CLOCK_BYTES: usize;
    /// Bus frequency used during initialization.
    const INIT_FREQUENCY: u32;
    /// Ceiling of the bus frequency after initialization.
    const MAX_FREQUENCY: u32;
}

/// Default implementation of [`SdMmcSpiConfig`](crate::SdMmcSpiConfig).
pub struct DefaultSdMmcSpiConfig;

impl SdMmcSpiConfig for DefaultSdMmcSpiConfig {
    const MAX_ATTEMPTS: usize = 3;
    const RETRY_BACKOFF_MS: u32 = 100;
    const SELECT_TIMEOUT_MS: u32 = 300;
    const DATA_TOKEN_TIMEOUT_MS: u32 = 500;
    const WRITE_READY_TIMEOUT_MS: u32 = 500;
    const OP_COND_TIMEOUT_MS: u32 = 1000;
    const R1_POLL_BYTES: usize = 9;
    const INIT_CLOCK_BYTES: usize = 20;
    const INIT_FREQUENCY: u32 = 400_000;
    const MAX_FREQUENCY: u32 = 25_000_000;
}
