//! sdmmc - Bare-metal SD/eMMC host controller driver
//!
//! Protocol engine and host backends for the SD/MMC controllers found in
//! BCM283x-class SoCs: the SDHCI-style EMMC interface and the streaming
//! SDHOST interface. The engine handles card bring-up and block I/O over
//! a small host capability trait; clocks, delays and power come from a
//! [`Platform`] implementation supplied by the board support code.

#![no_std]

pub mod card;
pub mod cmd;
pub mod host;
pub mod platform;

pub use card::{SdCard, SdConfig, SdVersion};
pub use host::emmc::EmmcHost;
pub use host::sdhost::SdhostDevice;
pub use host::{BusWidth, HostStatus, Interrupt, ResetTarget, SdHost};
pub use platform::{ClockDomain, Platform, Timeout};

/// Driver error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// Command index is reserved in the active command space
    ReservedCommand,
    /// Transfer length does not fit the 16-bit block counter
    InvalidBlockCount,
    /// I/O offset is not aligned to the block size
    Misaligned,
    /// No card present in the slot
    NoCard,
    /// Card was removed while in use
    CardRemoved,
    /// Platform refused to power the interface on
    PowerFailed,
    /// Clock configuration failed
    ClockFailed,
    /// Controller reset failed
    ResetFailed,
    /// Controller hardware version not supported
    UnsupportedVersion,
    /// Wait expired without a completion or error flag
    Timeout,
    /// Command timeout flagged by the controller
    CommandTimeout,
    /// Command CRC error
    CommandCrc,
    /// Command end bit error
    CommandEndBit,
    /// Command index mismatch in the response
    CommandIndex,
    /// Data timeout
    DataTimeout,
    /// Data CRC error
    DataCrc,
    /// Data end bit error
    DataEndBit,
    /// FIFO overrun or underrun
    Fifo,
    /// Card reported an error in a status response
    CardStatus,
    /// Card is in a state that does not allow the operation
    CardState,
    /// Card does not match any usable profile
    UnusableCard,
    /// SDIO cards are detected but not supported
    SdioUnsupported,
    /// SD configuration register could not be read
    ScrReadFailed,
    /// 1.8V signalling switch failed
    VoltageSwitch,
    /// Generic error
    GenericError,
}
