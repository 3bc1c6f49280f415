//! Host Controller Abstraction
//!
//! The protocol engine drives the card through this capability trait, so
//! the same command sequencing works on an SDHCI-style controller with a
//! hardware interrupt register (`emmc`) and on the streaming PIO
//! controller that has none (`sdhost`). Backends that lack a capability
//! model it: the PIO backend synthesizes interrupt words from its status
//! and FIFO-level registers.

use bitflags::bitflags;

use crate::SdError;
use crate::cmd::CmdWord;

pub mod emmc;
pub mod sdhost;

#[cfg(test)]
pub mod mock;

bitflags! {
    /// Interrupt word shared across backends, in the layout of the
    /// SDHCI-style interrupt register. Bits 16..27 are error causes and
    /// bit 15 is the error summary.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Interrupt: u32 {
        /// Command completed
        const CMD_DONE = 1 << 0;
        /// Data transfer completed
        const TRANSFER_DONE = 1 << 1;
        /// Block-gap event
        const BLOCK_GAP = 1 << 2;
        /// DMA interrupt
        const DMA = 1 << 3;
        /// Write buffer ready for one block
        const WRITE_READY = 1 << 4;
        /// Read buffer holds one block
        const READ_READY = 1 << 5;
        /// Card inserted
        const CARD_INSERT = 1 << 6;
        /// Card removed
        const CARD_REMOVE = 1 << 7;
        /// Card interrupt (SDIO / eMMC)
        const CARD = 1 << 8;
        /// Error summary, set alongside any error cause
        const ERR = 1 << 15;
        /// Command timeout
        const CMD_TIMEOUT = 1 << 16;
        /// Command CRC error
        const CMD_CRC = 1 << 17;
        /// Command end-bit error
        const CMD_END_BIT = 1 << 18;
        /// Response index mismatch
        const CMD_INDEX = 1 << 19;
        /// Data timeout
        const DATA_TIMEOUT = 1 << 20;
        /// Data CRC error
        const DATA_CRC = 1 << 21;
        /// Data end-bit error
        const DATA_END_BIT = 1 << 22;
        /// Current-limit error
        const CURRENT_LIMIT = 1 << 23;
        /// Auto-CMD12 error
        const AUTO_CMD12 = 1 << 24;
        /// ADMA error
        const ADMA = 1 << 25;
        /// Tuning error
        const TUNING = 1 << 26;
        /// FIFO over/underrun, synthesized by the PIO backend
        const FIFO_ERROR = 1 << 27;
    }
}

impl Interrupt {
    /// All error-cause bits (excluding the summary bit).
    pub const ERRORS: Interrupt = Interrupt::from_bits_retain(0x0fff_0000);
}

bitflags! {
    /// Snapshot of the controller status lines.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HostStatus: u32 {
        /// Command line busy
        const CMD_INHIBIT = 1 << 0;
        /// Data lines busy
        const DAT_INHIBIT = 1 << 1;
        /// Card detected in the slot
        const CARD_INSERTED = 1 << 16;
        /// DAT0 level
        const DAT0 = 1 << 20;
        /// DAT1 level
        const DAT1 = 1 << 21;
        /// DAT2 level
        const DAT2 = 1 << 22;
        /// DAT3 level
        const DAT3 = 1 << 23;
    }
}

impl HostStatus {
    /// Level of DAT3..DAT0 as a 4-bit value.
    pub fn dat_level(self) -> u32 {
        (self.bits() >> 20) & 0xf
    }
}

/// Subcircuit selector for partial controller resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    /// Command circuit only.
    Command,
    /// Data circuit only.
    Data,
    /// Complete controller reset.
    All,
}

/// Card bus width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    /// eMMC only.
    Eight,
}

/// Capability contract between the protocol engine and a host controller.
///
/// All waits are bounded; `wait_interrupt` with a zero timeout returns the
/// current interrupt snapshot without waiting.
pub trait SdHost {
    /// Program block size and block count for the next data command.
    fn set_block_size_count(&mut self, block_size: u32, blocks: u32);

    /// Load the 32-bit command argument.
    fn set_argument(&mut self, arg: u32);

    /// Write the command word, starting command execution.
    fn trigger_command(&mut self, cmd: CmdWord);

    /// Wait until any bit of `mask` is pending or `timeout_us` elapses,
    /// then return the full interrupt snapshot. Callers are expected to
    /// include [`Interrupt::ERR`] in the mask so errors cut waits short.
    fn wait_interrupt(&mut self, mask: Interrupt, timeout_us: u32) -> Interrupt;

    /// Acknowledge (clear) the given interrupt bits.
    fn clear_interrupt(&mut self, mask: Interrupt);

    /// Read response word `index` (0..=3). Word 0 holds bits 39:8 of a
    /// 48-bit response; 136-bit responses span all four words.
    fn read_response(&mut self, index: usize) -> u32;

    /// Pop one word from the read FIFO.
    fn read_fifo_word(&mut self) -> u32;

    /// Push one word into the write FIFO.
    fn write_fifo_word(&mut self, word: u32);

    /// Switch the card clock to the highest frequency not above
    /// `target_hz`, observing the clock-stop/clock-start sequence the
    /// controller requires.
    fn set_clock(&mut self, target_hz: u32) -> Result<(), SdError>;

    /// Reset part or all of the controller.
    fn reset_subcircuit(&mut self, target: ResetTarget) -> Result<(), SdError>;

    /// Snapshot of the status lines (inhibit flags, card presence,
    /// DAT levels).
    fn read_status_bits(&mut self) -> HostStatus;

    /// Cut bus power to the card.
    fn power_off(&mut self);

    /// Select the bus width after the card has been switched.
    fn set_bus_width(&mut self, width: BusWidth);

    /// Suppress card-interrupt delivery (around ACMD42/bus-width changes).
    fn mask_card_interrupt(&mut self);

    /// Re-enable card-interrupt delivery.
    fn unmask_card_interrupt(&mut self);

    /// True if the controller can switch signalling to 1.8V.
    fn supports_voltage_switch(&self) -> bool;

    /// Perform the electrical half of the 1.8V switch: stop the clock,
    /// check DAT3..0 are low, flip the voltage select, restart the clock
    /// and check DAT3..0 are high.
    fn switch_signal_voltage_1v8(&mut self) -> Result<(), SdError>;
}
