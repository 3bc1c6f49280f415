//! EMMC Controller Registers
//!
//! SDHCI-style register layout of the EMMC interface, 32-bit access only.
//! The interrupt, mask and enable registers all share the bit layout of
//! [`Interrupt`](crate::host::Interrupt).

// ============================================================================
// Register Offsets
// ============================================================================

/// Argument for ACMD23 (SET_WR_BLK_ERASE_COUNT)
pub const EMMC_ARG2: u32 = 0x00;

/// Block size (bits 9:0) and block count (bits 31:16)
pub const EMMC_BLKSIZECNT: u32 = 0x04;

/// Command argument
pub const EMMC_ARG1: u32 = 0x08;

/// Command and transfer mode; writing starts the command
pub const EMMC_CMDTM: u32 = 0x0c;

/// Response bits 31:0 (39:8 of a 48-bit response)
pub const EMMC_RESP0: u32 = 0x10;

/// Response bits 63:32
pub const EMMC_RESP1: u32 = 0x14;

/// Response bits 95:64
pub const EMMC_RESP2: u32 = 0x18;

/// Response bits 119:96
pub const EMMC_RESP3: u32 = 0x1c;

/// Data FIFO, word access
pub const EMMC_DATA: u32 = 0x20;

/// Controller status lines
pub const EMMC_STATUS: u32 = 0x24;

/// Host configuration: bus width, power, signalling
pub const EMMC_CONTROL0: u32 = 0x28;

/// Clock and reset control
pub const EMMC_CONTROL1: u32 = 0x2c;

/// Interrupt status, write 1 to clear
pub const EMMC_INTERRUPT: u32 = 0x30;

/// Interrupt status mask
pub const EMMC_IRPT_MASK: u32 = 0x34;

/// Interrupt signal (IRQ line) enable
pub const EMMC_IRPT_EN: u32 = 0x38;

/// Auto-CMD12 error status and extended control
pub const EMMC_CONTROL2: u32 = 0x3c;

/// Slot interrupt status and controller version
pub const EMMC_SLOTISR_VER: u32 = 0xfc;

// ============================================================================
// STATUS Register
// ============================================================================

/// Command line in use
pub const STATUS_CMD_INHIBIT: u32 = 1 << 0;

/// Data lines in use
pub const STATUS_DAT_INHIBIT: u32 = 1 << 1;

/// DAT line active
pub const STATUS_DAT_ACTIVE: u32 = 1 << 2;

/// Card inserted
pub const STATUS_CARD_INSERTED: u32 = 1 << 16;

/// DAT3..DAT0 level field shift
pub const STATUS_DAT_LEVEL_SHIFT: u32 = 20;

/// DAT3..DAT0 level field mask
pub const STATUS_DAT_LEVEL_MASK: u32 = 0xf;

// ============================================================================
// CONTROL0 Register
// ============================================================================

/// 4-bit bus width
pub const CONTROL0_DWIDTH_4: u32 = 1 << 1;

/// 8-bit bus width (eMMC)
pub const CONTROL0_DWIDTH_8: u32 = 1 << 5;

/// SD bus power; doubles as the 1.8V signal enable on this controller
pub const CONTROL0_BUS_POWER: u32 = 1 << 8;

// ============================================================================
// CONTROL1 Register
// ============================================================================

/// Internal clock enable
pub const CONTROL1_CLK_INTLEN: u32 = 1 << 0;

/// Internal clock stable (read only)
pub const CONTROL1_CLK_STABLE: u32 = 1 << 1;

/// SD clock enable
pub const CONTROL1_CLK_EN: u32 = 1 << 2;

/// Clock divider and frequency-select field mask (bits 15:6)
pub const CONTROL1_CLK_DIV_MASK: u32 = 0x3ff << 6;

/// Data timeout exponent field shift
pub const CONTROL1_TOUNIT_SHIFT: u32 = 16;

/// Data timeout exponent field mask (in place)
pub const CONTROL1_TOUNIT_MASK: u32 = 0xf << 16;

/// Data timeout exponent: TMCLK * 2^24
pub const CONTROL1_TOUNIT_MAX: u32 = 11 << 16;

/// Reset the complete host circuit
pub const CONTROL1_SRST_HC: u32 = 1 << 24;

/// Reset the command circuit
pub const CONTROL1_SRST_CMD: u32 = 1 << 25;

/// Reset the data circuit
pub const CONTROL1_SRST_DATA: u32 = 1 << 26;

/// All reset bits
pub const CONTROL1_SRST_ALL: u32 = 7 << 24;

// ============================================================================
// SLOTISR_VER Register
// ============================================================================

/// Host controller specification version field shift
pub const SLOTISR_VER_SDVERSION_SHIFT: u32 = 16;

/// Host controller specification version field mask
pub const SLOTISR_VER_SDVERSION_MASK: u32 = 0xff;

// ============================================================================
// Helpers
// ============================================================================

/// Compose the BLKSIZECNT register value.
#[inline]
pub const fn make_blksizecnt(block_size: u32, blocks: u32) -> u32 {
    (block_size & 0x3ff) | (blocks << 16)
}

/// Place a 10-bit divider field into the CONTROL1 layout: low eight bits
/// at 15:8, the two high bits at 7:6.
#[inline]
pub const fn make_clk_div(field: u32) -> u32 {
    ((field & 0xff) << 8) | (((field >> 8) & 0x3) << 6)
}
