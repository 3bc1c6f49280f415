//! SDHOST Controller Registers
//!
//! Register layout of the streaming PIO controller. There is no interrupt
//! status register: command completion is signalled in the command
//! register itself, errors in the small host status register, and data
//! flow is observable only through the debug (EDM) register's FIFO level
//! and state machine fields.

// ============================================================================
// Register Offsets
// ============================================================================

/// Command and flags; writing with the new-command flag starts execution
pub const SDCMD: u32 = 0x00;

/// Command argument
pub const SDARG: u32 = 0x04;

/// Timeout in card clock cycles
pub const SDTOUT: u32 = 0x08;

/// Clock divider, holds (divisor - 2)
pub const SDCDIV: u32 = 0x0c;

/// Response word 0 (bits 31:0)
pub const SDRSP0: u32 = 0x10;

/// Response word 1 (bits 63:32)
pub const SDRSP1: u32 = 0x14;

/// Response word 2 (bits 95:64)
pub const SDRSP2: u32 = 0x18;

/// Response word 3 (bits 127:96)
pub const SDRSP3: u32 = 0x1c;

/// Host status, error and interrupt bits are write 1 to clear
pub const SDHSTS: u32 = 0x20;

/// Card power
pub const SDVDD: u32 = 0x30;

/// Debug: FIFO thresholds, FIFO level and state machine
pub const SDEDM: u32 = 0x34;

/// Host configuration: interrupt enables and bus width
pub const SDHCFG: u32 = 0x38;

/// Block size in bytes
pub const SDHBCT: u32 = 0x3c;

/// Data FIFO, word access
pub const SDDATA: u32 = 0x40;

/// Block count
pub const SDHBLC: u32 = 0x50;

// ============================================================================
// SDCMD Register
// ============================================================================

/// Command pending; cleared by the controller on completion
pub const SDCMD_NEW_FLAG: u32 = 0x8000;

/// Command failed; details in SDHSTS
pub const SDCMD_FAIL_FLAG: u32 = 0x4000;

/// Wait for the busy signal after the response (R1b)
pub const SDCMD_BUSYWAIT: u32 = 0x800;

/// No response expected
pub const SDCMD_NO_RESPONSE: u32 = 0x400;

/// 136-bit response
pub const SDCMD_LONG_RESPONSE: u32 = 0x200;

/// Command writes data to the card
pub const SDCMD_WRITE_CMD: u32 = 0x80;

/// Command reads data from the card
pub const SDCMD_READ_CMD: u32 = 0x40;

/// Command index mask
pub const SDCMD_CMD_MASK: u32 = 0x3f;

// ============================================================================
// SDCDIV Register
// ============================================================================

/// Largest divider value
pub const SDCDIV_MAX_CDIV: u32 = 0x7ff;

// ============================================================================
// SDHSTS Register
// ============================================================================

/// Busy-wait finished
pub const SDHSTS_BUSY_IRPT: u32 = 0x400;

/// Block transfer finished
pub const SDHSTS_BLOCK_IRPT: u32 = 0x200;

/// Card (SDIO) interrupt
pub const SDHSTS_SDIO_IRPT: u32 = 0x100;

/// Read/write transfer timeout
pub const SDHSTS_REW_TIME_OUT: u32 = 0x80;

/// Command timeout
pub const SDHSTS_CMD_TIME_OUT: u32 = 0x40;

/// Data CRC16 error
pub const SDHSTS_CRC16_ERROR: u32 = 0x20;

/// Response CRC7 error
pub const SDHSTS_CRC7_ERROR: u32 = 0x10;

/// FIFO over/underrun
pub const SDHSTS_FIFO_ERROR: u32 = 0x08;

/// FIFO holds data
pub const SDHSTS_DATA_FLAG: u32 = 0x01;

/// Errors affecting the data path
pub const SDHSTS_TRANSFER_ERROR_MASK: u32 =
    SDHSTS_CRC7_ERROR | SDHSTS_CRC16_ERROR | SDHSTS_REW_TIME_OUT | SDHSTS_FIFO_ERROR;

/// All error bits
pub const SDHSTS_ERROR_MASK: u32 = SDHSTS_CMD_TIME_OUT | SDHSTS_TRANSFER_ERROR_MASK;

/// All write-1-to-clear bits
pub const SDHSTS_CLEAR_MASK: u32 = 0x7f8;

// ============================================================================
// SDHCFG Register
// ============================================================================

/// Enable the busy interrupt
pub const SDHCFG_BUSY_IRPT_EN: u32 = 1 << 10;

/// Enable the block interrupt
pub const SDHCFG_BLOCK_IRPT_EN: u32 = 1 << 8;

/// Enable the card (SDIO) interrupt
pub const SDHCFG_SDIO_IRPT_EN: u32 = 1 << 5;

/// Enable the data interrupt
pub const SDHCFG_DATA_IRPT_EN: u32 = 1 << 4;

/// Interrupt sources an in-flight command can raise
pub const SDHCFG_IRPT_ENABLES: u32 =
    SDHCFG_BUSY_IRPT_EN | SDHCFG_BLOCK_IRPT_EN | SDHCFG_DATA_IRPT_EN;

/// Force the identification clock divisor in data mode
pub const SDHCFG_SLOW_CARD: u32 = 1 << 3;

/// 4-bit bus on the card side
pub const SDHCFG_WIDE_EXT_BUS: u32 = 1 << 2;

/// 4-bit bus on the controller side
pub const SDHCFG_WIDE_INT_BUS: u32 = 1 << 1;

// ============================================================================
// SDEDM Register
// ============================================================================

/// Force the state machine back to data mode
pub const SDEDM_FORCE_DATA_MODE: u32 = 1 << 19;

/// Write FIFO threshold field shift
pub const SDEDM_WRITE_THRESHOLD_SHIFT: u32 = 9;

/// Read FIFO threshold field shift
pub const SDEDM_READ_THRESHOLD_SHIFT: u32 = 14;

/// Threshold field mask
pub const SDEDM_THRESHOLD_MASK: u32 = 0x1f;

/// State machine field mask
pub const SDEDM_FSM_MASK: u32 = 0xf;

/// Idle, identification clock
pub const SDEDM_FSM_IDENTMODE: u32 = 0x0;

/// Idle, data clock
pub const SDEDM_FSM_DATAMODE: u32 = 0x1;

/// Read transfer active
pub const SDEDM_FSM_READDATA: u32 = 0x2;

/// Write transfer active
pub const SDEDM_FSM_WRITEDATA: u32 = 0x3;

/// Waiting between read blocks
pub const SDEDM_FSM_READWAIT: u32 = 0x4;

/// Checking read CRC
pub const SDEDM_FSM_READCRC: u32 = 0x5;

/// Sending write CRC
pub const SDEDM_FSM_WRITECRC: u32 = 0x6;

/// Waiting between write blocks
pub const SDEDM_FSM_WRITEWAIT1: u32 = 0x7;

/// Starting a write block
pub const SDEDM_FSM_WRITESTART1: u32 = 0xa;

/// Starting a write block, second phase
pub const SDEDM_FSM_WRITESTART2: u32 = 0xb;

/// FIFO depth in words
pub const SDEDM_FIFO_WORDS: u32 = 16;

// ============================================================================
// Helpers
// ============================================================================

/// Number of words currently in the FIFO.
#[inline]
pub const fn edm_fifo_level(edm: u32) -> u32 {
    (edm >> 4) & 0x1f
}

/// Current state machine state.
#[inline]
pub const fn edm_fsm(edm: u32) -> u32 {
    edm & SDEDM_FSM_MASK
}
