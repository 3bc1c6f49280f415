//! SD/MMC Command Encoding
//!
//! Commands are stored pre-encoded in the layout of the controller's
//! command register: the 6-bit index in the top byte, response type and
//! data-transfer flags below. Two fixed 64-entry tables cover the standard
//! command space and the application command space (commands that must be
//! preceded by APP_CMD). Entries the card specification leaves undefined
//! are reserved and must never reach hardware.

// ============================================================================
// Command Register Bitfields
// ============================================================================

/// Command type - Suspend
pub const CMD_TYPE_SUSPEND: u32 = 1 << 22;

/// Command type - Resume
pub const CMD_TYPE_RESUME: u32 = 2 << 22;

/// Command type - Abort (CMD12, CMD52)
pub const CMD_TYPE_ABORT: u32 = 3 << 22;

/// Command type mask
pub const CMD_TYPE_MASK: u32 = 3 << 22;

/// Command involves a data transfer
pub const CMD_ISDATA: u32 = 1 << 21;

/// Check the response index against the command index
pub const CMD_IXCHK_EN: u32 = 1 << 20;

/// Check the response CRC
pub const CMD_CRCCHK_EN: u32 = 1 << 19;

/// No response
pub const CMD_RSPNS_NONE: u32 = 0;

/// 136-bit response (R2 with CRC, R3/R4 without)
pub const CMD_RSPNS_136: u32 = 1 << 16;

/// 48-bit response (R1, R5, R6, R7)
pub const CMD_RSPNS_48: u32 = 2 << 16;

/// 48-bit response with busy signal (R1b, R5b)
pub const CMD_RSPNS_48B: u32 = 3 << 16;

/// Response type mask
pub const CMD_RSPNS_MASK: u32 = 3 << 16;

/// Multi-block transfer
pub const CMD_MULTI_BLOCK: u32 = 1 << 5;

/// Data direction: card to host (read)
pub const CMD_DAT_DIR_CH: u32 = 1 << 4;

/// Issue CMD12 automatically after the last block
pub const CMD_AUTO_CMD12: u32 = 1 << 2;

/// Enable the block counter for multi-block transfers
pub const CMD_BLKCNT_EN: u32 = 1 << 1;

// ============================================================================
// Command Indices
// ============================================================================

/// GO_IDLE_STATE - reset the card to idle state
pub const GO_IDLE_STATE: u8 = 0;

/// SEND_OP_COND - eMMC operating-conditions negotiation (replaces ACMD41)
pub const SEND_OP_COND: u8 = 1;

/// ALL_SEND_CID - ask the card for its 128-bit identification
pub const ALL_SEND_CID: u8 = 2;

/// SEND_RELATIVE_ADDR - ask the card to publish a relative address
pub const SEND_RELATIVE_ADDR: u8 = 3;

/// IO_SET_OP_COND - SDIO probe; only SDIO cards respond
pub const IO_SET_OP_COND: u8 = 5;

/// SWITCH_FUNC - check or switch card function (high-speed mode)
pub const SWITCH_FUNC: u8 = 6;

/// SELECT_CARD - toggle the card between stand-by and transfer state
pub const SELECT_CARD: u8 = 7;

/// SEND_IF_COND - voltage check, distinguishes version 2.00+ cards
pub const SEND_IF_COND: u8 = 8;

/// SEND_CSD - ask the card for its card-specific data register
pub const SEND_CSD: u8 = 9;

/// SEND_CID - ask the addressed card for its identification
pub const SEND_CID: u8 = 10;

/// VOLTAGE_SWITCH - begin the 1.8V signal-voltage switch
pub const VOLTAGE_SWITCH: u8 = 11;

/// STOP_TRANSMISSION - abort an open-ended transfer
pub const STOP_TRANSMISSION: u8 = 12;

/// SEND_STATUS - ask the addressed card for its status register
pub const SEND_STATUS: u8 = 13;

/// SET_BLOCKLEN - set the block length for standard-capacity cards
pub const SET_BLOCKLEN: u8 = 16;

/// READ_SINGLE_BLOCK
pub const READ_SINGLE_BLOCK: u8 = 17;

/// READ_MULTIPLE_BLOCK
pub const READ_MULTIPLE_BLOCK: u8 = 18;

/// WRITE_BLOCK
pub const WRITE_BLOCK: u8 = 24;

/// WRITE_MULTIPLE_BLOCK
pub const WRITE_MULTIPLE_BLOCK: u8 = 25;

/// APP_CMD - the next command is an application command
pub const APP_CMD: u8 = 55;

/// SET_BUS_WIDTH (application command)
pub const SET_BUS_WIDTH: u8 = 6;

/// SD_STATUS (application command)
pub const SD_STATUS: u8 = 13;

/// SD_SEND_OP_COND (application command) - SD operating-conditions loop
pub const SD_SEND_OP_COND: u8 = 41;

/// SEND_SCR (application command) - read the SD configuration register
pub const SEND_SCR: u8 = 51;

// ============================================================================
// Command Descriptor
// ============================================================================

/// Wire length of a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespLen {
    /// No response expected.
    None,
    /// 48-bit response in one word.
    Bits48,
    /// 48-bit response, card signals busy on DAT0 afterwards.
    Bits48Busy,
    /// 136-bit response in four words.
    Bits136,
}

/// Protocol response classes mapped onto the register encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespType {
    None,
    R1,
    R1b,
    R2,
    R3,
    R4,
    R5,
    R5b,
    R6,
    R7,
}

/// A command pre-encoded in the command-register layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdWord(u32);

impl CmdWord {
    /// Start a descriptor for the given 6-bit command index.
    pub const fn new(index: u8) -> Self {
        Self(((index as u32) & 0x3f) << 24)
    }

    /// Attach the response class.
    pub const fn resp(self, r: RespType) -> Self {
        let bits = match r {
            RespType::None => CMD_RSPNS_NONE,
            RespType::R1 | RespType::R5 | RespType::R6 | RespType::R7 => {
                CMD_RSPNS_48 | CMD_CRCCHK_EN
            }
            RespType::R1b | RespType::R5b => CMD_RSPNS_48B | CMD_CRCCHK_EN,
            RespType::R2 => CMD_RSPNS_136 | CMD_CRCCHK_EN,
            RespType::R3 => CMD_RSPNS_48,
            RespType::R4 => CMD_RSPNS_136,
        };
        Self(self.0 | bits)
    }

    /// Card-to-host data phase.
    pub const fn data_read(self) -> Self {
        Self(self.0 | CMD_ISDATA | CMD_DAT_DIR_CH)
    }

    /// Host-to-card data phase.
    pub const fn data_write(self) -> Self {
        Self(self.0 | CMD_ISDATA)
    }

    /// Data phase with direction decided at issue time (CMD56).
    pub const fn data(self) -> Self {
        Self(self.0 | CMD_ISDATA)
    }

    /// Multi-block transfer with block counter and automatic CMD12.
    pub const fn multi_block(self) -> Self {
        Self(self.0 | CMD_MULTI_BLOCK | CMD_BLKCNT_EN | CMD_AUTO_CMD12)
    }

    /// Mark as an abort-type command (CMD12).
    pub const fn abort(self) -> Self {
        Self(self.0 | CMD_TYPE_ABORT)
    }

    /// Raw value for the command register.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The 6-bit command index.
    pub const fn index(self) -> u8 {
        ((self.0 >> 24) & 0x3f) as u8
    }

    /// Response length encoded in the descriptor.
    pub const fn resp_len(self) -> RespLen {
        match self.0 & CMD_RSPNS_MASK {
            CMD_RSPNS_136 => RespLen::Bits136,
            CMD_RSPNS_48 => RespLen::Bits48,
            CMD_RSPNS_48B => RespLen::Bits48Busy,
            _ => RespLen::None,
        }
    }

    /// True if the command carries a data phase.
    pub const fn is_data(self) -> bool {
        self.0 & CMD_ISDATA != 0
    }

    /// True for card-to-host transfers.
    pub const fn is_read(self) -> bool {
        self.0 & CMD_DAT_DIR_CH != 0
    }

    /// True for multi-block transfers.
    pub const fn is_multi_block(self) -> bool {
        self.0 & CMD_MULTI_BLOCK != 0
    }

    /// True for abort-type commands.
    pub const fn is_abort(self) -> bool {
        self.0 & CMD_TYPE_MASK == CMD_TYPE_ABORT
    }

    /// True if the card holds DAT0 low until it finishes (R1b/R5b).
    pub const fn expects_busy(self) -> bool {
        self.0 & CMD_RSPNS_MASK == CMD_RSPNS_48B
    }
}

/// Command selector used by the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdCmd {
    /// Standard command space.
    Std(u8),
    /// Application command space (issued after APP_CMD).
    App(u8),
}

// ============================================================================
// Command Tables
// ============================================================================

const R: Option<CmdWord> = None; // reserved

const SD_COMMANDS: [Option<CmdWord>; 64] = [
    Some(CmdWord::new(0)),
    R, // CMD1 is SEND_OP_COND in eMMC mode only
    Some(CmdWord::new(2).resp(RespType::R2)),
    Some(CmdWord::new(3).resp(RespType::R6)),
    Some(CmdWord::new(4)),
    Some(CmdWord::new(5).resp(RespType::R4)),
    Some(CmdWord::new(6).resp(RespType::R1).data_read()),
    Some(CmdWord::new(7).resp(RespType::R1b)),
    Some(CmdWord::new(8).resp(RespType::R7)),
    Some(CmdWord::new(9).resp(RespType::R2)),
    Some(CmdWord::new(10).resp(RespType::R2)),
    Some(CmdWord::new(11).resp(RespType::R1)),
    Some(CmdWord::new(12).resp(RespType::R1b).abort()),
    Some(CmdWord::new(13).resp(RespType::R1)),
    R,
    Some(CmdWord::new(15)),
    Some(CmdWord::new(16).resp(RespType::R1)),
    Some(CmdWord::new(17).resp(RespType::R1).data_read()),
    Some(CmdWord::new(18).resp(RespType::R1).data_read().multi_block()),
    Some(CmdWord::new(19).resp(RespType::R1).data_read()),
    Some(CmdWord::new(20).resp(RespType::R1b)),
    R,
    R,
    Some(CmdWord::new(23).resp(RespType::R1)),
    Some(CmdWord::new(24).resp(RespType::R1).data_write()),
    Some(CmdWord::new(25).resp(RespType::R1).data_write().multi_block()),
    R,
    Some(CmdWord::new(27).resp(RespType::R1).data_write()),
    Some(CmdWord::new(28).resp(RespType::R1b)),
    Some(CmdWord::new(29).resp(RespType::R1b)),
    Some(CmdWord::new(30).resp(RespType::R1).data_read()),
    R,
    Some(CmdWord::new(32).resp(RespType::R1)),
    Some(CmdWord::new(33).resp(RespType::R1)),
    R,
    R,
    R,
    R,
    Some(CmdWord::new(38).resp(RespType::R1b)),
    R,
    R,
    R,
    R, // CMD42 LOCK_UNLOCK is not supported
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    Some(CmdWord::new(55).resp(RespType::R1)),
    Some(CmdWord::new(56).resp(RespType::R1).data()),
    R,
    R,
    R,
    R,
    R,
    R,
    R,
];

const SD_ACOMMANDS: [Option<CmdWord>; 64] = [
    R,
    R,
    R,
    R,
    R,
    R,
    Some(CmdWord::new(6).resp(RespType::R1)),
    R,
    R,
    R,
    R,
    R,
    R,
    Some(CmdWord::new(13).resp(RespType::R1)),
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    Some(CmdWord::new(22).resp(RespType::R1).data_read()),
    Some(CmdWord::new(23).resp(RespType::R1)),
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    Some(CmdWord::new(41).resp(RespType::R3)),
    Some(CmdWord::new(42).resp(RespType::R1)),
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    Some(CmdWord::new(51).resp(RespType::R1).data_read()),
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
    R,
];

/// eMMC SEND_OP_COND, the CMD1 negotiation used instead of ACMD41.
const MMC_SEND_OP_COND: CmdWord = CmdWord::new(1).resp(RespType::R3);

/// eMMC SWITCH, an EXT_CSD byte write with no data phase.
const MMC_SWITCH: CmdWord = CmdWord::new(6).resp(RespType::R1);

/// Look up the descriptor for a command index.
///
/// Returns `None` for indices the card specification reserves; callers
/// must treat that as a failure without touching hardware. In eMMC mode
/// CMD1 becomes SEND_OP_COND and CMD6 the EXT_CSD SWITCH command.
pub fn lookup(index: u8, app_cmd: bool, emmc: bool) -> Option<CmdWord> {
    if index > 63 {
        return None;
    }
    if app_cmd {
        return SD_ACOMMANDS[index as usize];
    }
    if emmc {
        match index {
            SEND_OP_COND => return Some(MMC_SEND_OP_COND),
            SWITCH_FUNC => return Some(MMC_SWITCH),
            _ => {}
        }
    }
    SD_COMMANDS[index as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_indices_are_none() {
        assert!(lookup(1, false, false).is_none());
        assert!(lookup(14, false, false).is_none());
        assert!(lookup(21, false, false).is_none());
        assert!(lookup(42, false, false).is_none());
        assert!(lookup(63, false, false).is_none());
        assert!(lookup(0, true, false).is_none());
        assert!(lookup(41, false, false).is_none());
        assert!(lookup(55, true, false).is_none());
        assert!(lookup(64, false, false).is_none());
    }

    #[test]
    fn read_multiple_encoding() {
        let cmd = lookup(READ_MULTIPLE_BLOCK, false, false).unwrap();
        assert_eq!(cmd.raw(), 0x122a_0036);
        assert!(cmd.is_data() && cmd.is_read() && cmd.is_multi_block());
        assert_eq!(cmd.resp_len(), RespLen::Bits48);
    }

    #[test]
    fn stop_transmission_is_abort_with_busy() {
        let cmd = lookup(STOP_TRANSMISSION, false, false).unwrap();
        assert!(cmd.is_abort());
        assert!(cmd.expects_busy());
        assert!(!cmd.is_data());
        assert_eq!(cmd.index(), 12);
    }

    #[test]
    fn acmd41_is_r3_without_crc_check() {
        let cmd = lookup(SD_SEND_OP_COND, true, false).unwrap();
        assert_eq!(cmd.resp_len(), RespLen::Bits48);
        assert_eq!(cmd.raw() & CMD_CRCCHK_EN, 0);
    }

    #[test]
    fn send_scr_reads_data() {
        let cmd = lookup(SEND_SCR, true, false).unwrap();
        assert!(cmd.is_data() && cmd.is_read());
        assert!(!cmd.is_multi_block());
    }

    #[test]
    fn emmc_mode_overrides() {
        let cmd1 = lookup(SEND_OP_COND, false, true).unwrap();
        assert_eq!(cmd1.index(), 1);
        assert_eq!(cmd1.resp_len(), RespLen::Bits48);
        assert_eq!(cmd1.raw() & CMD_CRCCHK_EN, 0);

        // SWITCH loses its data phase in eMMC mode
        let cmd6 = lookup(SWITCH_FUNC, false, true).unwrap();
        assert!(!cmd6.is_data());
        let sd6 = lookup(SWITCH_FUNC, false, false).unwrap();
        assert!(sd6.is_data() && sd6.is_read());
    }
}
