//! SD/MMC Protocol Engine
//!
//! Card bring-up, command sequencing and block I/O on top of a host
//! backend. The engine owns the controller and card session state; the
//! backend only moves words and interrupt bits. One instance drives one
//! card.

use log::{debug, error, info, warn};

use crate::SdError;
use crate::cmd::{self, CmdWord, RespLen, SdCmd};
use crate::host::{BusWidth, HostStatus, Interrupt, ResetTarget, SdHost};
use crate::platform::{Platform, Timeout};

/// Block size for SD cards (always 512 bytes)
const BLOCK_SIZE: u32 = 512;

/// Identification clock frequency (400 kHz)
const INIT_CLOCK_HZ: u32 = 400_000;

/// Default speed clock frequency (25 MHz)
const DEFAULT_CLOCK_HZ: u32 = 25_000_000;

/// High speed clock frequency (50 MHz)
const HIGH_SPEED_CLOCK_HZ: u32 = 50_000_000;

/// Default timeout for commands (microseconds)
const CMD_TIMEOUT_US: u32 = 500_000;

/// Timeout for the SDIO probe; SDIO cards are only detected, never driven
const SDIO_PROBE_TIMEOUT_US: u32 = 10_000;

/// Timeout for reading the SD configuration register (microseconds)
const SCR_TIMEOUT_US: u32 = 1_000_000;

/// Timeout for function-switch commands (microseconds)
const SWITCH_TIMEOUT_US: u32 = 100_000;

/// Timeout for data transfers (microseconds)
const DATA_TIMEOUT_US: u32 = 5_000_000;

/// Wait for a card in the slot (milliseconds)
const CARD_PRESENT_TIMEOUT_MS: u32 = 500;

/// Delay between operating-conditions polls while the card is busy
const OP_COND_RETRY_DELAY_US: u32 = 500_000;

/// Give up on a card that stays busy past this many polls
const OP_COND_RETRIES: u32 = 10;

/// Attempts for a data command before the card is given up
const DATA_RETRIES: u32 = 3;

/// Bring-up attempts when the configuration-register read keeps failing
const BRING_UP_ATTEMPTS: u32 = 3;

/// Voltage window bits of the operating-conditions argument
const OCR_VOLTAGE_WINDOW: u32 = 0x00ff_8000;

/// Host capacity support / card capacity status
const OCR_CARD_CAPACITY: u32 = 1 << 30;

/// Maximum-performance (XPC) request for SDXC cards
const OCR_XPC: u32 = 1 << 28;

/// 1.8V switching request/acknowledge
const OCR_S18: u32 = 1 << 24;

/// Power-up complete; clear means the card is still busy
const OCR_BUSY: u32 = 1 << 31;

/// Interface-condition check pattern: 2.7-3.6V, pattern 0xaa
const IF_COND_3V3_CHECK: u32 = 0x1aa;

/// Function switch: query function group 1
const SWITCH_CHECK_HIGH_SPEED: u32 = 0x00ff_fff0;

/// Function switch: commit high-speed in function group 1
const SWITCH_SET_HIGH_SPEED: u32 = 0x80ff_fff1;

/// EXT_CSD byte write: BUS_WIDTH (183) to 4-bit
const MMC_SWITCH_BUS_WIDTH_4: u32 = 0x03b7_0100;

/// EXT_CSD byte write: BUS_WIDTH (183) to 8-bit
const MMC_SWITCH_BUS_WIDTH_8: u32 = 0x03b7_0200;

/// Card state machine states carried in R1 responses (bits 12:9)
const STATE_STAND_BY: u32 = 3;
const STATE_TRANSFER: u32 = 4;
const STATE_SENDING_DATA: u32 = 5;

/// Card specification version derived from the configuration register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    Unknown,
    V1,
    V1_10,
    V2,
    V3,
    V4,
}

impl SdVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdVersion::Unknown => "unknown",
            SdVersion::V1 => "1.0 or 1.01",
            SdVersion::V1_10 => "1.10",
            SdVersion::V2 => "2.00",
            SdVersion::V3 => "3.0x",
            SdVersion::V4 => "4.xx",
        }
    }
}

/// Construction-time options of the protocol engine.
#[derive(Debug, Clone, Copy)]
pub struct SdConfig {
    /// Switch to a 4-bit bus when the card supports it.
    pub four_bit: bool,
    /// Negotiate 50 MHz high-speed mode when the card supports it.
    pub high_speed: bool,
    /// Request 1.8V signalling on capable hosts.
    pub use_1v8: bool,
    /// Request maximum performance (XPC) from SDXC cards.
    pub sdxc_max_performance: bool,
    /// Leave the card interrupt unmasked and service it.
    pub card_interrupt: bool,
    /// Drive an embedded MMC device instead of an SD card.
    pub emmc: bool,
    /// Use an 8-bit bus for an embedded MMC device.
    pub emmc_8bit: bool,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            four_bit: true,
            high_speed: true,
            use_1v8: false,
            sdxc_max_performance: false,
            card_interrupt: false,
            emmc: false,
            emmc_8bit: false,
        }
    }
}

/// Active data phase of a command.
enum DataBuf<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Decode the capacity in bytes from a card-specific-data response.
/// The response holds bits 127:8 of the register, so every field sits
/// 8 bits lower than its specification position. Unknown layouts give 0.
fn decode_csd_capacity(resp: &[u32; 4]) -> u64 {
    match (resp[3] >> 22) & 0x3 {
        0 => {
            let read_bl_len = (resp[2] >> 8) & 0xf;
            let c_size = ((resp[2] & 0x3) << 10) | (resp[1] >> 22);
            let c_size_mult = (resp[1] >> 7) & 0x7;
            (c_size as u64 + 1) << (c_size_mult + 2 + read_bl_len)
        }
        1 => {
            let c_size = (resp[1] >> 8) & 0x3f_ffff;
            // units of 512 KiB
            (c_size as u64 + 1) << 19
        }
        _ => 0,
    }
}

/// Pick the error for a failed wait. A snapshot without any cause bits
/// means the deadline ran out with nothing flagged.
fn classify_failure(snapshot: Interrupt) -> SdError {
    if !snapshot.intersects(Interrupt::ERRORS) {
        return SdError::Timeout;
    }
    if snapshot.contains(Interrupt::CMD_TIMEOUT) {
        SdError::CommandTimeout
    } else if snapshot.contains(Interrupt::CMD_CRC) {
        SdError::CommandCrc
    } else if snapshot.contains(Interrupt::CMD_END_BIT) {
        SdError::CommandEndBit
    } else if snapshot.contains(Interrupt::CMD_INDEX) {
        SdError::CommandIndex
    } else if snapshot.contains(Interrupt::DATA_TIMEOUT) {
        SdError::DataTimeout
    } else if snapshot.contains(Interrupt::DATA_CRC) {
        SdError::DataCrc
    } else if snapshot.contains(Interrupt::DATA_END_BIT) {
        SdError::DataEndBit
    } else if snapshot.contains(Interrupt::FIFO_ERROR) {
        SdError::Fifo
    } else {
        SdError::GenericError
    }
}

/// SD/MMC card behind a host backend.
pub struct SdCard<'p, H: SdHost, P: Platform> {
    host: H,
    platform: &'p P,
    config: SdConfig,

    // controller session
    block_size: u32,
    blocks_to_transfer: u32,
    last_response: [u32; 4],
    last_error: Interrupt,
    last_interrupt: Interrupt,
    card_removed: bool,

    // card session
    device_id: [u32; 4],
    ocr: u32,
    supports_sdhc: bool,
    supports_18v: bool,
    failed_voltage_switch: bool,
    version: SdVersion,
    bus_widths: u32,
    capacity_bytes: u64,
    rca: Option<u16>,
    offset: u64,
}

impl<'p, H: SdHost, P: Platform> SdCard<'p, H, P> {
    pub fn new(host: H, platform: &'p P, config: SdConfig) -> Self {
        Self {
            host,
            platform,
            config,
            block_size: BLOCK_SIZE,
            blocks_to_transfer: 0,
            last_response: [0; 4],
            last_error: Interrupt::empty(),
            last_interrupt: Interrupt::empty(),
            card_removed: false,
            device_id: [0; 4],
            ocr: 0,
            supports_sdhc: false,
            supports_18v: false,
            failed_voltage_switch: false,
            version: SdVersion::Unknown,
            bus_widths: 0,
            capacity_bytes: 0,
            rca: None,
            offset: 0,
        }
    }

    /// The host backend, e.g. to delegate interrupt servicing.
    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// The 128-bit card identification from bring-up, as four response
    /// words.
    pub fn get_card_id(&self) -> [u32; 4] {
        self.device_id
    }

    /// Capacity decoded from the card-specific data; 0 when unknown.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Card specification version, known after bring-up.
    pub fn card_version(&self) -> SdVersion {
        self.version
    }

    /// Error-cause bits captured by the last failed wait.
    pub fn last_error_bits(&self) -> Interrupt {
        self.last_error
    }

    /// Full interrupt snapshot captured by the last failed wait.
    pub fn last_interrupt_bits(&self) -> Interrupt {
        self.last_interrupt
    }

    /// Power the card bus back down.
    pub fn power_off(&mut self) {
        self.host.power_off();
    }

    /// Power up and bring up the card: identification, addressing,
    /// selection and bus negotiation. Must complete before any I/O.
    pub fn initialize(&mut self) -> Result<(), SdError> {
        if !self.platform.power_on() {
            error!("SD: card did not power on successfully");
            return Err(SdError::PowerFailed);
        }

        self.platform.peripheral_entry();
        let result = self.card_init();
        self.platform.peripheral_exit();

        if result.is_ok() {
            info!(
                "SD: found a valid version {} card, capacity {} MiB",
                self.version.as_str(),
                self.capacity_bytes >> 20
            );
        }
        result
    }

    /// Store the byte offset used by the next read or write.
    pub fn seek(&mut self, offset: u64) -> u64 {
        self.offset = offset;
        offset
    }

    /// Read whole blocks at the current offset. The offset must be
    /// block-aligned and the buffer a multiple of the block size.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SdError> {
        let block = self.current_block()?;
        let len = buf.len();

        self.platform.activity_led(true);
        self.platform.peripheral_entry();
        let result = self.transfer_at(block, &mut DataBuf::Read(buf));
        self.platform.peripheral_exit();
        self.platform.activity_led(false);

        result.map(|()| len)
    }

    /// Write whole blocks at the current offset. The offset must be
    /// block-aligned and the buffer a multiple of the block size.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, SdError> {
        let block = self.current_block()?;
        let len = buf.len();

        self.platform.activity_led(true);
        self.platform.peripheral_entry();
        let result = self.transfer_at(block, &mut DataBuf::Write(buf));
        self.platform.peripheral_exit();
        self.platform.activity_led(false);

        result.map(|()| len)
    }

    fn current_block(&self) -> Result<u32, SdError> {
        if self.offset % BLOCK_SIZE as u64 != 0 {
            debug!("SD: offset {} is not block aligned", self.offset);
            return Err(SdError::Misaligned);
        }
        u32::try_from(self.offset / BLOCK_SIZE as u64).map_err(|_| {
            warn!("SD: offset {} out of range", self.offset);
            SdError::GenericError
        })
    }

    fn transfer_at(&mut self, block: u32, data: &mut DataBuf<'_>) -> Result<(), SdError> {
        self.ensure_data_mode()?;
        self.do_data_command(block, data)
    }

    // ------------------------------------------------------------------
    // Command issue path
    // ------------------------------------------------------------------

    fn rca_arg(&self) -> u32 {
        self.rca.map(|rca| (rca as u32) << 16).unwrap_or(0)
    }

    fn issue(&mut self, command: SdCmd, arg: u32) -> Result<(), SdError> {
        self.issue_timeout(command, arg, CMD_TIMEOUT_US)
    }

    fn issue_timeout(&mut self, command: SdCmd, arg: u32, timeout_us: u32) -> Result<(), SdError> {
        self.issue_inner(command, arg, timeout_us, &mut DataBuf::None)
    }

    fn issue_data(
        &mut self,
        command: SdCmd,
        arg: u32,
        timeout_us: u32,
        data: &mut DataBuf<'_>,
    ) -> Result<(), SdError> {
        self.issue_inner(command, arg, timeout_us, data)
    }

    fn issue_inner(
        &mut self,
        command: SdCmd,
        arg: u32,
        timeout_us: u32,
        data: &mut DataBuf<'_>,
    ) -> Result<(), SdError> {
        // Reserved indices fail before the controller is touched at all.
        let (index, app) = match command {
            SdCmd::Std(index) => (index, false),
            SdCmd::App(index) => (index, true),
        };
        let Some(word) = cmd::lookup(index, app, self.config.emmc) else {
            warn!(
                "SD: attempting to issue an unknown {}CMD{}",
                if app { "A" } else { "" },
                index
            );
            return Err(SdError::ReservedCommand);
        };

        self.service_events();
        if self.card_removed {
            debug!("SD: no card inserted");
            return Err(SdError::CardRemoved);
        }

        if app {
            let Some(app_word) = cmd::lookup(cmd::APP_CMD, false, self.config.emmc) else {
                return Err(SdError::ReservedCommand);
            };
            self.issue_raw(app_word, self.rca_arg(), CMD_TIMEOUT_US, &mut DataBuf::None)?;
        }

        self.issue_raw(word, arg, timeout_us, data)
    }

    fn issue_raw(
        &mut self,
        word: CmdWord,
        arg: u32,
        timeout_us: u32,
        data: &mut DataBuf<'_>,
    ) -> Result<(), SdError> {
        debug!("SD: issuing CMD{} (arg {:#x})", word.index(), arg);

        // The block counter is 16 bits wide.
        if self.blocks_to_transfer > 0xffff {
            warn!(
                "SD: {} blocks do not fit the block counter",
                self.blocks_to_transfer
            );
            return Err(SdError::InvalidBlockCount);
        }
        let expected = if word.is_data() {
            (self.block_size * self.blocks_to_transfer) as usize
        } else {
            0
        };
        let matched = match data {
            DataBuf::None => expected == 0,
            DataBuf::Read(buf) => buf.len() == expected,
            DataBuf::Write(buf) => buf.len() == expected,
        };
        if !matched {
            warn!("SD: buffer does not match the transfer size");
            return Err(SdError::InvalidBlockCount);
        }

        self.host
            .set_block_size_count(self.block_size, self.blocks_to_transfer);
        self.host.set_argument(arg);
        self.host.trigger_command(word);

        let snapshot = self
            .host
            .wait_interrupt(Interrupt::CMD_DONE | Interrupt::ERR, timeout_us);
        self.host
            .clear_interrupt(Interrupt::CMD_DONE | Interrupt::ERRORS);
        if !snapshot.contains(Interrupt::CMD_DONE) || snapshot.intersects(Interrupt::ERRORS) {
            self.last_error = snapshot & Interrupt::ERRORS;
            self.last_interrupt = snapshot;
            let err = classify_failure(snapshot);
            debug!(
                "SD: CMD{} failed ({:?}, interrupt {:#x})",
                word.index(),
                err,
                snapshot.bits()
            );
            return Err(err);
        }

        match word.resp_len() {
            RespLen::None => {}
            RespLen::Bits48 | RespLen::Bits48Busy => {
                self.last_response[0] = self.host.read_response(0);
            }
            RespLen::Bits136 => {
                for i in 0..4 {
                    self.last_response[i] = self.host.read_response(i);
                }
            }
        }

        if word.is_data() {
            self.transfer_blocks(word, data, timeout_us)?;
        }

        if word.is_data() || word.expects_busy() {
            self.wait_transfer_complete(word, timeout_us)?;
        }

        self.last_error = Interrupt::empty();
        Ok(())
    }

    fn transfer_blocks(
        &mut self,
        word: CmdWord,
        data: &mut DataBuf<'_>,
        timeout_us: u32,
    ) -> Result<(), SdError> {
        let words_per_block = (self.block_size / 4) as usize;
        let ready = if word.is_read() {
            Interrupt::READ_READY
        } else {
            Interrupt::WRITE_READY
        };

        match data {
            DataBuf::None => {}
            DataBuf::Read(buf) => {
                let mut chunks = buf.chunks_exact_mut(4);
                for _ in 0..self.blocks_to_transfer {
                    self.wait_buffer_ready(word, ready, timeout_us)?;
                    for _ in 0..words_per_block {
                        if let Some(chunk) = chunks.next() {
                            chunk.copy_from_slice(&self.host.read_fifo_word().to_le_bytes());
                        }
                    }
                }
            }
            DataBuf::Write(buf) => {
                let mut chunks = buf.chunks_exact(4);
                for _ in 0..self.blocks_to_transfer {
                    self.wait_buffer_ready(word, ready, timeout_us)?;
                    for _ in 0..words_per_block {
                        if let Some(chunk) = chunks.next() {
                            let value =
                                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                            self.host.write_fifo_word(value);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn wait_buffer_ready(
        &mut self,
        word: CmdWord,
        ready: Interrupt,
        timeout_us: u32,
    ) -> Result<(), SdError> {
        let snapshot = self.host.wait_interrupt(ready | Interrupt::ERR, timeout_us);
        self.host.clear_interrupt(ready | Interrupt::ERRORS);
        if snapshot & (ready | Interrupt::ERRORS) != ready {
            self.last_error = snapshot & Interrupt::ERRORS;
            self.last_interrupt = snapshot;
            let err = classify_failure(snapshot);
            debug!(
                "SD: CMD{} buffer wait failed ({:?}, interrupt {:#x})",
                word.index(),
                err,
                snapshot.bits()
            );
            return Err(err);
        }
        Ok(())
    }

    fn wait_transfer_complete(&mut self, word: CmdWord, timeout_us: u32) -> Result<(), SdError> {
        let snapshot = self
            .host
            .wait_interrupt(Interrupt::TRANSFER_DONE | Interrupt::ERR, timeout_us);
        self.host
            .clear_interrupt(Interrupt::TRANSFER_DONE | Interrupt::ERRORS);

        // A transfer-complete flag wins over a simultaneous data timeout;
        // the card finished and then stopped driving the line.
        let masked = snapshot & (Interrupt::TRANSFER_DONE | Interrupt::ERRORS);
        if masked != Interrupt::TRANSFER_DONE
            && masked != (Interrupt::TRANSFER_DONE | Interrupt::DATA_TIMEOUT)
        {
            self.last_error = snapshot & Interrupt::ERRORS;
            self.last_interrupt = snapshot;
            let err = classify_failure(snapshot);
            debug!(
                "SD: CMD{} completion wait failed ({:?}, interrupt {:#x})",
                word.index(),
                err,
                snapshot.bits()
            );
            return Err(err);
        }
        self.host
            .clear_interrupt(Interrupt::TRANSFER_DONE | Interrupt::ERRORS);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event servicing
    // ------------------------------------------------------------------

    /// Acknowledge interrupts that arrived outside a command: spurious
    /// completions, buffer signals, card insertion/removal and the card
    /// interrupt.
    fn service_events(&mut self) {
        let pending = self.host.wait_interrupt(Interrupt::all(), 0);
        if pending.is_empty() {
            return;
        }

        let mut ack = Interrupt::empty();
        if pending.contains(Interrupt::CMD_DONE) {
            debug!("SD: spurious command complete");
            ack |= Interrupt::CMD_DONE;
        }
        if pending.contains(Interrupt::TRANSFER_DONE) {
            debug!("SD: spurious transfer complete");
            ack |= Interrupt::TRANSFER_DONE;
        }
        if pending.contains(Interrupt::BLOCK_GAP) {
            debug!("SD: spurious block-gap event");
            ack |= Interrupt::BLOCK_GAP;
        }
        if pending.contains(Interrupt::DMA) {
            debug!("SD: spurious DMA interrupt");
            ack |= Interrupt::DMA;
        }
        if pending.contains(Interrupt::WRITE_READY) {
            debug!("SD: spurious write ready");
            ack |= Interrupt::WRITE_READY;
            if self.host.reset_subcircuit(ResetTarget::Data).is_err() {
                warn!("SD: data circuit reset failed");
            }
        }
        if pending.contains(Interrupt::READ_READY) {
            debug!("SD: spurious read ready");
            ack |= Interrupt::READ_READY;
            if self.host.reset_subcircuit(ResetTarget::Data).is_err() {
                warn!("SD: data circuit reset failed");
            }
        }
        if pending.contains(Interrupt::CARD_INSERT) {
            debug!("SD: card insertion");
            ack |= Interrupt::CARD_INSERT;
        }
        if pending.contains(Interrupt::CARD_REMOVE) {
            warn!("SD: card removed");
            ack |= Interrupt::CARD_REMOVE;
            self.card_removed = true;
        }
        if pending.contains(Interrupt::CARD) {
            ack |= Interrupt::CARD;
            self.handle_card_interrupt();
        }
        if pending.intersects(Interrupt::ERRORS | Interrupt::ERR) {
            debug!("SD: spurious error interrupt {:#x}", pending.bits());
            ack |= Interrupt::ERRORS | Interrupt::ERR;
        }
        self.host.clear_interrupt(ack);
    }

    /// The card raised its interrupt line; fetch its status so the
    /// condition is acknowledged.
    fn handle_card_interrupt(&mut self) {
        debug!("SD: card interrupt");
        if self.rca.is_none() {
            return;
        }
        let Some(word) = cmd::lookup(cmd::SEND_STATUS, false, self.config.emmc) else {
            return;
        };
        let arg = self.rca_arg();
        if self
            .issue_raw(word, arg, CMD_TIMEOUT_US, &mut DataBuf::None)
            .is_ok()
        {
            debug!("SD: card status {:#x}", self.last_response[0]);
        } else {
            warn!("SD: unable to get card status after card interrupt");
        }
    }

    // ------------------------------------------------------------------
    // Bring-up
    // ------------------------------------------------------------------

    fn card_init(&mut self) -> Result<(), SdError> {
        let mut attempt = 1;
        loop {
            match self.bring_up() {
                Err(SdError::ScrReadFailed) if attempt < BRING_UP_ATTEMPTS => {
                    warn!("SD: card reset failed, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Bring-up with a single restart after a failed voltage switch; the
    /// second pass keeps 3.3V signalling.
    fn bring_up(&mut self) -> Result<(), SdError> {
        match self.bring_up_once() {
            Err(SdError::VoltageSwitch) => {
                warn!("SD: voltage switch failed, restarting bring-up at 3.3V");
                self.bring_up_once()
            }
            other => other,
        }
    }

    fn bring_up_once(&mut self) -> Result<(), SdError> {
        self.host.reset_subcircuit(ResetTarget::All)?;

        let timeout = Timeout::from_ms(self.platform, CARD_PRESENT_TIMEOUT_MS);
        while !self
            .host
            .read_status_bits()
            .contains(HostStatus::CARD_INSERTED)
        {
            if timeout.is_expired() {
                warn!("SD: no card inserted");
                return Err(SdError::NoCard);
            }
            self.platform.delay_us(1000);
        }

        self.host.set_clock(INIT_CLOCK_HZ)?;
        if self.config.card_interrupt {
            self.host.unmask_card_interrupt();
        }
        self.platform.delay_ms(2);

        // Fresh card session. The voltage-switch failure mark survives so
        // a restarted bring-up stays at 3.3V.
        self.device_id = [0; 4];
        self.ocr = 0;
        self.supports_sdhc = false;
        self.supports_18v = false;
        self.version = SdVersion::Unknown;
        self.bus_widths = 0;
        self.capacity_bytes = 0;
        self.rca = None;
        self.card_removed = false;
        self.block_size = BLOCK_SIZE;
        self.blocks_to_transfer = 0;
        self.last_response = [0; 4];
        self.last_error = Interrupt::empty();
        self.last_interrupt = Interrupt::empty();

        if let Err(err) = self.issue(SdCmd::Std(cmd::GO_IDLE_STATE), 0) {
            error!("SD: no response to the go-idle command");
            return Err(err);
        }

        // An embedded device has no interface-condition or SDIO probing;
        // it always negotiates like a later-version card.
        let v2_card = if self.config.emmc {
            true
        } else {
            let v2_card = self.check_interface_condition()?;
            self.probe_sdio()?;
            v2_card
        };

        self.negotiate_op_cond(v2_card)?;

        if !self.config.emmc {
            self.host.set_clock(DEFAULT_CLOCK_HZ)?;
            self.platform.delay_ms(5);
        }

        if self.supports_18v && !self.config.emmc {
            self.switch_voltage()?;
        }

        if let Err(err) = self.issue(SdCmd::Std(cmd::ALL_SEND_CID), 0) {
            error!("SD: error sending the all-send-cid command");
            return Err(err);
        }
        self.device_id = self.last_response;
        debug!(
            "SD: card CID {:08x}{:08x}{:08x}{:08x}",
            self.device_id[3], self.device_id[2], self.device_id[1], self.device_id[0]
        );

        self.assign_address()?;
        self.read_capacity();
        self.select_card()?;

        if !self.supports_sdhc {
            if let Err(err) = self.issue(SdCmd::Std(cmd::SET_BLOCKLEN), BLOCK_SIZE) {
                error!("SD: error setting the block length");
                return Err(err);
            }
        }
        self.block_size = BLOCK_SIZE;
        self.blocks_to_transfer = 0;
        self.host.set_block_size_count(BLOCK_SIZE, 0);

        if self.config.emmc {
            // No configuration register on an embedded device; the bus is
            // negotiated through an EXT_CSD write instead.
            self.version = SdVersion::V4;
            self.connect_emmc_bus()?;
        } else {
            self.read_scr()?;
            debug!("SD: found a valid version {} SD card", self.version.as_str());
            self.negotiate_high_speed()?;
            self.enable_wide_bus()?;
        }

        self.host.clear_interrupt(Interrupt::all());
        Ok(())
    }

    /// CMD8 separates version 2.00+ cards (they echo the check pattern)
    /// from version 1 cards (they do not answer at all).
    fn check_interface_condition(&mut self) -> Result<bool, SdError> {
        match self.issue(SdCmd::Std(cmd::SEND_IF_COND), IF_COND_3V3_CHECK) {
            Ok(()) => {
                if self.last_response[0] & 0xfff != IF_COND_3V3_CHECK {
                    error!(
                        "SD: unusable card (interface condition {:#x})",
                        self.last_response[0]
                    );
                    return Err(SdError::UnusableCard);
                }
                Ok(true)
            }
            Err(SdError::Timeout) => Ok(false),
            Err(SdError::CommandTimeout) => {
                self.host.reset_subcircuit(ResetTarget::Command)?;
                self.host.clear_interrupt(Interrupt::CMD_TIMEOUT);
                Ok(false)
            }
            Err(err) => {
                error!("SD: failure checking the interface condition");
                Err(err)
            }
        }
    }

    /// Only SDIO cards answer CMD5. One answering is fatal, none are
    /// supported.
    fn probe_sdio(&mut self) -> Result<(), SdError> {
        match self.issue_timeout(SdCmd::Std(cmd::IO_SET_OP_COND), 0, SDIO_PROBE_TIMEOUT_US) {
            Err(SdError::Timeout) => Ok(()),
            Err(SdError::CommandTimeout) => {
                self.host.reset_subcircuit(ResetTarget::Command)?;
                self.host.clear_interrupt(Interrupt::CMD_TIMEOUT);
                Ok(())
            }
            _ => {
                error!("SD: SDIO card detected, not currently supported");
                Err(SdError::SdioUnsupported)
            }
        }
    }

    /// Negotiate operating conditions: an inquiry, then a loop with the
    /// requested capabilities until the card leaves its busy state.
    fn negotiate_op_cond(&mut self, v2_card: bool) -> Result<(), SdError> {
        let op_cond = if self.config.emmc {
            SdCmd::Std(cmd::SEND_OP_COND)
        } else {
            SdCmd::App(cmd::SD_SEND_OP_COND)
        };

        if let Err(err) = self.issue(op_cond, 0) {
            error!("SD: inquiry operating-conditions command failed");
            return Err(err);
        }

        let mut arg = OCR_VOLTAGE_WINDOW;
        if v2_card {
            arg |= OCR_CARD_CAPACITY;
            if self.config.sdxc_max_performance && !self.config.emmc {
                arg |= OCR_XPC;
            }
            if self.config.use_1v8
                && !self.config.emmc
                && !self.failed_voltage_switch
                && self.host.supports_voltage_switch()
            {
                arg |= OCR_S18;
            }
        }

        let mut polls = 0;
        loop {
            if let Err(err) = self.issue(op_cond, arg) {
                error!("SD: operating-conditions negotiation failed");
                return Err(err);
            }
            let r0 = self.last_response[0];
            if r0 & OCR_BUSY != 0 {
                self.ocr = (r0 >> 8) & 0xffff;
                self.supports_sdhc = r0 & OCR_CARD_CAPACITY != 0;
                self.supports_18v = arg & OCR_S18 != 0 && r0 & OCR_S18 != 0;
                debug!(
                    "SD: OCR {:#x}, high capacity {}, 1.8V {}",
                    self.ocr, self.supports_sdhc, self.supports_18v
                );
                return Ok(());
            }

            polls += 1;
            if polls >= OP_COND_RETRIES {
                error!("SD: card stayed busy during operating-conditions negotiation");
                return Err(SdError::Timeout);
            }
            debug!("SD: card is busy, retrying operating conditions");
            self.platform.delay_us(OP_COND_RETRY_DELAY_US);
        }
    }

    /// Protocol half of the 1.8V switch (CMD11), then the electrical half
    /// in the backend. Any failure powers the bus off and asks for one
    /// full bring-up restart at 3.3V.
    fn switch_voltage(&mut self) -> Result<(), SdError> {
        debug!("SD: switching signalling to 1.8V");
        if self.issue(SdCmd::Std(cmd::VOLTAGE_SWITCH), 0).is_err() {
            warn!("SD: voltage-switch command failed");
            return self.voltage_switch_failed();
        }
        if self.host.switch_signal_voltage_1v8().is_err() {
            return self.voltage_switch_failed();
        }
        debug!("SD: signalling switched to 1.8V");
        Ok(())
    }

    fn voltage_switch_failed(&mut self) -> Result<(), SdError> {
        self.failed_voltage_switch = true;
        self.host.power_off();
        Err(SdError::VoltageSwitch)
    }

    /// CMD3: the card publishes its relative address. The status half of
    /// the response is checked before the address is accepted.
    fn assign_address(&mut self) -> Result<(), SdError> {
        if let Err(err) = self.issue(SdCmd::Std(cmd::SEND_RELATIVE_ADDR), 0) {
            error!("SD: error requesting the relative address");
            return Err(err);
        }
        let r0 = self.last_response[0];

        let crc_error = r0 & (1 << 15) != 0;
        let illegal_cmd = r0 & (1 << 14) != 0;
        let card_error = r0 & (1 << 13) != 0;
        let ready = r0 & (1 << 8) != 0;
        if crc_error || illegal_cmd || card_error {
            warn!("SD: card reported an error with its relative address");
            return Err(SdError::CardStatus);
        }
        if !ready {
            warn!("SD: card not ready for data");
            return Err(SdError::CardStatus);
        }

        self.rca = Some((r0 >> 16) as u16);
        debug!("SD: relative card address {:#x}", r0 >> 16);
        Ok(())
    }

    /// CMD9 between addressing and selection; a failure only costs the
    /// capacity report.
    fn read_capacity(&mut self) {
        if self.issue(SdCmd::Std(cmd::SEND_CSD), self.rca_arg()).is_ok() {
            self.capacity_bytes = decode_csd_capacity(&self.last_response);
        } else {
            warn!("SD: unable to read the card-specific data");
        }
    }

    fn select_card(&mut self) -> Result<(), SdError> {
        if let Err(err) = self.issue(SdCmd::Std(cmd::SELECT_CARD), self.rca_arg()) {
            error!("SD: error selecting the card");
            return Err(err);
        }
        let state = (self.last_response[0] >> 9) & 0xf;
        if state != STATE_STAND_BY && state != STATE_TRANSFER {
            error!("SD: invalid card state after select ({})", state);
            return Err(SdError::CardState);
        }
        Ok(())
    }

    /// Read the 8-byte SD configuration register: specification version
    /// and supported bus widths. Its failure is worth a bring-up retry.
    fn read_scr(&mut self) -> Result<(), SdError> {
        self.block_size = 8;
        self.blocks_to_transfer = 1;
        let mut scr = [0u8; 8];
        let result = self.issue_data(
            SdCmd::App(cmd::SEND_SCR),
            0,
            SCR_TIMEOUT_US,
            &mut DataBuf::Read(&mut scr),
        );
        self.block_size = BLOCK_SIZE;
        if result.is_err() {
            warn!("SD: error reading the configuration register");
            return Err(SdError::ScrReadFailed);
        }

        // The register arrives as a big-endian byte stream.
        let scr0 = u32::from_be_bytes([scr[0], scr[1], scr[2], scr[3]]);
        let sd_spec = (scr0 >> 24) & 0xf;
        self.bus_widths = (scr0 >> 16) & 0xf;
        let sd_spec3 = (scr0 >> 15) & 1;
        let sd_spec4 = (scr0 >> 10) & 1;
        self.version = match (sd_spec, sd_spec3, sd_spec4) {
            (0, _, _) => SdVersion::V1,
            (1, _, _) => SdVersion::V1_10,
            (2, 0, _) => SdVersion::V2,
            (2, 1, 0) => SdVersion::V3,
            (2, 1, _) => SdVersion::V4,
            _ => SdVersion::Unknown,
        };
        Ok(())
    }

    /// CMD6 exists from version 1.10 on: query function group 1, then
    /// commit high-speed and raise the clock. Failures cost speed only.
    fn negotiate_high_speed(&mut self) -> Result<(), SdError> {
        if !self.config.high_speed {
            return Ok(());
        }
        if matches!(self.version, SdVersion::Unknown | SdVersion::V1) {
            return Ok(());
        }

        self.block_size = 64;
        self.blocks_to_transfer = 1;
        let mut status = [0u8; 64];
        let check = self.issue_data(
            SdCmd::Std(cmd::SWITCH_FUNC),
            SWITCH_CHECK_HIGH_SPEED,
            SWITCH_TIMEOUT_US,
            &mut DataBuf::Read(&mut status),
        );

        let mut switch = Ok(());
        let supported = check.is_ok() && status[13] & 0x2 != 0;
        if supported {
            switch = self.issue_data(
                SdCmd::Std(cmd::SWITCH_FUNC),
                SWITCH_SET_HIGH_SPEED,
                SWITCH_TIMEOUT_US,
                &mut DataBuf::Read(&mut status),
            );
        }
        self.block_size = BLOCK_SIZE;

        if check.is_err() {
            warn!("SD: unable to query high-speed support");
        } else if supported {
            if switch.is_ok() {
                if self.host.set_clock(HIGH_SPEED_CLOCK_HZ).is_err() {
                    warn!("SD: could not raise the clock to 50 MHz");
                } else {
                    debug!("SD: high-speed mode enabled");
                }
            } else {
                warn!("SD: switching to high-speed mode failed");
            }
        }
        Ok(())
    }

    /// ACMD6 plus the controller bus-width change. The card interrupt is
    /// masked across the change; a refusal costs bandwidth only.
    fn enable_wide_bus(&mut self) -> Result<(), SdError> {
        if !self.config.four_bit || self.bus_widths & 0x4 == 0 {
            return Ok(());
        }
        self.host.mask_card_interrupt();
        match self.issue(SdCmd::App(cmd::SET_BUS_WIDTH), 0x2) {
            Ok(()) => {
                self.host.set_bus_width(BusWidth::Four);
                debug!("SD: switched to 4-bit data mode");
            }
            Err(_) => warn!("SD: switch to 4-bit data mode failed"),
        }
        if self.config.card_interrupt {
            self.host.unmask_card_interrupt();
        }
        Ok(())
    }

    /// EXT_CSD bus-width write for an embedded device, then the working
    /// clock.
    fn connect_emmc_bus(&mut self) -> Result<(), SdError> {
        let (arg, width) = if self.config.emmc_8bit {
            (MMC_SWITCH_BUS_WIDTH_8, BusWidth::Eight)
        } else {
            (MMC_SWITCH_BUS_WIDTH_4, BusWidth::Four)
        };

        self.host.mask_card_interrupt();
        match self.issue(SdCmd::Std(cmd::SWITCH_FUNC), arg) {
            Ok(()) => {
                self.host.set_bus_width(width);
                debug!("SD: switched eMMC bus width");
            }
            Err(_) => warn!("SD: eMMC bus-width switch failed"),
        }
        if self.config.card_interrupt {
            self.host.unmask_card_interrupt();
        }

        self.host.set_clock(DEFAULT_CLOCK_HZ)?;
        self.platform.delay_ms(5);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data mode and block I/O
    // ------------------------------------------------------------------

    /// Put the card back into transfer state, re-running bring-up if the
    /// session was lost.
    fn ensure_data_mode(&mut self) -> Result<(), SdError> {
        if self.rca.is_none() {
            debug!("SD: no card currently selected, resetting");
            self.bring_up()?;
        }

        let rca_arg = self.rca_arg();
        if let Err(err) = self.issue(SdCmd::Std(cmd::SEND_STATUS), rca_arg) {
            warn!("SD: error reading the card status");
            self.rca = None;
            return Err(err);
        }
        let state = (self.last_response[0] >> 9) & 0xf;
        debug!("SD: card state {}", state);

        if state == STATE_STAND_BY {
            if let Err(err) = self.issue(SdCmd::Std(cmd::SELECT_CARD), rca_arg) {
                warn!("SD: unable to select the card");
                self.rca = None;
                return Err(err);
            }
        } else if state == STATE_SENDING_DATA {
            // A dangling transfer blocks the data lines until aborted.
            if let Err(err) = self.issue(SdCmd::Std(cmd::STOP_TRANSMISSION), 0) {
                warn!("SD: unable to stop a running transmission");
                self.rca = None;
                return Err(err);
            }
            if self.host.reset_subcircuit(ResetTarget::Data).is_err() {
                warn!("SD: data circuit reset failed");
            }
        } else if state != STATE_TRANSFER {
            self.bring_up()?;
        }

        if state != STATE_TRANSFER {
            if let Err(err) = self.issue(SdCmd::Std(cmd::SEND_STATUS), rca_arg) {
                warn!("SD: error re-reading the card status");
                self.rca = None;
                return Err(err);
            }
            let state = (self.last_response[0] >> 9) & 0xf;
            if state != STATE_TRANSFER {
                warn!("SD: unable to return to transfer state ({})", state);
                self.rca = None;
                return Err(SdError::CardState);
            }
        }
        Ok(())
    }

    fn do_data_command(&mut self, block: u32, data: &mut DataBuf<'_>) -> Result<(), SdError> {
        let (len, is_write) = match data {
            DataBuf::Read(buf) => (buf.len(), false),
            DataBuf::Write(buf) => (buf.len(), true),
            DataBuf::None => return Err(SdError::GenericError),
        };

        if len < BLOCK_SIZE as usize {
            warn!("SD: buffer is smaller than one block ({} bytes)", len);
            return Err(SdError::InvalidBlockCount);
        }
        if len % BLOCK_SIZE as usize != 0 {
            warn!("SD: buffer is not a whole number of blocks ({} bytes)", len);
            return Err(SdError::InvalidBlockCount);
        }

        // Standard-capacity cards are byte addressed.
        let address = if self.supports_sdhc {
            block
        } else {
            let Some(address) = block.checked_mul(BLOCK_SIZE) else {
                warn!("SD: block {} out of range for a byte-addressed card", block);
                return Err(SdError::GenericError);
            };
            address
        };

        self.block_size = BLOCK_SIZE;
        self.blocks_to_transfer = (len / BLOCK_SIZE as usize) as u32;
        let multi = self.blocks_to_transfer > 1;
        let index = match (is_write, multi) {
            (false, false) => cmd::READ_SINGLE_BLOCK,
            (false, true) => cmd::READ_MULTIPLE_BLOCK,
            (true, false) => cmd::WRITE_BLOCK,
            (true, true) => cmd::WRITE_MULTIPLE_BLOCK,
        };

        let mut attempt = 1;
        loop {
            match self.issue_data(SdCmd::Std(index), address, DATA_TIMEOUT_US, data) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < DATA_RETRIES => {
                    warn!(
                        "SD: data command CMD{} failed ({:?}), retrying",
                        index, err
                    );
                    attempt += 1;
                }
                Err(err) => {
                    error!("SD: data command CMD{} failed ({:?})", index, err);
                    self.rca = None;
                    return Err(err);
                }
            }
        }
    }
}
