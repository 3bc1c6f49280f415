//! Test Doubles
//!
//! A platform with a virtual clock and a scripted host controller. The
//! host matches incoming commands against scripted rules (keyed by index
//! and application-command state), records every operation for sequence
//! assertions and backs data commands with a small block store.

use core::cell::Cell;

use heapless::Vec;

use crate::SdError;
use crate::cmd::{self, CmdWord};
use crate::host::{BusWidth, HostStatus, Interrupt, ResetTarget, SdHost};
use crate::platform::{ClockDomain, Platform};

/// Block store size: 16 blocks of 512 bytes.
pub const MOCK_DISK_BYTES: usize = 16 * 512;

/// Platform with a virtual microsecond clock; delays advance it.
pub struct MockPlatform {
    now: Cell<u64>,
    pub emmc_hz: Cell<u32>,
    pub core_hz: Cell<u32>,
    pub power_ok: Cell<bool>,
    pub power_calls: Cell<u32>,
    pub led_on_calls: Cell<u32>,
    pub led_off_calls: Cell<u32>,
    pub entry_calls: Cell<u32>,
    pub exit_calls: Cell<u32>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            now: Cell::new(0),
            emmc_hz: Cell::new(100_000_000),
            core_hz: Cell::new(250_000_000),
            power_ok: Cell::new(true),
            power_calls: Cell::new(0),
            led_on_calls: Cell::new(0),
            led_off_calls: Cell::new(0),
            entry_calls: Cell::new(0),
            exit_calls: Cell::new(0),
        }
    }

    /// Advance the virtual clock.
    pub fn advance_us(&self, us: u64) {
        self.now.set(self.now.get() + us);
    }
}

impl Platform for MockPlatform {
    fn micros(&self) -> u64 {
        self.now.get()
    }

    fn delay_us(&self, us: u32) {
        self.advance_us(us as u64);
    }

    fn clock_rate(&self, domain: ClockDomain) -> u32 {
        match domain {
            ClockDomain::Emmc => self.emmc_hz.get(),
            ClockDomain::Core => self.core_hz.get(),
        }
    }

    fn power_on(&self) -> bool {
        self.power_calls.set(self.power_calls.get() + 1);
        self.power_ok.get()
    }

    fn peripheral_entry(&self) {
        self.entry_calls.set(self.entry_calls.get() + 1);
    }

    fn peripheral_exit(&self) {
        self.exit_calls.set(self.exit_calls.get() + 1);
    }

    fn activity_led(&self, on: bool) {
        if on {
            self.led_on_calls.set(self.led_on_calls.get() + 1);
        } else {
            self.led_off_calls.set(self.led_off_calls.get() + 1);
        }
    }
}

/// Outcome scripted for one command.
#[derive(Debug, Clone, Copy)]
pub enum MockResult {
    /// Completes with this response; writes sink into the block store.
    Ok([u32; 4]),
    /// Completes; read data is served from the block store.
    OkData([u32; 4]),
    /// Completes; read data is served from the given bytes.
    OkRead([u32; 4], &'static [u8]),
    /// Fails with these error-cause bits.
    Fail(Interrupt),
    /// The controller never signals completion.
    Silent,
}

#[derive(Clone, Copy)]
struct Rule {
    index: u8,
    app: bool,
    once: bool,
    result: MockResult,
}

/// One recorded host operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    BlockSize { size: u32, blocks: u32 },
    Arg(u32),
    Cmd(u8),
    SetClock(u32),
    Reset(ResetTarget),
    BusWidth(BusWidth),
    PowerOff,
    MaskCardIrq,
    UnmaskCardIrq,
    VoltageSwitch,
}

/// Scripted host controller.
pub struct MockHost {
    rules: Vec<Rule, 32>,
    /// Every operation in arrival order.
    pub ops: Vec<HostOp, 256>,
    /// Total trait-method invocations, queries included.
    pub calls: Cell<u32>,
    /// Status lines returned to the engine.
    pub status: HostStatus,
    /// Advertised 1.8V capability.
    pub can_switch_voltage: bool,
    /// Outcome of the electrical voltage switch.
    pub voltage_switch_ok: bool,
    /// Block store backing data commands.
    pub disk: [u8; MOCK_DISK_BYTES],
    /// Bytes per argument unit: 512 when the scripted card is
    /// block-addressed, 1 when byte-addressed.
    pub addr_unit: u32,

    last_resp: [u32; 4],
    staged: Interrupt,
    completed: bool,
    active: Option<CmdWord>,
    arg: u32,
    block_size: u32,
    blocks: u32,
    pending_read: Vec<u8, 4096>,
    read_pos: usize,
    pending_write: Vec<u8, 4096>,
    expected_write: usize,
    app_armed: bool,
    current_app: bool,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            ops: Vec::new(),
            calls: Cell::new(0),
            status: HostStatus::CARD_INSERTED,
            can_switch_voltage: false,
            voltage_switch_ok: false,
            disk: [0; MOCK_DISK_BYTES],
            addr_unit: 512,
            last_resp: [0; 4],
            staged: Interrupt::empty(),
            completed: false,
            active: None,
            arg: 0,
            block_size: 0,
            blocks: 0,
            pending_read: Vec::new(),
            read_pos: 0,
            pending_write: Vec::new(),
            expected_write: 0,
            app_armed: false,
            current_app: false,
        }
    }

    /// Script a one-shot outcome for a standard command.
    pub fn on_cmd(&mut self, index: u8, result: MockResult) {
        self.push_rule(index, false, true, result);
    }

    /// Script a persistent outcome for a standard command.
    pub fn on_cmd_repeating(&mut self, index: u8, result: MockResult) {
        self.push_rule(index, false, false, result);
    }

    /// Script a one-shot outcome for an application command.
    pub fn on_acmd(&mut self, index: u8, result: MockResult) {
        self.push_rule(index, true, true, result);
    }

    /// Script a persistent outcome for an application command.
    pub fn on_acmd_repeating(&mut self, index: u8, result: MockResult) {
        self.push_rule(index, true, false, result);
    }

    fn push_rule(&mut self, index: u8, app: bool, once: bool, result: MockResult) {
        self.rules
            .push(Rule {
                index,
                app,
                once,
                result,
            })
            .ok()
            .unwrap();
    }

    /// Latch interrupt bits as if the controller had raised them.
    pub fn inject(&mut self, bits: Interrupt) {
        self.staged |= bits;
    }

    /// Indices of the commands triggered so far, in order.
    pub fn command_indices(&self) -> Vec<u8, 64> {
        let mut out = Vec::new();
        for op in &self.ops {
            if let HostOp::Cmd(index) = op {
                out.push(*index).ok().unwrap();
            }
        }
        out
    }

    fn record(&mut self, op: HostOp) {
        self.ops.push(op).ok().unwrap();
    }

    fn count(&self) {
        self.calls.set(self.calls.get() + 1);
    }

    fn stage_data(&mut self, command: CmdWord, literal: Option<&'static [u8]>) {
        if !command.is_data() {
            return;
        }
        let len = (self.block_size * self.blocks.max(1)) as usize;
        if command.is_read() {
            match literal {
                Some(bytes) => {
                    for i in 0..len {
                        let byte = bytes.get(i).copied().unwrap_or(0);
                        self.pending_read.push(byte).ok().unwrap();
                    }
                }
                None => {
                    let off = (self.arg as usize) * (self.addr_unit as usize);
                    assert!(
                        off + len <= MOCK_DISK_BYTES,
                        "mock read outside the block store"
                    );
                    self.pending_read
                        .extend_from_slice(&self.disk[off..off + len])
                        .ok()
                        .unwrap();
                }
            }
        } else {
            self.expected_write = len;
        }
    }

    fn commit_write(&mut self) {
        let off = (self.arg as usize) * (self.addr_unit as usize);
        let len = self.pending_write.len();
        assert!(
            off + len <= MOCK_DISK_BYTES,
            "mock write outside the block store"
        );
        self.disk[off..off + len].copy_from_slice(&self.pending_write);
    }

    fn current_bits(&self) -> Interrupt {
        let mut bits = self.staged;
        if self.completed {
            if let Some(active) = self.active {
                if active.is_data() {
                    if active.is_read() {
                        if self.read_pos < self.pending_read.len() {
                            bits |= Interrupt::READ_READY;
                        } else {
                            bits |= Interrupt::TRANSFER_DONE;
                        }
                    } else if self.pending_write.len() < self.expected_write {
                        bits |= Interrupt::WRITE_READY;
                    } else {
                        bits |= Interrupt::TRANSFER_DONE;
                    }
                } else {
                    bits |= Interrupt::TRANSFER_DONE;
                }
            }
        }
        bits
    }
}

impl SdHost for MockHost {
    fn set_block_size_count(&mut self, block_size: u32, blocks: u32) {
        self.count();
        self.block_size = block_size;
        self.blocks = blocks;
        self.record(HostOp::BlockSize {
            size: block_size,
            blocks,
        });
    }

    fn set_argument(&mut self, arg: u32) {
        self.count();
        self.arg = arg;
        self.record(HostOp::Arg(arg));
    }

    fn trigger_command(&mut self, command: CmdWord) {
        self.count();
        let index = command.index();
        self.record(HostOp::Cmd(index));

        let was_armed = self.app_armed;
        if index == cmd::APP_CMD {
            self.app_armed = true;
            self.current_app = false;
        } else {
            self.current_app = was_armed;
            self.app_armed = false;
        }

        let pos = self
            .rules
            .iter()
            .position(|r| r.index == index && r.app == self.current_app);
        let Some(pos) = pos else {
            panic!(
                "MockHost: unscripted {}CMD{}",
                if self.current_app { "A" } else { "" },
                index
            );
        };
        let rule = self.rules[pos];
        if rule.once {
            self.rules.remove(pos);
        }

        self.active = Some(command);
        self.staged = Interrupt::empty();
        self.completed = false;
        self.pending_read.clear();
        self.read_pos = 0;
        self.pending_write.clear();
        self.expected_write = 0;

        match rule.result {
            MockResult::Ok(resp) => {
                self.last_resp = resp;
                self.staged = Interrupt::CMD_DONE;
                self.completed = true;
                self.stage_data(command, None);
            }
            MockResult::OkData(resp) => {
                self.last_resp = resp;
                self.staged = Interrupt::CMD_DONE;
                self.completed = true;
                self.stage_data(command, None);
            }
            MockResult::OkRead(resp, bytes) => {
                self.last_resp = resp;
                self.staged = Interrupt::CMD_DONE;
                self.completed = true;
                self.stage_data(command, Some(bytes));
            }
            MockResult::Fail(bits) => {
                self.staged = bits | Interrupt::ERR;
            }
            MockResult::Silent => {}
        }
    }

    fn wait_interrupt(&mut self, _mask: Interrupt, _timeout_us: u32) -> Interrupt {
        self.count();
        self.current_bits()
    }

    fn clear_interrupt(&mut self, mask: Interrupt) {
        self.count();
        self.staged &= !mask;
    }

    fn read_response(&mut self, index: usize) -> u32 {
        self.count();
        self.last_resp[index & 3]
    }

    fn read_fifo_word(&mut self) -> u32 {
        self.count();
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.pending_read.get(self.read_pos + i).copied().unwrap_or(0);
        }
        self.read_pos += 4;
        u32::from_le_bytes(bytes)
    }

    fn write_fifo_word(&mut self, word: u32) {
        self.count();
        self.pending_write
            .extend_from_slice(&word.to_le_bytes())
            .ok()
            .unwrap();
        if self.expected_write > 0 && self.pending_write.len() >= self.expected_write {
            self.commit_write();
        }
    }

    fn set_clock(&mut self, target_hz: u32) -> Result<(), SdError> {
        self.count();
        self.record(HostOp::SetClock(target_hz));
        Ok(())
    }

    fn reset_subcircuit(&mut self, target: ResetTarget) -> Result<(), SdError> {
        self.count();
        self.record(HostOp::Reset(target));
        Ok(())
    }

    fn read_status_bits(&mut self) -> HostStatus {
        self.count();
        self.status
    }

    fn power_off(&mut self) {
        self.count();
        self.record(HostOp::PowerOff);
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        self.count();
        self.record(HostOp::BusWidth(width));
    }

    fn mask_card_interrupt(&mut self) {
        self.count();
        self.record(HostOp::MaskCardIrq);
    }

    fn unmask_card_interrupt(&mut self) {
        self.count();
        self.record(HostOp::UnmaskCardIrq);
    }

    fn supports_voltage_switch(&self) -> bool {
        self.count();
        self.can_switch_voltage
    }

    fn switch_signal_voltage_1v8(&mut self) -> Result<(), SdError> {
        self.count();
        self.record(HostOp::VoltageSwitch);
        if self.voltage_switch_ok {
            Ok(())
        } else {
            Err(SdError::VoltageSwitch)
        }
    }
}
