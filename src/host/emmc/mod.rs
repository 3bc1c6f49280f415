//! EMMC Host Backend
//!
//! Driver for the SDHCI-style EMMC interface. Commands, interrupts and the
//! data FIFO map straight onto controller registers; the protocol engine
//! on top only sees the [`SdHost`] capability surface.

pub mod regs;

use core::ptr;

use log::{debug, error, warn};

use crate::SdError;
use crate::cmd::CmdWord;
use crate::host::{BusWidth, HostStatus, Interrupt, ResetTarget, SdHost};
use crate::platform::{ClockDomain, Platform, Timeout};

use regs::*;

/// Base clock assumed when the platform cannot report one (Hz)
const BASE_CLOCK_FALLBACK_HZ: u32 = 100_000_000;

/// Timeout for controller and subcircuit resets (milliseconds)
const RESET_TIMEOUT_MS: u32 = 1000;

/// Timeout for the internal clock to stabilize (milliseconds)
const CLOCK_STABLE_TIMEOUT_MS: u32 = 1000;

/// Timeout for the command and data lines to go idle before a clock
/// change (milliseconds)
const INHIBIT_TIMEOUT_MS: u32 = 1000;

/// Largest 10-bit divider field
const MAX_DIVIDER_FIELD: u32 = 0x3ff;

/// Select the divider field for the highest frequency not above
/// `target_hz`. The controller divides by twice the field value, so the
/// field is rounded up to a power of two to keep the division exact.
fn compute_divider(base_hz: u32, target_hz: u32) -> Result<u32, SdError> {
    if base_hz == 0 || target_hz == 0 {
        return Err(SdError::ClockFailed);
    }
    if target_hz >= base_hz {
        return Ok(0);
    }
    let wanted = base_hz.div_ceil(target_hz);
    let effective = wanted.next_power_of_two();
    Ok((effective >> 1).min(MAX_DIVIDER_FIELD))
}

/// EMMC host controller
pub struct EmmcHost<'p, P: Platform> {
    /// MMIO base address
    base: usize,
    /// Platform services (timing, clock rates)
    platform: &'p P,
    /// Host controller specification version
    version: u8,
    /// Base clock frequency (Hz), discovered on first clock switch
    base_clock: u32,
}

impl<'p, P: Platform> EmmcHost<'p, P> {
    /// Create a driver for the controller mapped at `base`. No hardware
    /// access happens until the first reset.
    pub fn new(base: usize, platform: &'p P) -> Self {
        Self {
            base,
            platform,
            version: 0,
            base_clock: 0,
        }
    }

    /// Host controller specification version field.
    pub fn version(&self) -> u8 {
        self.version
    }

    fn read_reg32(&self, offset: u32) -> u32 {
        unsafe { ptr::read_volatile((self.base + offset as usize) as *const u32) }
    }

    fn write_reg32(&mut self, offset: u32, value: u32) {
        unsafe { ptr::write_volatile((self.base + offset as usize) as *mut u32, value) }
    }

    /// Full controller reset: version gate, circuit reset, interrupt
    /// routing. Leaves the clock off.
    fn reset_host(&mut self) -> Result<(), SdError> {
        let ver_reg = self.read_reg32(EMMC_SLOTISR_VER);
        self.version =
            ((ver_reg >> SLOTISR_VER_SDVERSION_SHIFT) & SLOTISR_VER_SDVERSION_MASK) as u8;
        debug!(
            "EMMC: vendor {:#x}, sdversion {}",
            ver_reg >> 24,
            self.version
        );
        if self.version < 2 {
            error!("EMMC: only host controllers compatible with version 3.0 are supported");
            return Err(SdError::UnsupportedVersion);
        }

        let mut ctl1 = self.read_reg32(EMMC_CONTROL1);
        ctl1 |= CONTROL1_SRST_HC;
        ctl1 &= !(CONTROL1_CLK_EN | CONTROL1_CLK_INTLEN);
        self.write_reg32(EMMC_CONTROL1, ctl1);

        let timeout = Timeout::from_ms(self.platform, RESET_TIMEOUT_MS);
        while self.read_reg32(EMMC_CONTROL1) & CONTROL1_SRST_ALL != 0 {
            if timeout.is_expired() {
                error!("EMMC: controller did not reset properly");
                return Err(SdError::ResetFailed);
            }
            core::hint::spin_loop();
        }

        self.write_reg32(EMMC_CONTROL2, 0);

        // Route nothing to the IRQ line, clear everything pending and
        // unmask all status bits except the card interrupt.
        self.write_reg32(EMMC_IRPT_EN, 0);
        self.write_reg32(EMMC_INTERRUPT, 0xffff_ffff);
        self.write_reg32(EMMC_IRPT_MASK, !Interrupt::CARD.bits());

        self.platform.delay_ms(2);
        Ok(())
    }

    fn reset_lines(&mut self, bit: u32) -> Result<(), SdError> {
        let ctl1 = self.read_reg32(EMMC_CONTROL1) | bit;
        self.write_reg32(EMMC_CONTROL1, ctl1);

        let timeout = Timeout::from_ms(self.platform, RESET_TIMEOUT_MS);
        while self.read_reg32(EMMC_CONTROL1) & bit != 0 {
            if timeout.is_expired() {
                error!("EMMC: subcircuit reset did not complete");
                return Err(SdError::ResetFailed);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }
}

impl<P: Platform> SdHost for EmmcHost<'_, P> {
    fn set_block_size_count(&mut self, block_size: u32, blocks: u32) {
        self.write_reg32(EMMC_BLKSIZECNT, make_blksizecnt(block_size, blocks));
    }

    fn set_argument(&mut self, arg: u32) {
        self.write_reg32(EMMC_ARG1, arg);
    }

    fn trigger_command(&mut self, cmd: CmdWord) {
        // The controller ignores a command written while the inhibit
        // lines are held. A line that never releases shows up as a
        // timeout on the completion wait that follows.
        let timeout = Timeout::from_ms(self.platform, INHIBIT_TIMEOUT_MS);
        while self.read_reg32(EMMC_STATUS) & STATUS_CMD_INHIBIT != 0 {
            if timeout.is_expired() {
                warn!("EMMC: command line stuck inhibited");
                break;
            }
            self.platform.delay_us(1000);
        }
        if cmd.expects_busy() && !cmd.is_abort() {
            let timeout = Timeout::from_ms(self.platform, INHIBIT_TIMEOUT_MS);
            while self.read_reg32(EMMC_STATUS) & STATUS_DAT_INHIBIT != 0 {
                if timeout.is_expired() {
                    warn!("EMMC: data line stuck inhibited");
                    break;
                }
                self.platform.delay_us(1000);
            }
        }
        self.write_reg32(EMMC_CMDTM, cmd.raw());
    }

    fn wait_interrupt(&mut self, mask: Interrupt, timeout_us: u32) -> Interrupt {
        let bits = mask.bits();
        let mut snapshot = self.read_reg32(EMMC_INTERRUPT);
        if timeout_us > 0 && snapshot & bits == 0 {
            let timeout = Timeout::from_us(self.platform, timeout_us);
            while snapshot & bits == 0 && !timeout.is_expired() {
                core::hint::spin_loop();
                snapshot = self.read_reg32(EMMC_INTERRUPT);
            }
        }
        Interrupt::from_bits_retain(snapshot)
    }

    fn clear_interrupt(&mut self, mask: Interrupt) {
        self.write_reg32(EMMC_INTERRUPT, mask.bits());
    }

    fn read_response(&mut self, index: usize) -> u32 {
        self.read_reg32(EMMC_RESP0 + ((index as u32) & 3) * 4)
    }

    fn read_fifo_word(&mut self) -> u32 {
        self.read_reg32(EMMC_DATA)
    }

    fn write_fifo_word(&mut self, word: u32) {
        self.write_reg32(EMMC_DATA, word);
    }

    fn set_clock(&mut self, target_hz: u32) -> Result<(), SdError> {
        if self.base_clock == 0 {
            let rate = self.platform.clock_rate(ClockDomain::Emmc);
            self.base_clock = if rate == 0 {
                warn!("EMMC: could not get base clock, assuming 100 MHz");
                BASE_CLOCK_FALLBACK_HZ
            } else {
                rate
            };
        }
        let field = compute_divider(self.base_clock, target_hz)?;

        // A clock change mid-command would glitch the bus.
        let timeout = Timeout::from_ms(self.platform, INHIBIT_TIMEOUT_MS);
        while self.read_reg32(EMMC_STATUS) & (STATUS_CMD_INHIBIT | STATUS_DAT_INHIBIT) != 0 {
            if timeout.is_expired() {
                error!("EMMC: bus busy, cannot switch clock");
                return Err(SdError::Timeout);
            }
            core::hint::spin_loop();
        }

        let mut ctl1 = self.read_reg32(EMMC_CONTROL1) & !CONTROL1_CLK_EN;
        self.write_reg32(EMMC_CONTROL1, ctl1);
        self.platform.delay_ms(2);

        ctl1 &= !(CONTROL1_CLK_DIV_MASK | CONTROL1_TOUNIT_MASK);
        ctl1 |= make_clk_div(field) | CONTROL1_TOUNIT_MAX | CONTROL1_CLK_INTLEN;
        self.write_reg32(EMMC_CONTROL1, ctl1);

        let timeout = Timeout::from_ms(self.platform, CLOCK_STABLE_TIMEOUT_MS);
        while self.read_reg32(EMMC_CONTROL1) & CONTROL1_CLK_STABLE == 0 {
            if timeout.is_expired() {
                error!("EMMC: internal clock not stable");
                return Err(SdError::ClockFailed);
            }
            core::hint::spin_loop();
        }
        self.platform.delay_ms(2);

        ctl1 |= CONTROL1_CLK_EN;
        self.write_reg32(EMMC_CONTROL1, ctl1);
        self.platform.delay_ms(2);

        let actual = if field == 0 {
            self.base_clock
        } else {
            self.base_clock / (2 * field)
        };
        debug!(
            "EMMC: clock set to {} Hz (divider field {}, actual {} Hz)",
            target_hz, field, actual
        );
        Ok(())
    }

    fn reset_subcircuit(&mut self, target: ResetTarget) -> Result<(), SdError> {
        match target {
            ResetTarget::Command => self.reset_lines(CONTROL1_SRST_CMD),
            ResetTarget::Data => self.reset_lines(CONTROL1_SRST_DATA),
            ResetTarget::All => self.reset_host(),
        }
    }

    fn read_status_bits(&mut self) -> HostStatus {
        HostStatus::from_bits_truncate(self.read_reg32(EMMC_STATUS))
    }

    fn power_off(&mut self) {
        let ctl0 = self.read_reg32(EMMC_CONTROL0) & !CONTROL0_BUS_POWER;
        self.write_reg32(EMMC_CONTROL0, ctl0);
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        let mut ctl0 = self.read_reg32(EMMC_CONTROL0);
        ctl0 &= !(CONTROL0_DWIDTH_4 | CONTROL0_DWIDTH_8);
        match width {
            BusWidth::One => {}
            BusWidth::Four => ctl0 |= CONTROL0_DWIDTH_4,
            BusWidth::Eight => ctl0 |= CONTROL0_DWIDTH_8,
        }
        self.write_reg32(EMMC_CONTROL0, ctl0);
    }

    fn mask_card_interrupt(&mut self) {
        let mask = self.read_reg32(EMMC_IRPT_MASK) & !Interrupt::CARD.bits();
        self.write_reg32(EMMC_IRPT_MASK, mask);
    }

    fn unmask_card_interrupt(&mut self) {
        let mask = self.read_reg32(EMMC_IRPT_MASK) | Interrupt::CARD.bits();
        self.write_reg32(EMMC_IRPT_MASK, mask);
    }

    fn supports_voltage_switch(&self) -> bool {
        true
    }

    fn switch_signal_voltage_1v8(&mut self) -> Result<(), SdError> {
        // Stop the card clock, then check the card has released the bus.
        let mut ctl1 = self.read_reg32(EMMC_CONTROL1) & !CONTROL1_CLK_EN;
        self.write_reg32(EMMC_CONTROL1, ctl1);

        let dat = self.read_status_bits().dat_level();
        if dat != 0 {
            warn!("EMMC: DAT[3:0] did not settle to 0 (is {:#x})", dat);
            return Err(SdError::VoltageSwitch);
        }

        let ctl0 = self.read_reg32(EMMC_CONTROL0) | CONTROL0_BUS_POWER;
        self.write_reg32(EMMC_CONTROL0, ctl0);
        self.platform.delay_ms(5);

        if self.read_reg32(EMMC_CONTROL0) & CONTROL0_BUS_POWER == 0 {
            warn!("EMMC: controller did not keep 1.8V signalling enabled");
            return Err(SdError::VoltageSwitch);
        }

        ctl1 |= CONTROL1_CLK_EN;
        self.write_reg32(EMMC_CONTROL1, ctl1);
        self.platform.delay_ms(10);

        let dat = self.read_status_bits().dat_level();
        if dat != 0xf {
            warn!("EMMC: DAT[3:0] did not settle to 1111 (is {:#x})", dat);
            return Err(SdError::VoltageSwitch);
        }

        debug!("EMMC: voltage switch to 1.8V complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divider_matches_canonical_rates() {
        // 100 MHz base: identification, default and high-speed clocks
        assert_eq!(compute_divider(100_000_000, 400_000), Ok(128));
        assert_eq!(compute_divider(100_000_000, 25_000_000), Ok(2));
        assert_eq!(compute_divider(100_000_000, 50_000_000), Ok(1));
        // target at or above base bypasses the divider
        assert_eq!(compute_divider(50_000_000, 50_000_000), Ok(0));
        assert_eq!(compute_divider(50_000_000, 100_000_000), Ok(0));
    }

    #[test]
    fn divider_is_power_of_two_and_never_overshoots() {
        for &base in &[50_000_000u32, 100_000_000, 250_000_000] {
            for &target in &[400_000u32, 1_000_000, 12_345_678, 25_000_000, 52_000_000] {
                let field = compute_divider(base, target).unwrap();
                if field == 0 {
                    assert!(target >= base);
                    continue;
                }
                assert!(field.is_power_of_two(), "field {field} for {base}/{target}");
                assert!(field <= MAX_DIVIDER_FIELD);
                assert!(
                    base / (2 * field) <= target,
                    "{base}/(2*{field}) overshoots {target}"
                );
            }
        }
    }

    #[test]
    fn divider_clamps_to_ten_bits() {
        assert_eq!(compute_divider(250_000_000, 1), Ok(MAX_DIVIDER_FIELD));
    }

    #[test]
    fn divider_rejects_zero_rates() {
        assert_eq!(compute_divider(0, 400_000), Err(SdError::ClockFailed));
        assert_eq!(compute_divider(100_000_000, 0), Err(SdError::ClockFailed));
    }
}
