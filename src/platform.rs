//! Board services the driver depends on.
//!
//! The protocol engine and the register backends never touch timers, power
//! or clock management hardware directly. Everything environment-specific
//! goes through [`Platform`], so the same driver runs under different
//! firmwares by swapping one implementation.

/// Clock domains the driver asks the platform about.
///
/// The SDHCI-style controller derives its SD clock from the EMMC base
/// clock; the PIO controller divides the core clock instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDomain {
    /// Base clock feeding the SDHCI-style controller.
    Emmc,
    /// VPU core clock feeding the PIO controller.
    Core,
}

/// Environment hooks: time, delays, clocks, power and indicator I/O.
///
/// Implementations may sleep or yield inside [`delay_us`]; the driver only
/// requires that at least the requested time passes. The tick counter must
/// be monotonic for the lifetime of the driver.
///
/// [`delay_us`]: Platform::delay_us
pub trait Platform {
    /// Monotonic microsecond counter.
    fn micros(&self) -> u64;

    /// Wait at least `us` microseconds.
    fn delay_us(&self, us: u32);

    /// Wait at least `ms` milliseconds.
    fn delay_ms(&self, ms: u32) {
        self.delay_us(ms.saturating_mul(1000));
    }

    /// Rate of the given clock domain in Hz, or 0 if unknown.
    fn clock_rate(&self, domain: ClockDomain) -> u32;

    /// Request card power. Returns false if the supply is absent or the
    /// request was refused.
    fn power_on(&self) -> bool;

    /// Entered before a burst of register accesses.
    fn peripheral_entry(&self) {}

    /// Left after a burst of register accesses.
    fn peripheral_exit(&self) {}

    /// Activity indicator around block transfers.
    fn activity_led(&self, _on: bool) {}
}

/// Deadline helper for bounded register polling.
///
/// ```ignore
/// let timeout = Timeout::from_ms(platform, 100);
/// while !done() {
///     if timeout.is_expired() {
///         return Err(SdError::Timeout);
///     }
///     core::hint::spin_loop();
/// }
/// ```
pub struct Timeout<'p, P: Platform + ?Sized> {
    platform: &'p P,
    start: u64,
    duration_us: u64,
}

impl<'p, P: Platform + ?Sized> Timeout<'p, P> {
    /// Start a deadline `us` microseconds from now.
    pub fn from_us(platform: &'p P, us: u32) -> Self {
        Self {
            platform,
            start: platform.micros(),
            duration_us: us as u64,
        }
    }

    /// Start a deadline `ms` milliseconds from now.
    pub fn from_ms(platform: &'p P, ms: u32) -> Self {
        Self::from_us(platform, ms.saturating_mul(1000))
    }

    /// True once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.platform.micros().wrapping_sub(self.start) >= self.duration_us
    }

    /// Microseconds spent since the deadline was armed.
    pub fn elapsed_us(&self) -> u64 {
        self.platform.micros().wrapping_sub(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockPlatform;

    #[test]
    fn timeout_expires_after_duration() {
        let platform = MockPlatform::new();
        let timeout = Timeout::from_us(&platform, 100);
        assert!(!timeout.is_expired());
        platform.advance_us(50);
        assert!(!timeout.is_expired());
        platform.advance_us(51);
        assert!(timeout.is_expired());
    }

    #[test]
    fn timeout_from_ms_scales() {
        let platform = MockPlatform::new();
        let timeout = Timeout::from_ms(&platform, 2);
        platform.advance_us(1999);
        assert!(!timeout.is_expired());
        platform.advance_us(10);
        assert!(timeout.is_expired());
    }

    #[test]
    fn delay_advances_mock_clock() {
        let platform = MockPlatform::new();
        let t0 = platform.micros();
        platform.delay_ms(3);
        assert!(platform.micros() - t0 >= 3000);
    }
}
