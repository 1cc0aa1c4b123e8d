//! Scalar configuration for the hot-wire cutter driver.
//!
//! Persistence (reading/writing a settings file) is the embedding shell's
//! responsibility; this crate only defines the values and their defaults.

/// Tunable timings and limits for the driver. Constructed with
/// [`Default::default`] and overridden by the caller before
/// `ControlCore::new`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverConfig {
    /// Pause between consecutive outbound bytes, to accommodate firmwares
    /// with slow interrupt handlers. Zero means back-to-back writes.
    pub char_send_delay_us: u64,
    /// Interval between status poll (`?`) requests.
    pub polling_interval_ms: u64,
    /// How long the link may stay silent before the watchdog closes it.
    pub watchdog_delay_ms: u64,
    /// Delay after a hard reset before the link is considered re-initialized.
    pub hard_reset_delay_ms: u64,
    /// Interval between port discovery scan attempts.
    pub scan_interval_ms: u64,
    /// Maximum read attempts while waiting for a complete identity response.
    pub max_identity_attempts: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            char_send_delay_us: 0,
            polling_interval_ms: 1000,
            watchdog_delay_ms: 3000,
            hard_reset_delay_ms: 1000,
            scan_interval_ms: 1000,
            max_identity_attempts: 5,
        }
    }
}
