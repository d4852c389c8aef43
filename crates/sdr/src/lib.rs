// Copyright 2025-2026 CEMAXECUTER LLC

#[cfg(feature = "uhd")]
pub mod usrp;

use num_complex::Complex64;

/// One-time radio configuration for the interrogation cycle.
#[derive(Debug, Clone)]
pub struct RadioConfig {
    /// UHD device address arguments, e.g. "serial=31eb042". Empty picks
    /// the first device found.
    pub device: String,
    /// Receive center frequency in Hz. Transmit is tuned above this.
    pub center_freq: u64,
    pub tx_port: String,
    pub rx_port: String,
    pub tx_ant: String,
    pub rx_ant: String,
    /// TX and RX sample rate in S/s (always equal).
    pub sample_rate: u64,
    pub tx_gain: f64,
    pub rx_gain: f64,
    /// Receive gather window per interrogation, microseconds.
    pub interval_len_us: u64,
    /// Activation pulse length, microseconds.
    pub activation_len_us: u64,
    /// Report the GPS PPS time source state at startup.
    pub use_gps_pps: bool,
}

/// A radio able to fire a timed activation pulse and gather the reply.
pub trait Interrogator {
    /// Schedule one activation pulse roughly `spacing_us` microseconds
    /// from now, then capture exactly `target.len()` samples into
    /// `target` starting shortly after the pulse ends. Returns the
    /// capture start time as wallclock microseconds.
    fn arm_and_fire(&mut self, target: &mut [Complex64], spacing_us: u64) -> Result<u64, String>;
}
