pub mod crc;
pub mod decoder;
pub mod pass;

#[cfg(test)]
pub(crate) mod testutil;

/// Microseconds since the UNIX epoch.
pub type Wallclock = u64;

/// Convert a duration in microseconds to seconds.
pub fn us_to_sec(us: f64) -> f64 {
    us / 1_000_000.0
}

/// Append-only sink receiving one record line per decoded pass.
pub trait RecordSink {
    fn append(&mut self, line: &str) -> Result<(), String>;
}
