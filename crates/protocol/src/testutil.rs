//! Waveform synthesis shared by the decode tests: frame assembly, the
//! 500 kb/s transition-coded envelope, and carrier mixing.

use num_complex::Complex64;

use crate::crc::TAG_CRC;
use crate::pass::{FrameBits, FRAME_BITS};
use bitvec::prelude::*;

/// Quiet samples before the carrier turns on.
pub const LEAD_SILENCE: usize = 8;
/// Carrier-on run preceding the first frame bit; its trailing edge is the
/// mid-window falling edge the slicer syncs on.
pub const LEAD_IN: usize = 4;

fn set_field(bits: &mut FrameBits, start: usize, len: usize, value: u64) {
    for i in 0..len {
        bits.set(start + i, (value >> (len - 1 - i)) & 1 == 1);
    }
}

/// Assemble a 256-bit frame: header fields, pseudo-random padding, and a
/// trailing CRC-16 chosen so the whole frame checks to zero.
///
/// The padding is scrambled so the modulated envelope has no strong
/// periodic component that could raise spectral lines of its own.
pub fn build_frame(
    header: u8,
    tag_type: u8,
    app_id: u8,
    group_id: u8,
    agency_id: u8,
    serial_num: u32,
) -> FrameBits {
    let mut bits = bitarr![u8, Msb0; 0; FRAME_BITS];
    set_field(&mut bits, 0, 3, header as u64);
    set_field(&mut bits, 3, 3, tag_type as u64);
    set_field(&mut bits, 6, 3, app_id as u64);
    set_field(&mut bits, 9, 7, group_id as u64);
    set_field(&mut bits, 16, 7, agency_id as u64);
    set_field(&mut bits, 23, 24, serial_num as u64);

    // xorshift-scrambled padding between the serial number and the CRC.
    let mut state = 0x2545_f491_4f6c_dd1du64 ^ serial_num as u64;
    for i in 47..FRAME_BITS - 16 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        bits.set(i, state & 1 == 1);
    }

    let crc = TAG_CRC.checksum(&bits.as_raw_slice()[..(FRAME_BITS - 16) / 8]);
    set_field(&mut bits, FRAME_BITS - 16, 16, crc as u64);

    debug_assert_eq!(TAG_CRC.checksum(bits.as_raw_slice()), 0);
    bits
}

/// Expand a frame into its on-off envelope at `samples_per_bit` samples
/// per bit: a level transition at every bit boundary (falling for a one,
/// rising for a zero) plus a mid-cell return transition between equal
/// consecutive bits.
pub fn modulate(bits: &FrameBits, samples_per_bit: usize) -> Vec<f64> {
    let half = samples_per_bit / 2;
    let mut env = Vec::with_capacity(LEAD_SILENCE + LEAD_IN + FRAME_BITS * samples_per_bit);
    env.extend(std::iter::repeat(0.0).take(LEAD_SILENCE));
    env.extend(std::iter::repeat(1.0).take(LEAD_IN));

    for k in 0..FRAME_BITS {
        let bit = bits[k];
        // Level after this bit's boundary transition: a one falls, a zero
        // rises.
        let first = !bit;
        let next = if k + 1 < FRAME_BITS { bits[k + 1] } else { !bit };
        // Return mid-cell when the next boundary needs the same edge again.
        let second = if next == bit { !first } else { first };

        env.extend(std::iter::repeat(if first { 1.0 } else { 0.0 }).take(half));
        env.extend(
            std::iter::repeat(if second { 1.0 } else { 0.0 }).take(samples_per_bit - half),
        );
    }

    env
}

/// Mix an envelope onto a carrier `freq_hz` from the radio center with
/// the given starting phase, padded or cut to `len` samples.
pub fn mix(env: &[f64], len: usize, sample_rate: f64, freq_hz: f64, phase: f64) -> Vec<Complex64> {
    let dt = 1.0 / sample_rate;
    (0..len)
        .map(|i| {
            let e = env.get(i).copied().unwrap_or(0.0);
            Complex64::from_polar(
                e,
                2.0 * std::f64::consts::PI * freq_hz * i as f64 * dt + phase,
            )
        })
        .collect()
}
