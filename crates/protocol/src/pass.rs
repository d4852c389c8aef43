// Copyright 2025-2026 CEMAXECUTER LLC

use std::collections::VecDeque;

use bitvec::prelude::*;
use chrono::{DateTime, Utc};
use num_complex::Complex64;
use serde::Serialize;

use crate::crc::TAG_CRC;
use crate::{us_to_sec, RecordSink, Wallclock};

/// Length of a tag reply frame, in bits.
pub const FRAME_BITS: usize = 256;
/// Transponder symbol rate, bits per second.
pub const SYMBOL_RATE: u64 = 500_000;
/// Length of the slice window used for transition detection.
const SLICE_WINDOW: usize = 4;

/// MSB-first bit storage for one frame; the backing bytes are fed to the
/// CRC directly.
pub type FrameBits = BitArr!(for FRAME_BITS, in u8, Msb0);

/// One candidate transponder response, tracked across repeated
/// interrogations until it decodes, proves to be noise, or goes stale.
pub struct Pass {
    /// Offset between the radio center frequency and this pass, in Hz.
    center_freq_delta: f64,
    /// Recovered frame bits; meaningful only once `decoded` is set.
    raw_data: FrameBits,
    /// Per-sample complex exponentials shifting this pass to baseband.
    baseband_shift: Vec<Complex64>,
    /// Coherent sum of every capture attributed to this pass.
    accumulated: Vec<Complex64>,
    /// Number of captures folded into the accumulator.
    nr_acc: u64,
    /// Wallclock of the most recent sighting, microseconds.
    last_at: Wallclock,
    samples_per_bit: usize,
    decoded: bool,

    header: u8,
    tag_type: u8,
    app_id: u8,
    group_id: u8,
    agency_id: u8,
    serial_num: u32,
}

impl Pass {
    /// Create state for a fresh candidate at `center_freq_delta` Hz from
    /// the radio center. Precomputes the baseband mixer for the interval.
    pub fn new(
        center_freq_delta: f64,
        samples_per_interval: usize,
        sampling_rate: u64,
        interval_len_us: u64,
    ) -> Self {
        debug_assert!(samples_per_interval > 1);

        let time_delta =
            us_to_sec(interval_len_us as f64) / (samples_per_interval - 1) as f64;
        let baseband_shift = (0..samples_per_interval)
            .map(|i| {
                Complex64::from_polar(
                    1.0,
                    -2.0 * std::f64::consts::PI * center_freq_delta * i as f64 * time_delta,
                )
            })
            .collect();

        Self {
            center_freq_delta,
            raw_data: bitarr![u8, Msb0; 0; FRAME_BITS],
            baseband_shift,
            accumulated: vec![Complex64::new(0.0, 0.0); samples_per_interval],
            nr_acc: 0,
            last_at: 0,
            samples_per_bit: (sampling_rate / SYMBOL_RATE) as usize,
            decoded: false,
            header: 0,
            tag_type: 0,
            app_id: 0,
            group_id: 0,
            agency_id: 0,
            serial_num: 0,
        }
    }

    /// Fold one capture into the coherent sum.
    ///
    /// Dividing by the FFT peak normalizes the transmit phase so that
    /// repeated bursts add constructively instead of cancelling; the
    /// baseband mixer then centers the candidate at 0 Hz.
    pub fn accumulate(&mut self, sig: &[Complex64], est_phase: Complex64, at: Wallclock) {
        // A decoded pass is frozen; sightings still refresh its age so it
        // is not reaped while the vehicle is in view.
        if self.decoded {
            self.last_at = at;
            return;
        }

        assert_eq!(
            sig.len(),
            self.accumulated.len(),
            "capture length does not match the interval"
        );

        for i in 0..self.accumulated.len() {
            self.accumulated[i] += sig[i] / est_phase * self.baseband_shift[i];
        }

        self.nr_acc += 1;
        self.last_at = at;
    }

    /// Attempt to slice and frame the accumulated waveform. Returns true
    /// once a full 256-bit frame with a passing CRC has been recovered;
    /// the recovered fields are then available through the getters.
    pub fn decode(&mut self) -> bool {
        let mean = self.accumulated.iter().map(|v| v.norm()).sum::<f64>()
            / self.accumulated.len() as f64;
        if mean == 0.0 {
            // Nothing has been accumulated; an all-zero buffer cannot slice.
            return false;
        }

        let norm: Vec<i8> = self
            .accumulated
            .iter()
            .map(|v| if v.norm() - mean > 0.0 { 1 } else { -1 })
            .collect();

        let mut win: VecDeque<i8> = VecDeque::with_capacity(SLICE_WINDOW);
        let mut bit_id = 0usize;
        let mut skip = 0usize;
        let mut found_start = false;

        for &slice in &norm {
            if bit_id >= FRAME_BITS {
                break;
            }

            if win.len() == SLICE_WINDOW {
                win.pop_front();
            }
            win.push_back(slice);
            if win.len() < SLICE_WINDOW {
                continue;
            }

            if skip > 0 {
                skip -= 1;
                continue;
            }

            if !found_start {
                // Frame sync: a falling edge dead center in the window.
                if let Some((offset, bit)) = find_transition(&win) {
                    if offset == SLICE_WINDOW / 2 && bit {
                        found_start = true;
                        self.raw_data.set(bit_id, true);
                        bit_id += 1;
                        skip = self.samples_per_bit.saturating_sub(1);
                    }
                }
            } else {
                // A tracking window with no visible transition slices high.
                let (offset, bit) = find_transition(&win).unwrap_or((0, true));
                // Re-center the bit clock on the detected transition.
                skip = (self.samples_per_bit + offset)
                    .saturating_sub(SLICE_WINDOW / 2 + 1);
                self.raw_data.set(bit_id, bit);
                bit_id += 1;
            }
        }

        if bit_id == FRAME_BITS {
            self.header = self.field(0, 3) as u8;
            self.tag_type = self.field(3, 3) as u8;
            self.app_id = self.field(6, 3) as u8;
            self.group_id = self.field(9, 7) as u8;
            self.agency_id = self.field(16, 7) as u8;
            self.serial_num = self.field(23, 24) as u32;
            self.decoded = TAG_CRC.checksum(self.raw_data.as_raw_slice()) == 0;
        }

        self.decoded
    }

    /// Extract `len` bits starting at `start`, MSB first.
    fn field(&self, start: usize, len: usize) -> u64 {
        self.raw_data[start..start + len]
            .iter()
            .by_vals()
            .fold(0, |acc, bit| (acc << 1) | u64::from(bit))
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    /// Number of captures accumulated into this pass.
    pub fn measure_count(&self) -> u64 {
        self.nr_acc
    }

    /// Wallclock of the most recent sighting, microseconds.
    pub fn last_updated_at(&self) -> Wallclock {
        self.last_at
    }

    /// Offset from the radio center frequency, in Hz.
    pub fn center_freq_delta(&self) -> f64 {
        self.center_freq_delta
    }

    pub fn header(&self) -> u8 {
        self.header
    }

    pub fn tag_type(&self) -> u8 {
        self.tag_type
    }

    pub fn app_id(&self) -> u8 {
        self.app_id
    }

    pub fn group_id(&self) -> u8 {
        self.group_id
    }

    pub fn agency_id(&self) -> u8 {
        self.agency_id
    }

    pub fn serial_number(&self) -> u32 {
        self.serial_num
    }

    /// Render this pass as its output record.
    pub fn record(&self, seen_at: DateTime<Utc>) -> Record {
        if self.decoded {
            Record::Decoded(DecodedRecord {
                pass_header: self.header,
                tag_type: self.tag_type,
                app_id: self.app_id,
                group_id: self.group_id,
                agency_id: self.agency_id,
                serial_num: self.serial_num,
                last_seen_at: self.last_at,
                nr_samples: self.nr_acc,
                center_freq_delta: self.center_freq_delta,
                seen_at: seen_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            })
        } else {
            Record::Pending(PendingRecord {
                decoded: false,
                last_seen_at: self.last_at,
                nr_samples: self.nr_acc,
                center_freq_delta: self.center_freq_delta,
            })
        }
    }

    /// Append this pass's record to the sink as a single JSON line.
    pub fn serialize<S: RecordSink>(&self, sink: &mut S) -> Result<(), String> {
        let line = serde_json::to_string(&self.record(Utc::now()))
            .map_err(|e| format!("record serialization failed: {}", e))?;
        sink.append(&line)
    }
}

/// Locate the first transition in the slice window. Returns the
/// post-transition window index and the bit it encodes: a falling edge is
/// a one, a rising edge a zero.
fn find_transition(win: &VecDeque<i8>) -> Option<(usize, bool)> {
    let mut last = *win.front()?;
    for (i, &v) in win.iter().enumerate().skip(1) {
        if last != v {
            return Some((i, last > v));
        }
        last = v;
    }
    None
}

/// Record emitted for a successfully decoded pass.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedRecord {
    pub pass_header: u8,
    pub tag_type: u8,
    pub app_id: u8,
    pub group_id: u8,
    pub agency_id: u8,
    pub serial_num: u32,
    pub last_seen_at: Wallclock,
    pub nr_samples: u64,
    pub center_freq_delta: f64,
    pub seen_at: String,
}

/// Record form for a pass that has not decoded.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    pub decoded: bool,
    pub last_seen_at: Wallclock,
    pub nr_samples: u64,
    pub center_freq_delta: f64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Record {
    Decoded(DecodedRecord),
    Pending(PendingRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use chrono::TimeZone;

    const RATE: u64 = 3_000_000;
    const INTERVAL_US: u64 = 580;
    const M: usize = 1740;
    const SPB: usize = 6;

    fn baseband_pass() -> Pass {
        Pass::new(0.0, M, RATE, INTERVAL_US)
    }

    fn golden_signal() -> Vec<Complex64> {
        let frame = testutil::build_frame(5, 2, 0, 0x12, 0x34, 0x5678ab);
        let env = testutil::modulate(&frame, SPB);
        assert!(env.len() <= M, "waveform must fit the interval");
        testutil::mix(&env, M, RATE as f64, 0.0, 0.0)
    }

    #[test]
    fn test_mixer_and_accumulator_lengths_match() {
        let pass = Pass::new(-250_000.0, M, RATE, INTERVAL_US);
        assert_eq!(pass.baseband_shift.len(), M);
        assert_eq!(pass.accumulated.len(), M);
    }

    #[test]
    fn test_decode_golden_frame() {
        let sig = golden_signal();
        let mut pass = baseband_pass();
        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 1_000);

        assert!(pass.decode(), "golden frame must decode");
        assert!(pass.is_decoded());
        assert_eq!(pass.header(), 5);
        assert_eq!(pass.tag_type(), 2);
        assert_eq!(pass.app_id(), 0);
        assert_eq!(pass.group_id(), 0x12);
        assert_eq!(pass.agency_id(), 0x34);
        assert_eq!(pass.serial_number(), 0x5678ab);
    }

    #[test]
    fn test_decode_survives_phase_scrambled_captures() {
        // Each burst arrives with an arbitrary carrier phase; normalizing
        // by the per-capture phase estimate keeps the sum coherent.
        let frame = testutil::build_frame(5, 2, 0, 0x12, 0x34, 0x5678ab);
        let env = testutil::modulate(&frame, SPB);

        let mut pass = baseband_pass();
        for k in 0..17u64 {
            let phase = 0.37 * k as f64;
            let sig = testutil::mix(&env, M, RATE as f64, 0.0, phase);
            let est = Complex64::from_polar(1.0, phase);
            pass.accumulate(&sig, est, 1_000 + k);
        }

        assert_eq!(pass.measure_count(), 17);
        assert!(pass.decode(), "phase-normalized sum must still decode");
        assert_eq!(pass.serial_number(), 0x5678ab);
    }

    #[test]
    fn test_all_zero_buffer_fails_gracefully() {
        let mut pass = baseband_pass();
        assert!(!pass.decode());
        assert!(!pass.is_decoded());
        assert_eq!(pass.header(), 0);
        assert_eq!(pass.serial_number(), 0);
    }

    #[test]
    fn test_constant_carrier_never_syncs() {
        let env = vec![1.0; M];
        let sig = testutil::mix(&env, M, RATE as f64, 0.0, 0.0);
        let mut pass = baseband_pass();
        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 1_000);
        assert!(!pass.decode(), "a flat carrier has no transitions to sync on");
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let mut frame = testutil::build_frame(5, 2, 0, 0x12, 0x34, 0x5678ab);
        // Corrupt a padding bit after the trailing CRC was computed.
        let flipped = !frame[100];
        frame.set(100, flipped);
        let env = testutil::modulate(&frame, SPB);
        let sig = testutil::mix(&env, M, RATE as f64, 0.0, 0.0);

        let mut pass = baseband_pass();
        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 1_000);
        assert!(!pass.decode(), "corrupted frame must fail the CRC");
        assert!(!pass.is_decoded());
    }

    #[test]
    fn test_truncated_waveform_fails_gracefully() {
        // A frame cut off mid-air produces fewer than 256 bits and must
        // fail without running off the end of the buffer.
        let short = 600;
        let frame = testutil::build_frame(5, 2, 0, 0x12, 0x34, 0x5678ab);
        let env = testutil::modulate(&frame, SPB);
        let sig = testutil::mix(&env[..short], short, RATE as f64, 0.0, 0.0);

        let mut pass = Pass::new(0.0, short, RATE, 200);
        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 1_000);
        assert!(!pass.decode());
    }

    #[test]
    fn test_accumulate_tracks_count_and_age() {
        let sig = golden_signal();
        let mut pass = baseband_pass();
        assert_eq!(pass.measure_count(), 0);

        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 5_000);
        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 6_000);
        assert_eq!(pass.measure_count(), 2);
        assert_eq!(pass.last_updated_at(), 6_000);
    }

    #[test]
    fn test_accumulate_is_frozen_after_decode() {
        let sig = golden_signal();
        let mut pass = baseband_pass();
        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 1_000);
        assert!(pass.decode());

        let before = pass.accumulated.clone();
        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 2_000);
        assert_eq!(pass.measure_count(), 1, "count must freeze after decode");
        assert_eq!(pass.last_updated_at(), 2_000, "age still refreshes");
        for (a, b) in before.iter().zip(pass.accumulated.iter()) {
            assert_eq!(a, b, "accumulator must not change after decode");
        }
    }

    #[test]
    fn test_decoded_record_layout() {
        let sig = golden_signal();
        let mut pass = baseband_pass();
        pass.accumulate(&sig, Complex64::new(1.0, 0.0), 1_000);
        assert!(pass.decode());

        let seen = Utc.with_ymd_and_hms(2018, 6, 1, 12, 0, 0).unwrap();
        let line = serde_json::to_string(&pass.record(seen)).unwrap();
        assert_eq!(
            line,
            "{\"passHeader\":5,\"tagType\":2,\"appId\":0,\"groupId\":18,\
             \"agencyId\":52,\"serialNum\":5666987,\"lastSeenAt\":1000,\
             \"nrSamples\":1,\"centerFreqDelta\":0.0,\
             \"seenAt\":\"2018-06-01 12:00:00\"}"
        );
    }

    #[test]
    fn test_pending_record_layout() {
        let pass = Pass::new(-1250.5, M, RATE, INTERVAL_US);
        let seen = Utc.with_ymd_and_hms(2018, 6, 1, 12, 0, 0).unwrap();
        let line = serde_json::to_string(&pass.record(seen)).unwrap();
        assert_eq!(
            line,
            "{\"decoded\":false,\"lastSeenAt\":0,\"nrSamples\":0,\
             \"centerFreqDelta\":-1250.5}"
        );
    }

    #[test]
    fn test_find_transition_directions() {
        let falling: VecDeque<i8> = [1, 1, -1, -1].into_iter().collect();
        assert_eq!(find_transition(&falling), Some((2, true)));

        let rising: VecDeque<i8> = [-1, -1, 1, 1].into_iter().collect();
        assert_eq!(find_transition(&rising), Some((2, false)));

        let late: VecDeque<i8> = [1, 1, 1, -1].into_iter().collect();
        assert_eq!(find_transition(&late), Some((3, true)));

        let flat: VecDeque<i8> = [1, 1, 1, 1].into_iter().collect();
        assert_eq!(find_transition(&flat), None);
    }
}
