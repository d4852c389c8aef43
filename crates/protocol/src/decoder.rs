// Copyright 2025-2026 CEMAXECUTER LLC

use std::collections::HashMap;

use num_complex::Complex64;

use td_dsp::fft::ForwardFft;
use td_dsp::peaks::{self, Peak};

use crate::pass::Pass;
use crate::{us_to_sec, RecordSink, Wallclock};

/// Accumulations required before the first decode attempt. Below this the
/// summed SNR is rarely enough for clean slicing at 500 kb/s.
const DECODE_ROUNDS: u64 = 16;
/// Accumulations after which an undecoded pass is written off as a stable
/// noise peak and dropped.
const NOISE_ROUNDS: u64 = 32;

/// Per-capture pipeline and pass registry.
///
/// Owns the interval buffer the radio fills, the FFT plan and frequency
/// vector, and the map from DC-centered FFT bin to in-progress pass.
/// Successful decodes are appended to the sink exactly once.
pub struct Decoder<S: RecordSink> {
    center_freq: u64,
    sampling_rate: u64,
    interval_len: u64,
    /// Maximum age of an unseen pass before it is reaped, microseconds.
    max_age: u64,
    /// Samples the radio delivers per interrogation interval.
    samp_t_len: usize,
    fft: ForwardFft,
    /// Time-domain capture, zero-padded to the FFT length. The radio
    /// writes the first `samp_t_len` entries; the tail stays zero.
    in_vec: Vec<Complex64>,
    freq_vec: Vec<Complex64>,
    passes: HashMap<usize, Pass>,
    sink: S,
}

impl<S: RecordSink> Decoder<S> {
    pub fn new(
        center_freq: u64,
        sampling_rate: u64,
        interval_len_us: u64,
        max_age_us: u64,
        sink: S,
    ) -> Result<Self, String> {
        if sampling_rate == 0 {
            return Err("sampling rate must be positive".to_string());
        }
        if center_freq == 0 {
            return Err("center frequency must be positive".to_string());
        }

        let samp_t_len =
            (sampling_rate as f64 * us_to_sec(interval_len_us as f64)).round() as usize;
        if samp_t_len < 2 {
            return Err(format!(
                "interval of {} us at {} S/s is too short to demodulate",
                interval_len_us, sampling_rate
            ));
        }
        let fft_len = samp_t_len.next_power_of_two();

        log::info!("interval samples: {} FFT length: {}", samp_t_len, fft_len);
        log::info!("planning FFT...");
        let fft = ForwardFft::new(fft_len);
        log::info!("FFT planning is done, we are ready to roll");

        Ok(Self {
            center_freq,
            sampling_rate,
            interval_len: interval_len_us,
            max_age: max_age_us,
            samp_t_len,
            fft,
            in_vec: vec![Complex64::new(0.0, 0.0); fft_len],
            freq_vec: vec![Complex64::new(0.0, 0.0); fft_len],
            passes: HashMap::new(),
            sink,
        })
    }

    /// The interval buffer the radio fills before each capture is
    /// processed. Exactly the first M samples of the FFT input; the
    /// zero-padded tail is not exposed.
    pub fn input_buffer(&mut self) -> &mut [Complex64] {
        &mut self.in_vec[..self.samp_t_len]
    }

    /// Number of passes currently being tracked.
    pub fn active_passes(&self) -> usize {
        self.passes.len()
    }

    /// Iterate over the tracked passes.
    pub fn passes(&self) -> impl Iterator<Item = &Pass> + '_ {
        self.passes.values()
    }

    /// Run the pipeline over the current interval buffer: FFT, peak scan,
    /// per-peak accumulation and decode policy, then reap stale passes.
    /// `at` is the capture's wallclock in microseconds.
    pub fn process_capture(&mut self, at: Wallclock) -> Result<(), String> {
        self.fft.transform(&self.in_vec, &mut self.freq_vec);

        for peak in
            peaks::find_peaks(&self.freq_vec, self.sampling_rate, peaks::PEAK_THRESHOLD)
        {
            self.process_peak(&peak, at)?;
        }

        self.reap(at);
        Ok(())
    }

    fn process_peak(&mut self, peak: &Peak, at: Wallclock) -> Result<(), String> {
        let samp_t_len = self.samp_t_len;
        let sampling_rate = self.sampling_rate;
        let interval_len = self.interval_len;
        let center_freq = self.center_freq;

        let pass = self.passes.entry(peak.bin).or_insert_with(|| {
            log::info!(
                "found peak: bin {} at dF {:.1} Hz (f = {:.1} Hz)",
                peak.bin,
                peak.freq_hz,
                peak.freq_hz + center_freq as f64
            );
            Pass::new(peak.freq_hz, samp_t_len, sampling_rate, interval_len)
        });

        pass.accumulate(&self.in_vec[..samp_t_len], peak.value, at);

        if pass.measure_count() > NOISE_ROUNDS && !pass.is_decoded() {
            // Integrated long enough without a decode; this peak is noise.
            log::info!(
                "unable to decode after {} rounds, dropping bin {} as noise",
                pass.measure_count(),
                peak.bin
            );
            self.passes.remove(&peak.bin);
        } else if pass.measure_count() > DECODE_ROUNDS && !pass.is_decoded() && pass.decode()
        {
            pass.serialize(&mut self.sink)?;
        }

        Ok(())
    }

    /// Drop passes not sighted within the stale age.
    fn reap(&mut self, at: Wallclock) {
        let max_age = self.max_age;
        self.passes.retain(|bin, pass| {
            let stale = at.saturating_sub(pass.last_updated_at()) > max_age;
            if stale {
                log::info!(
                    "reaping pass at bin {} (dF {:.1} Hz, {} accumulations), it's out of date",
                    bin,
                    pass.center_freq_delta(),
                    pass.measure_count()
                );
            }
            !stale
        });
    }
}
