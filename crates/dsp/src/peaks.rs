// Copyright 2025-2026 CEMAXECUTER LLC

use num_complex::Complex64;

/// Minimum FFT magnitude for a bin to count as a transponder response.
pub const PEAK_THRESHOLD: f64 = 500.0;

/// A strict local maximum in the magnitude spectrum.
#[derive(Debug, Clone)]
pub struct Peak {
    /// DC-centered bin index: `(i + N/2) mod N` of the raw FFT index.
    pub bin: usize,
    /// Offset from the radio center frequency, in Hz. May be negative.
    pub freq_hz: f64,
    /// Raw FFT output at the maximum, used downstream as the phase
    /// estimate for coherent accumulation.
    pub value: Complex64,
}

/// Scan a frequency vector for local maxima above `threshold`.
///
/// A peak at raw index `i` requires `|v[i]|` to be strictly greater than
/// both neighbors, so plateaus never qualify and ties are impossible. The
/// first and last bins have only one neighbor and are never peaks.
pub fn find_peaks(freq_vec: &[Complex64], sample_rate: u64, threshold: f64) -> Vec<Peak> {
    let n = freq_vec.len();
    let mut peaks = Vec::new();
    if n < 3 {
        return peaks;
    }

    for i in 1..n - 1 {
        let below = freq_vec[i - 1].norm();
        let here = freq_vec[i].norm();
        let above = freq_vec[i + 1].norm();

        if here > below && here > above && here > threshold {
            // The reported bin is rotated by half the FFT length so that
            // the spectrum reads DC-centered.
            let bin = (i + n / 2) % n;
            let freq_hz =
                bin as f64 * sample_rate as f64 / n as f64 - sample_rate as f64 / 2.0;
            peaks.push(Peak {
                bin,
                freq_hz,
                value: freq_vec[i],
            });
        }
    }

    peaks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum_with(magnitudes: &[(usize, f64)], n: usize) -> Vec<Complex64> {
        let mut v = vec![Complex64::new(0.0, 0.0); n];
        for &(i, mag) in magnitudes {
            v[i] = Complex64::new(mag, 0.0);
        }
        v
    }

    #[test]
    fn test_single_peak() {
        let n = 1024;
        let spec = spectrum_with(&[(100, 800.0)], n);
        let peaks = find_peaks(&spec, 3_000_000, PEAK_THRESHOLD);
        assert_eq!(peaks.len(), 1);

        let p = &peaks[0];
        assert_eq!(p.bin, (100 + n / 2) % n);
        let expected =
            p.bin as f64 * 3_000_000.0 / n as f64 - 1_500_000.0;
        assert!((p.freq_hz - expected).abs() < 1e-9);
        assert_eq!(p.value, Complex64::new(800.0, 0.0));
    }

    #[test]
    fn test_below_threshold_ignored() {
        let spec = spectrum_with(&[(50, 499.9)], 256);
        assert!(find_peaks(&spec, 3_000_000, PEAK_THRESHOLD).is_empty());
    }

    #[test]
    fn test_plateau_is_not_a_peak() {
        // Equal neighbors fail the strict comparison on both sides.
        let spec = spectrum_with(&[(50, 800.0), (51, 800.0)], 256);
        assert!(find_peaks(&spec, 3_000_000, PEAK_THRESHOLD).is_empty());
    }

    #[test]
    fn test_edges_never_peak() {
        let n = 256;
        let spec = spectrum_with(&[(0, 900.0), (n - 1, 900.0)], n);
        assert!(find_peaks(&spec, 3_000_000, PEAK_THRESHOLD).is_empty());
    }

    #[test]
    fn test_empty_spectrum() {
        let spec = vec![Complex64::new(0.0, 0.0); 2048];
        assert!(find_peaks(&spec, 3_000_000, PEAK_THRESHOLD).is_empty());
    }

    #[test]
    fn test_bin_rotation_round_trips() {
        // Rotating a physical bin by N/2 and back lands on itself for
        // every bin of an even-length spectrum.
        let n = 2048usize;
        for bin in 0..n {
            let raw = (bin + n / 2) % n;
            assert_eq!((raw + n / 2) % n, bin);
        }
    }

    #[test]
    fn test_negative_frequency_reported() {
        let n = 2048;
        // Raw index just above N/2 sits just above the negative Nyquist
        // edge once rotated.
        let spec = spectrum_with(&[(n / 2 + 1, 700.0)], n);
        let peaks = find_peaks(&spec, 3_000_000, PEAK_THRESHOLD);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].bin, 1);
        assert!(peaks[0].freq_hz < 0.0, "expected a negative offset");
    }
}
