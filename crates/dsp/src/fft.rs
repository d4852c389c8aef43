use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Forward transform of one zero-padded interrogation interval.
///
/// The capture window is shorter than a power of two, so the decoder
/// keeps an `N`-length input buffer whose tail stays zero and reads the
/// spectrum out of a second buffer of the same length. The rustfft plan
/// and its scratch space are built once at startup; nothing allocates
/// per capture.
pub struct ForwardFft {
    fft: Arc<dyn Fft<f64>>,
    size: usize,
    scratch: Vec<Complex64>,
}

impl ForwardFft {
    /// Plan a forward complex-to-complex transform of length `size`,
    /// the capture length rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch = vec![Complex64::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        Self { fft, size, scratch }
    }

    /// Fill `freq_out` with the spectrum of `input`.
    ///
    /// `input` is left untouched: the time-domain capture is still
    /// needed afterwards for coherent accumulation, so the samples are
    /// staged into `freq_out` and transformed there.
    pub fn transform(&mut self, input: &[Complex64], freq_out: &mut [Complex64]) {
        assert_eq!(input.len(), self.size, "capture is not the planned length");
        assert_eq!(
            freq_out.len(),
            self.size,
            "spectrum buffer is not the planned length"
        );
        freq_out.copy_from_slice(input);
        self.fft.process_with_scratch(freq_out, &mut self.scratch);
    }
}
