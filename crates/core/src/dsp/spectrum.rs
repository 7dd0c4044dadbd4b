use std::{fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{BeatlightError, Result};

/// Real-input FFT producing an `N/2` magnitude spectrum per frame.
///
/// Bin 0 and the two highest bins are forced to zero after the transform
/// to remove DC bleed and edge aliasing.
pub struct SpectrumAnalyzer {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    power: Vec<f32>,
}

impl SpectrumAnalyzer {
    /// Plans a transform for `frame_size` samples. The size must be even and
    /// at least 8 so the half spectrum has room for the zeroed edge bins.
    pub fn new(frame_size: usize) -> Result<Self> {
        if frame_size < 8 || frame_size % 2 != 0 {
            return Err(BeatlightError::InvalidInput(
                "spectrum frame size must be even and at least 8",
            ));
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(frame_size);
        let input = plan.make_input_vec();
        let spectrum = plan.make_output_vec();
        let scratch = plan.make_scratch_vec();
        Ok(Self {
            size: frame_size,
            plan,
            input,
            spectrum,
            scratch,
            power: vec![0.0; frame_size / 2],
        })
    }

    pub fn frame_size(&self) -> usize {
        self.size
    }

    /// Length of the spectrum returned by [`process`](Self::process).
    pub fn bins(&self) -> usize {
        self.size / 2
    }

    /// Transforms one frame and returns its magnitude spectrum.
    pub fn process(&mut self, frame: &[f32]) -> Result<&[f32]> {
        if frame.len() != self.size {
            return Err(BeatlightError::InvalidInput(
                "frame length does not match the planned spectrum size",
            ));
        }

        self.input.copy_from_slice(frame);
        self.plan
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)?;

        for (power, bin) in self.power.iter_mut().zip(self.spectrum.iter()) {
            *power = bin.norm();
        }

        let half = self.bins();
        self.power[0] = 0.0;
        self.power[half - 1] = 0.0;
        self.power[half - 2] = 0.0;
        Ok(&self.power)
    }

    /// Spectrum of the most recent frame.
    pub fn last(&self) -> &[f32] {
        &self.power
    }
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn zeroes_dc_and_top_bins_for_any_input() {
        let mut analyzer = SpectrumAnalyzer::new(64).unwrap();
        let inputs: [Vec<f32>; 3] = [
            vec![1.0; 64],
            (0..64).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect(),
            (0..64).map(|i| ((i * 37) % 13) as f32 - 6.0).collect(),
        ];
        for input in inputs {
            let power = analyzer.process(&input).unwrap();
            assert_eq!(power.len(), 32);
            assert_eq!(power[0], 0.0);
            assert_eq!(power[31], 0.0);
            assert_eq!(power[30], 0.0);
        }
    }

    #[test]
    fn locates_tone_bin() {
        let mut analyzer = SpectrumAnalyzer::new(128).unwrap();
        let cycles = 10.0;
        let input: Vec<f32> = (0..128)
            .map(|i| (2.0 * PI * cycles * i as f32 / 128.0).sin())
            .collect();
        let power = analyzer.process(&input).unwrap();

        let (peak, value) = power
            .iter()
            .enumerate()
            .fold((0, 0.0_f32), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });
        assert_eq!(peak, 10);
        assert_relative_eq!(value, 64.0, max_relative = 1e-3);
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(SpectrumAnalyzer::new(6).is_err());
        assert!(SpectrumAnalyzer::new(63).is_err());
        let mut analyzer = SpectrumAnalyzer::new(16).unwrap();
        assert!(analyzer.process(&[0.0; 15]).is_err());
    }
}
