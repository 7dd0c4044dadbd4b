use serde::{Deserialize, Serialize};

use crate::{BeatlightError, Result};

/// Normalised biquad coefficients for
/// `y[n] = b0·x[n] + b1·x[n-1] + b2·x[n-2] − a1·y[n-1] − a2·y[n-2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoefficients {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl BiquadCoefficients {
    /// Second-order Butterworth low-pass used ahead of the FFT, unity gain
    /// at DC and a zero at Nyquist.
    pub const LOW_PASS: Self = Self {
        b0: 0.199_523_62,
        b1: 0.399_047_25,
        b2: 0.199_523_62,
        a1: -0.356_918_7,
        a2: 0.155_013_2,
    };

    /// Steady-state gain for a constant input.
    pub fn dc_gain(&self) -> f32 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }
}

/// Single-stage IIR filter in transposed direct form II.
///
/// The two-element delay line carries over between calls, so consecutive
/// frames are filtered as one continuous stream.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    coefficients: BiquadCoefficients,
    d1: f32,
    d2: f32,
}

impl Default for LowPassFilter {
    fn default() -> Self {
        Self::new(BiquadCoefficients::LOW_PASS)
    }
}

impl LowPassFilter {
    pub fn new(coefficients: BiquadCoefficients) -> Self {
        Self {
            coefficients,
            d1: 0.0,
            d2: 0.0,
        }
    }

    /// Filters `input` into `output`; both must have the same length.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        if input.len() != output.len() {
            return Err(BeatlightError::InvalidInput(
                "filter input and output lengths differ",
            ));
        }
        let BiquadCoefficients { b0, b1, b2, a1, a2 } = self.coefficients;
        for (x, y) in input.iter().zip(output.iter_mut()) {
            let out = b0 * x + self.d1;
            self.d1 = b1 * x - a1 * out + self.d2;
            self.d2 = b2 * x - a2 * out;
            *y = out;
        }
        Ok(())
    }

    /// Clears the delay line.
    pub fn reset(&mut self) {
        self.d1 = 0.0;
        self.d2 = 0.0;
    }

    pub fn coefficients(&self) -> &BiquadCoefficients {
        &self.coefficients
    }
}
