use std::f32::consts::PI;

use super::AdcDriver;
use crate::AdcError;

const ADC_BITS: u32 = 12;
const VREF_UV: i64 = 3_300_000;

/// Host stand-in for the analog front end.
///
/// Produces a 12-bit biased signal made of a quiet carrier tone plus a
/// decaying low-frequency "kick" burst at a fixed tempo.
#[derive(Debug, Clone)]
pub struct SyntheticAdc {
    sample_rate_hz: f32,
    bpm: f32,
    carrier_hz: f32,
    kick_hz: f32,
    carrier_amplitude: f32,
    kick_amplitude: f32,
    index: u64,
    fail_every: Option<u64>,
}

impl SyntheticAdc {
    pub fn new(sample_rate_hz: u32, bpm: f32) -> Self {
        Self {
            sample_rate_hz: sample_rate_hz.max(1) as f32,
            bpm: bpm.max(1.0),
            carrier_hz: 440.0,
            kick_hz: 60.0,
            carrier_amplitude: 0.01,
            kick_amplitude: 0.1,
            index: 0,
            fail_every: None,
        }
    }

    /// Makes every `n`-th read fail, to exercise fault handling.
    pub fn with_read_faults(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn samples_read(&self) -> u64 {
        self.index
    }

    /// Normalised signal in `[-1, 1]` at sample `index`.
    fn signal(&self, index: u64) -> f32 {
        let t = index as f32 / self.sample_rate_hz;
        let beat_period = 60.0 / self.bpm;
        let since_beat = t % beat_period;
        let envelope = (-since_beat * 25.0).exp();
        let kick = self.kick_amplitude * envelope * (2.0 * PI * self.kick_hz * since_beat).sin();
        let carrier = self.carrier_amplitude * (2.0 * PI * self.carrier_hz * t).sin();
        (kick + carrier).clamp(-1.0, 1.0)
    }
}

impl AdcDriver for SyntheticAdc {
    fn read_raw(&mut self) -> Result<i32, AdcError> {
        let index = self.index;
        self.index += 1;
        if let Some(n) = self.fail_every {
            if (index + 1) % n == 0 {
                return Err(AdcError::Read(-5));
            }
        }
        let full_scale = ((1u32 << ADC_BITS) - 1) as f32;
        let code = (self.signal(index) * 0.5 + 0.5) * full_scale;
        Ok(code.round() as i32)
    }

    fn raw_to_microvolts(&self, raw: i32) -> Result<i32, AdcError> {
        if raw < 0 || raw >= (1 << ADC_BITS) {
            return Err(AdcError::Conversion(raw));
        }
        Ok((raw as i64 * VREF_UV / (1 << ADC_BITS) as i64) as i32)
    }
}
