use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::dsp::{build_strategy, BeatStrategy};
use crate::events::BEAT_BANDS;
use crate::{BeatlightError, Result};

/// Summary of a finished offline analysis.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AnalysisSummary {
    pub sample_rate: u32,
    pub strategy: String,
    pub frames: usize,
    pub duration_seconds: f32,
    pub tempo_bpm: Option<f32>,
}

/// One detected beat, stamped at the end of the frame it was found in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BeatMark {
    pub time: f32,
    pub bands: [bool; BEAT_BANDS],
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BeatReport {
    pub summary: AnalysisSummary,
    pub beats: Vec<BeatMark>,
}

/// Runs a recorded signal through the same frame pipeline as the live path:
/// fixed-size frames, mean removed, then the configured beat strategy.
pub struct BeatAnalysis {
    sample_rate: u32,
    frame_size: usize,
    holdoff: Duration,
    strategy: Box<dyn BeatStrategy>,
    pending: Vec<f32>,
    frames: usize,
    beats: Vec<BeatMark>,
}

impl BeatAnalysis {
    /// Validates `config` before building the strategy; a zero sample rate
    /// is rejected as well.
    pub fn new(config: &AppConfig, sample_rate: u32) -> Result<Self> {
        config.validate()?;
        if sample_rate == 0 {
            return Err(BeatlightError::InvalidInput(
                "analysis requires a non-zero sample rate",
            ));
        }
        let frame_size = config.sampling.frame_size;
        Ok(Self {
            sample_rate,
            frame_size,
            holdoff: Duration::from_millis(u64::from(config.render.beat_holdoff_ms)),
            strategy: build_strategy(config, sample_rate)?,
            pending: Vec::with_capacity(frame_size),
            frames: 0,
            beats: Vec::new(),
        })
    }

    /// Consumes mono samples. Returns the number of beats found in the
    /// frames completed by this call.
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<usize> {
        let mut found = 0;
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                if self.process_pending()? {
                    found += 1;
                }
                self.pending.clear();
            }
        }
        Ok(found)
    }

    fn process_pending(&mut self) -> Result<bool> {
        let mean = self.pending.iter().sum::<f32>() / self.frame_size as f32;
        self.pending.iter_mut().for_each(|sample| *sample -= mean);

        self.frames += 1;
        let Some(bands) = self.strategy.process(&self.pending)? else {
            return Ok(false);
        };
        let time = (self.frames * self.frame_size) as f32 / self.sample_rate as f32;
        self.beats.push(BeatMark { time, bands });
        Ok(true)
    }

    pub fn beats(&self) -> &[BeatMark] {
        &self.beats
    }

    /// Finishes the analysis. A trailing partial frame is discarded.
    pub fn finish(self) -> BeatReport {
        let duration_seconds = (self.frames * self.frame_size) as f32 / self.sample_rate as f32;
        let summary = AnalysisSummary {
            sample_rate: self.sample_rate,
            strategy: self.strategy.name().to_owned(),
            frames: self.frames,
            duration_seconds,
            tempo_bpm: estimate_tempo(&self.beats, self.holdoff.as_secs_f32()),
        };
        tracing::info!(
            frames = summary.frames,
            beats = self.beats.len(),
            tempo_bpm = ?summary.tempo_bpm,
            "analysis finished"
        );
        BeatReport {
            summary,
            beats: self.beats,
        }
    }
}

impl fmt::Debug for BeatAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatAnalysis")
            .field("sample_rate", &self.sample_rate)
            .field("strategy", &self.strategy.name())
            .field("frames", &self.frames)
            .field("beats", &self.beats.len())
            .finish()
    }
}

/// Tempo from the mean interval between beats. Beats closer than
/// `min_interval` to the previously counted one are skipped.
pub fn estimate_tempo(beats: &[BeatMark], min_interval: f32) -> Option<f32> {
    let mut counted: Vec<f32> = Vec::with_capacity(beats.len());
    for beat in beats {
        if counted
            .last()
            .map(|last| beat.time - last >= min_interval)
            .unwrap_or(true)
        {
            counted.push(beat.time);
        }
    }

    let mut sum = 0.0;
    let mut count = 0;
    for window in counted.windows(2) {
        let interval = window[1] - window[0];
        if interval > f32::EPSILON {
            sum += interval;
            count += 1;
        }
    }

    if count == 0 {
        return None;
    }
    let average_interval = sum / count as f32;
    (average_interval > 0.0).then(|| 60.0 / average_interval)
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::config::DetectorKind;

    fn mark(time: f32) -> BeatMark {
        BeatMark {
            time,
            bands: [true, false],
        }
    }

    /// Decaying 60 Hz kick every `60 / bpm` seconds.
    fn kicks(sample_rate: u32, bpm: f32, seconds: f32) -> Vec<f32> {
        let period = 60.0 / bpm;
        (0..(sample_rate as f32 * seconds) as usize)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                let since = t % period;
                0.15 * (-since * 25.0).exp() * (2.0 * PI * 60.0 * since).sin()
            })
            .collect()
    }

    #[test]
    fn tempo_from_regular_beats() {
        let beats: Vec<_> = (0..8).map(|i| mark(i as f32 * 0.5)).collect();
        assert_abs_diff_eq!(estimate_tempo(&beats, 0.2).unwrap(), 120.0, epsilon = 1e-3);
    }

    #[test]
    fn tempo_ignores_double_triggers() {
        let beats = [mark(0.0), mark(0.05), mark(0.5), mark(0.55), mark(1.0)];
        assert_abs_diff_eq!(estimate_tempo(&beats, 0.2).unwrap(), 120.0, epsilon = 1e-3);
        assert_eq!(estimate_tempo(&[mark(1.0)], 0.2), None);
    }

    #[test]
    fn frames_span_push_boundaries() {
        let mut analysis = BeatAnalysis::new(&AppConfig::default(), 10_000).unwrap();
        analysis.push_samples(&[0.0; 700]).unwrap();
        analysis.push_samples(&[0.0; 400]).unwrap();
        let report = analysis.finish();
        assert_eq!(report.summary.frames, 2);
        assert!(report.beats.is_empty());
        assert_abs_diff_eq!(report.summary.duration_seconds, 0.1024, epsilon = 1e-6);
    }

    #[test]
    fn recovers_tempo_of_kick_track() {
        let mut config = AppConfig::default();
        config.detector.kind = DetectorKind::Envelope;
        let mut analysis = BeatAnalysis::new(&config, 10_000).unwrap();
        for chunk in kicks(10_000, 120.0, 10.0).chunks(1_000) {
            analysis.push_samples(chunk).unwrap();
        }
        let report = analysis.finish();
        assert_eq!(report.summary.strategy, "envelope");
        assert!(report.beats.len() >= 15, "{} beats", report.beats.len());
        let tempo = report.summary.tempo_bpm.unwrap();
        assert!((115.0..125.0).contains(&tempo), "tempo {tempo}");
    }

    #[test]
    fn rejects_zero_sample_rate() {
        assert!(BeatAnalysis::new(&AppConfig::default(), 0).is_err());
    }

    #[test]
    fn rejects_empty_frames() {
        let mut config = AppConfig::default();
        config.detector.kind = DetectorKind::Envelope;
        config.sampling.frame_size = 0;
        let err = BeatAnalysis::new(&config, 10_000).unwrap_err();
        assert!(matches!(err, BeatlightError::InvalidConfig(_)), "{err}");
    }
}
