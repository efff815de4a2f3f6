//! Per-frame noise reduction and speech-probability estimation, operating at
//! 48 kHz on 10 ms (480-sample) work units.
//!
//! Like [`crate::codec`], this is a capability with a real backend
//! (`webrtc-audio-processing`) and a fallback (noise gate + RMS/ZCR
//! heuristic) behind one trait. Speech probability is not exposed by the
//! safe surface of `webrtc-audio-processing`, so both variants derive it
//! from the same RMS/ZCR estimator — the real variant just runs it on the
//! already-denoised frame. See DESIGN.md for why this isn't duplicated.

use tracing::warn;

use crate::error::{VoxError, VoxResult};
use crate::DENOISE_FRAME_SAMPLES;

trait DenoiseBackend: Send {
    /// In-place denoise of one 480-sample frame.
    fn denoise(&mut self, frame: &mut [i16]);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseMetrics {
    pub noise_level: f64,
    pub speech_probability: f64,
    pub applied_suppression: f64,
    pub frame_count: u64,
}

pub struct NoiseSuppressor {
    backend: Box<dyn DenoiseBackend>,
    suppression_level: f64,
    threshold: f64,
    vad_enabled: bool,
    adaptive_enabled: bool,
    noise_level: f64,
    speech_probability: f64,
    applied_suppression: f64,
    frame_count: u64,
}

/// Multiplicative attenuation applied to sub-threshold frames in VAD mode.
/// A fixed factor rather than muting, to avoid audible gate clicks.
const VAD_ATTENUATION: f64 = 0.1;

impl NoiseSuppressor {
    /// Build a suppressor backed by the real denoiser. Falls back to the
    /// noise-gate heuristic if the library fails to initialize.
    pub fn initialize(sample_rate: u32) -> VoxResult<Self> {
        if sample_rate != 48_000 {
            return Err(VoxError::Config(format!(
                "noise suppressor requires 48kHz, got {sample_rate}"
            )));
        }
        let backend: Box<dyn DenoiseBackend> = match WebRtcBackend::new() {
            Ok(backend) => Box::new(backend),
            Err(e) => {
                warn!("denoiser unavailable ({e}), using noise-gate fallback");
                Box::new(NoiseGateBackend::default())
            }
        };
        Ok(Self::with_backend(backend))
    }

    /// Build a suppressor that never touches the real denoiser library, for
    /// tests and for `power-save`-style profiles that still want the
    /// heuristic VAD without the extra CPU cost.
    pub fn initialize_fallback(sample_rate: u32) -> VoxResult<Self> {
        if sample_rate != 48_000 {
            return Err(VoxError::Config(format!(
                "noise suppressor requires 48kHz, got {sample_rate}"
            )));
        }
        Ok(Self::with_backend(Box::new(NoiseGateBackend::default())))
    }

    fn with_backend(backend: Box<dyn DenoiseBackend>) -> Self {
        Self {
            backend,
            suppression_level: 0.5,
            threshold: 0.5,
            vad_enabled: true,
            adaptive_enabled: true,
            noise_level: 0.0,
            speech_probability: 0.0,
            applied_suppression: 0.0,
            frame_count: 0,
        }
    }

    pub fn set_suppression_level(&mut self, level: f64) {
        self.suppression_level = level.clamp(0.0, 1.0);
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn enable_vad(&mut self, enabled: bool) {
        self.vad_enabled = enabled;
    }

    pub fn enable_adaptive(&mut self, enabled: bool) {
        self.adaptive_enabled = enabled;
    }

    /// In-place denoise of a 480-sample frame; updates speech probability
    /// and the running noise-level history.
    pub fn process(&mut self, frame: &mut [i16]) {
        debug_assert_eq!(frame.len(), DENOISE_FRAME_SAMPLES);

        // The noise estimate gauges how noisy the *input* was, so it's
        // taken pre-denoise; speech probability is derived from the
        // already-denoised frame (see the module doc comment) so noise
        // energy doesn't get mistaken for voiced energy.
        let pre_rms = rms(frame);
        let pre_zcr = zero_crossing_rate(frame);
        let noise_estimate = estimate_noise(pre_rms, pre_zcr);

        self.backend.denoise(frame);

        let post_rms = rms(frame);
        let post_zcr = zero_crossing_rate(frame);
        self.speech_probability = speech_probability_heuristic(post_rms, post_zcr);

        let mut suppression = self.suppression_level;
        if self.adaptive_enabled && self.noise_level > 0.0 {
            let ratio = (noise_estimate - self.noise_level) / self.noise_level;
            if ratio >= 0.5 {
                let extra = ratio.min(0.5);
                suppression = (suppression + extra).min(1.0);
                attenuate(frame, 1.0 - extra);
            }
        }
        self.noise_level = if self.frame_count == 0 {
            noise_estimate
        } else {
            0.9 * self.noise_level + 0.1 * noise_estimate
        };

        if self.vad_enabled && self.speech_probability < self.threshold {
            attenuate(frame, VAD_ATTENUATION);
        }

        self.applied_suppression = suppression;
        self.frame_count += 1;
    }

    pub fn is_speech(&self) -> bool {
        self.speech_probability > self.threshold
    }

    pub fn metrics(&self) -> NoiseMetrics {
        NoiseMetrics {
            noise_level: self.noise_level,
            speech_probability: self.speech_probability,
            applied_suppression: self.applied_suppression,
            frame_count: self.frame_count,
        }
    }
}

fn attenuate(frame: &mut [i16], factor: f64) {
    for sample in frame.iter_mut() {
        *sample = (*sample as f64 * factor)
            .round()
            .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    }
}

fn rms(frame: &[i16]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame.iter().map(|&s| (s as f64).powi(2)).sum();
    (sum_sq / frame.len() as f64).sqrt() / i16::MAX as f64
}

fn zero_crossing_rate(frame: &[i16]) -> f64 {
    if frame.len() < 2 {
        return 0.0;
    }
    let crossings = frame
        .windows(2)
        .filter(|w| (w[0] >= 0) != (w[1] >= 0))
        .count();
    crossings as f64 / (frame.len() - 1) as f64
}

/// Crude noise-floor estimate: steady, low-zero-crossing signal looks like
/// noise rather than speech.
fn estimate_noise(rms: f64, zcr: f64) -> f64 {
    (rms * (1.0 - zcr)).max(0.0)
}

/// Voiced speech tends to sit at moderate energy with a zero-crossing rate
/// in a fairly narrow band; pure noise or silence falls outside it.
fn speech_probability_heuristic(rms: f64, zcr: f64) -> f64 {
    let energy_term = (rms * 4.0).min(1.0);
    let zcr_term = 1.0 - (zcr - 0.1).abs().min(1.0);
    (0.6 * energy_term + 0.4 * zcr_term).clamp(0.0, 1.0)
}

/// Noise gate + RMS/ZCR speech probability; the fallback when
/// `webrtc-audio-processing` is unavailable.
#[derive(Default)]
struct NoiseGateBackend {
    gate_threshold: f64,
}

impl DenoiseBackend for NoiseGateBackend {
    fn denoise(&mut self, frame: &mut [i16]) {
        let threshold = (self.gate_threshold.max(0.02) * i16::MAX as f64) as i16;
        for sample in frame.iter_mut() {
            if sample.abs() < threshold {
                *sample = (*sample as f64 * 0.3).round() as i16;
            }
        }
    }
}

/// Thin wrapper over `webrtc_audio_processing::Processor`, configured for
/// single-channel noise suppression.
struct WebRtcBackend {
    processor: webrtc_audio_processing::Processor,
}

impl WebRtcBackend {
    fn new() -> VoxResult<Self> {
        use webrtc_audio_processing::{Config, InitializationConfig, NoiseSuppression, NoiseSuppressionLevel, Processor};

        let init = InitializationConfig {
            num_capture_channels: 1,
            num_render_channels: 1,
            ..InitializationConfig::default()
        };
        let mut processor =
            Processor::new(&init).map_err(|e| VoxError::Dsp(format!("webrtc-audio-processing init: {e:?}")))?;
        processor.set_config(Config {
            noise_suppression: Some(NoiseSuppression {
                suppression_level: NoiseSuppressionLevel::High,
            }),
            ..Config::default()
        });
        Ok(Self { processor })
    }
}

impl DenoiseBackend for WebRtcBackend {
    fn denoise(&mut self, frame: &mut [i16]) {
        let mut floats: Vec<f32> = frame.iter().map(|&s| s as f32 / 32768.0).collect();
        if let Err(e) = self.processor.process_capture_frame(&mut floats) {
            warn!("denoiser process error: {e:?}");
            return;
        }
        for (dst, src) in frame.iter_mut().zip(floats.iter()) {
            *dst = (src.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq_hz: f64, amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / 48_000.0;
                (amplitude as f64 * (2.0 * std::f64::consts::PI * freq_hz * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn loud_tone_is_classified_as_speech() {
        let mut ns = NoiseSuppressor::initialize_fallback(48_000).unwrap();
        ns.set_threshold(0.3);
        let mut frame = tone(220.0, 20_000, DENOISE_FRAME_SAMPLES);
        ns.process(&mut frame);
        assert!(ns.is_speech());
    }

    #[test]
    fn near_silence_is_not_speech() {
        let mut ns = NoiseSuppressor::initialize_fallback(48_000).unwrap();
        let mut frame = vec![0i16; DENOISE_FRAME_SAMPLES];
        ns.process(&mut frame);
        assert!(!ns.is_speech());
    }

    #[test]
    fn vad_attenuates_sub_threshold_frames_instead_of_muting() {
        let mut ns = NoiseSuppressor::initialize_fallback(48_000).unwrap();
        ns.enable_adaptive(false);
        ns.set_threshold(0.9); // force sub-threshold classification
        let mut frame = tone(220.0, 20_000, DENOISE_FRAME_SAMPLES);
        let peak_before = frame.iter().map(|s| s.abs()).max().unwrap();
        ns.process(&mut frame);
        let peak_after = frame.iter().map(|s| s.abs()).max().unwrap();
        assert!(peak_after > 0, "VAD must attenuate, not mute");
        assert!(peak_after < peak_before);
    }

    #[test]
    fn rejects_unsupported_sample_rate() {
        assert!(NoiseSuppressor::initialize_fallback(16_000).is_err());
    }

    #[test]
    fn metrics_report_frame_count() {
        let mut ns = NoiseSuppressor::initialize_fallback(48_000).unwrap();
        let mut frame = vec![0i16; DENOISE_FRAME_SAMPLES];
        ns.process(&mut frame);
        ns.process(&mut frame);
        assert_eq!(ns.metrics().frame_count, 2);
    }
}
