//! Orchestrates AGC → noise suppression → VAD → codec on the send path, and
//! the mirror on the receive path. Owns the `Codec` and `BitrateController`
//! so neither is reachable from outside except through this handle.

use tracing::debug;

use crate::bitrate::BitrateController;
use crate::codec::Codec;
use crate::config::PreprocessorConfig;
use crate::error::VoxResult;
use crate::metrics::{AudioMetrics, NetworkMetrics};
use crate::noise::NoiseSuppressor;
use crate::{resample, CODEC_SAMPLE_RATE, DENOISE_FRAME_SAMPLES, DEVICE_SAMPLE_RATE};

/// `α` in the AGC's exponential smoothing `g ← α·(target/rms) + (1−α)·g`.
const AGC_ALPHA: f64 = 0.1;
const AGC_GAIN_MIN: f64 = 0.1;
const AGC_GAIN_MAX: f64 = 2.0;

pub struct Preprocessor {
    config: PreprocessorConfig,
    noise: Option<NoiseSuppressor>,
    codec: Option<Codec>,
    bitrate: BitrateController,
    agc_gain_in: f64,
    agc_gain_out: f64,
    volume: f64,
    last_speech_detected: bool,
    on_speech_detected: Option<Box<dyn FnMut(bool) + Send>>,
    on_bitrate_changed: Option<Box<dyn FnMut(u32) + Send>>,
}

impl Preprocessor {
    pub fn initialize(config: PreprocessorConfig) -> VoxResult<Self> {
        let noise = if config.enable_noise_suppression {
            let mut ns = NoiseSuppressor::initialize(DEVICE_SAMPLE_RATE)?;
            ns.set_suppression_level(config.noise_suppression_level);
            ns.set_threshold(config.vad_threshold);
            ns.enable_vad(config.enable_vad);
            Some(ns)
        } else {
            None
        };

        let codec = if config.enable_codec {
            let codec = Codec::new_opus(CODEC_SAMPLE_RATE, config.target_bitrate)
                .or_else(|_| Codec::new_passthrough(CODEC_SAMPLE_RATE, config.target_bitrate))?;
            Some(codec)
        } else {
            None
        };

        let mut bitrate = BitrateController::new(config.target_bitrate);
        bitrate.set_quality_mode(config.quality_mode);

        Ok(Self {
            config,
            noise,
            codec,
            bitrate,
            agc_gain_in: 1.0,
            agc_gain_out: 1.0,
            volume: 1.0,
            last_speech_detected: false,
            on_speech_detected: None,
            on_bitrate_changed: None,
        })
    }

    pub fn set_on_speech_detected(&mut self, cb: impl FnMut(bool) + Send + 'static) {
        self.on_speech_detected = Some(Box::new(cb));
    }

    pub fn set_on_bitrate_changed(&mut self, cb: impl FnMut(u32) + Send + 'static) {
        self.on_bitrate_changed = Some(Box::new(cb));
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume.clamp(0.0, 2.0);
    }

    pub fn codec_frame_len(&self) -> Option<usize> {
        self.codec.as_ref().map(Codec::frame_len)
    }

    /// AGC → noise suppression → VAD attenuation, in place, at
    /// [`DEVICE_SAMPLE_RATE`]. Fires the speech-detected callback on edges.
    pub fn process_input(&mut self, samples: &mut [i16]) {
        if self.config.enable_agc {
            apply_agc(samples, &mut self.agc_gain_in, self.config.agc_target_level);
        }

        if let Some(ns) = self.noise.as_mut() {
            for chunk in samples.chunks_mut(DENOISE_FRAME_SAMPLES) {
                if chunk.len() == DENOISE_FRAME_SAMPLES {
                    ns.process(chunk);
                }
            }
            let speech_now = ns.is_speech();
            if speech_now != self.last_speech_detected {
                self.last_speech_detected = speech_now;
                if let Some(cb) = self.on_speech_detected.as_mut() {
                    cb(speech_now);
                }
            }
        }
    }

    /// Volume/AGC only, in place, at [`DEVICE_SAMPLE_RATE`].
    pub fn process_output(&mut self, samples: &mut [i16]) {
        apply_volume(samples, self.volume);
        if self.config.enable_agc {
            apply_agc(samples, &mut self.agc_gain_out, self.config.agc_target_level);
        }
    }

    /// Runs `process_input`, resamples to the codec rate, and encodes. If
    /// `enable_codec` is false the processed PCM is returned raw (as
    /// little-endian bytes) instead.
    pub fn encode(&mut self, samples: &[i16]) -> Option<Vec<u8>> {
        let mut buf = samples.to_vec();
        self.process_input(&mut buf);
        match self.codec.as_mut() {
            Some(codec) => {
                let at_codec_rate = resample::to_16k(&buf, DEVICE_SAMPLE_RATE);
                codec.encode(&at_codec_rate)
            }
            None => Some(pcm_to_bytes(&buf)),
        }
    }

    /// Decodes, resamples back to device rate, and runs `process_output`.
    pub fn decode(&mut self, payload: &[u8]) -> Option<Vec<i16>> {
        let mut samples = match self.codec.as_mut() {
            Some(codec) => {
                let at_codec_rate = codec.decode(payload)?;
                resample::from_16k(&at_codec_rate, DEVICE_SAMPLE_RATE)
            }
            None => bytes_to_pcm(payload)?,
        };
        self.process_output(&mut samples);
        Some(samples)
    }

    pub fn current_bitrate(&self) -> u32 {
        self.bitrate.current()
    }

    pub fn update_network_metrics(&mut self, metrics: NetworkMetrics) {
        self.bitrate.update_network(metrics);
        self.maybe_apply_bitrate();
    }

    pub fn update_audio_metrics(&mut self, metrics: AudioMetrics) {
        self.bitrate.update_audio(metrics);
        self.maybe_apply_bitrate();
    }

    pub fn report_packet_loss(&mut self, loss_ratio: f64) {
        self.bitrate.report_packet_loss(loss_ratio);
        self.maybe_apply_bitrate();
    }

    pub fn report_latency(&mut self, latency_ms: f64) {
        self.bitrate.report_latency(latency_ms);
        self.maybe_apply_bitrate();
    }

    pub fn report_bandwidth(&mut self, kbps: f64) {
        self.bitrate.report_bandwidth(kbps);
        self.maybe_apply_bitrate();
    }

    fn maybe_apply_bitrate(&mut self) {
        if !self.config.enable_bitrate_adaptation {
            return;
        }
        if let Some(new_bps) = self.bitrate.recompute() {
            if let Some(codec) = self.codec.as_mut() {
                if let Err(e) = codec.set_bitrate(new_bps) {
                    debug!("bitrate controller proposed invalid bitrate: {e}");
                    return;
                }
            }
            if let Some(cb) = self.on_bitrate_changed.as_mut() {
                cb(new_bps);
            }
        }
    }
}

fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

fn bytes_to_pcm(payload: &[u8]) -> Option<Vec<i16>> {
    if payload.len() % 2 != 0 {
        return None;
    }
    Some(
        payload
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
    )
}

/// `g ← α·(target/rms) + (1−α)·g`, clamped to `[0.1, 2.0]`, applied
/// sample-wise with clipping to `[-1, 1]` after scaling.
fn apply_agc(samples: &mut [i16], gain: &mut f64, target_level: f64) {
    let rms = rms(samples);
    if rms > 1e-6 {
        let desired = target_level / rms;
        *gain = (AGC_ALPHA * desired + (1.0 - AGC_ALPHA) * *gain).clamp(AGC_GAIN_MIN, AGC_GAIN_MAX);
    }
    for s in samples.iter_mut() {
        let scaled = (*s as f64 / i16::MAX as f64) * *gain;
        *s = (scaled.clamp(-1.0, 1.0) * i16::MAX as f64).round() as i16;
    }
}

fn apply_volume(samples: &mut [i16], volume: f64) {
    for s in samples.iter_mut() {
        let scaled = (*s as f64 / i16::MAX as f64) * volume;
        *s = (scaled.clamp(-1.0, 1.0) * i16::MAX as f64).round() as i16;
    }
}

fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64 / i16::MAX as f64).powi(2)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEVICE_FRAME_SAMPLES;

    fn loud_frame() -> Vec<i16> {
        (0..DEVICE_FRAME_SAMPLES)
            .map(|i| {
                let t = i as f64 / DEVICE_SAMPLE_RATE as f64;
                (i16::MAX as f64 * 0.9 * (2.0 * std::f64::consts::PI * 220.0 * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn agc_output_stays_within_i16_full_scale() {
        let mut gain = 1.0;
        let mut frame = loud_frame();
        apply_agc(&mut frame, &mut gain, 0.3);
        for s in frame {
            assert!(s >= i16::MIN && s <= i16::MAX);
        }
    }

    #[test]
    fn passthrough_codec_round_trips_when_codec_disabled() {
        let config = PreprocessorConfig {
            enable_codec: false,
            enable_agc: false,
            enable_noise_suppression: false,
            enable_vad: false,
            ..PreprocessorConfig::default()
        };
        let mut pre = Preprocessor::initialize(config).unwrap();
        let frame = loud_frame();
        let encoded = pre.encode(&frame).expect("encodes");
        let decoded = pre.decode(&encoded).expect("decodes");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn speech_detected_callback_fires_on_edge() {
        let config = PreprocessorConfig {
            enable_codec: false,
            enable_agc: false,
            ..PreprocessorConfig::default()
        };
        let mut pre = Preprocessor::initialize(config).unwrap();
        let transitions = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let t2 = transitions.clone();
        pre.set_on_speech_detected(move |speaking| t2.lock().unwrap().push(speaking));

        let silence = vec![0i16; DEVICE_FRAME_SAMPLES];
        let speech = loud_frame();
        pre.encode(&silence);
        pre.encode(&speech);
        pre.encode(&silence);

        let seen = transitions.lock().unwrap().clone();
        assert!(!seen.is_empty());
    }

    #[test]
    fn bitrate_changed_callback_reflects_controller_state() {
        let mut pre = Preprocessor::initialize(PreprocessorConfig::default()).unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        pre.set_on_bitrate_changed(move |bps| *seen2.lock().unwrap() = Some(bps));
        pre.report_packet_loss(0.5);
        pre.report_latency(600.0);
        assert_eq!(*seen.lock().unwrap(), Some(pre.current_bitrate()));
    }
}
