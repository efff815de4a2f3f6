//! Computes a target bitrate from network and audio signals, smooths it so
//! the codec isn't whipsawed, and commits a change only once it clears the
//! stability threshold.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::metrics::{AudioMetrics, NetworkMetrics};
use crate::{DEFAULT_BITRATE, MAX_BITRATE, MIN_BITRATE};

const HISTORY_CAP: usize = 100;
const HISTORY_MAX_AGE: Duration = Duration::from_secs(600);

/// Named policy constraining the controller's output range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityMode {
    PowerSave,
    Balanced,
    HighQuality,
    Adaptive,
}

#[derive(Debug, Clone, Copy)]
pub struct BitrateHistoryEntry {
    pub bitrate: u32,
    pub at: Instant,
}

pub struct BitrateController {
    current: u32,
    quality_mode: QualityMode,
    /// Smoothing speed in `[0, 1]`.
    speed: f64,
    /// Minimum relative change required to commit, in `[0, 1]`.
    stability_threshold: f64,
    /// `ADAPTIVE` mode's fraction of the `[MIN, MAX]` range it permits.
    quality_factor: f64,
    network: NetworkMetrics,
    audio: AudioMetrics,
    history: VecDeque<BitrateHistoryEntry>,
}

impl BitrateController {
    pub fn new(initial_bitrate: u32) -> Self {
        Self {
            current: initial_bitrate.clamp(MIN_BITRATE, MAX_BITRATE),
            quality_mode: QualityMode::Balanced,
            speed: 0.3,
            stability_threshold: 0.1,
            quality_factor: 0.5,
            network: NetworkMetrics::default(),
            audio: AudioMetrics::default(),
            history: VecDeque::new(),
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn set_quality_mode(&mut self, mode: QualityMode) {
        self.quality_mode = mode;
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed.clamp(0.0, 1.0);
    }

    pub fn set_stability_threshold(&mut self, threshold: f64) {
        self.stability_threshold = threshold.max(0.0);
    }

    pub fn update_network(&mut self, metrics: NetworkMetrics) {
        self.network = metrics;
    }

    pub fn update_audio(&mut self, metrics: AudioMetrics) {
        self.audio = metrics;
    }

    pub fn report_packet_loss(&mut self, loss_ratio: f64) {
        self.network.loss_ratio = loss_ratio.clamp(0.0, 1.0);
    }

    pub fn report_latency(&mut self, latency_ms: f64) {
        self.network.latency_ms = latency_ms.max(0.0);
    }

    pub fn report_bandwidth(&mut self, kbps: f64) {
        self.network.bandwidth_kbps = Some(kbps.max(0.0));
    }

    fn network_target(&self) -> f64 {
        let NetworkMetrics {
            loss_ratio,
            latency_ms,
            bandwidth_kbps,
            ..
        } = self.network;

        let mut target = if loss_ratio > 0.05 || latency_ms > 500.0 {
            MIN_BITRATE as f64
        } else if (loss_ratio > 0.02 && loss_ratio <= 0.05) || (latency_ms > 200.0 && latency_ms <= 500.0) {
            (MIN_BITRATE + DEFAULT_BITRATE) as f64 / 2.0
        } else {
            DEFAULT_BITRATE as f64
        };

        if let Some(bw_kbps) = bandwidth_kbps {
            target = target.min(0.8 * bw_kbps * 1000.0);
        }
        target
    }

    fn audio_target(&self) -> f64 {
        let a = &self.audio;
        if !a.speech_detected {
            return MIN_BITRATE as f64;
        }
        if a.rms > 0.7 {
            return MAX_BITRATE as f64;
        }
        if a.rms < 0.1 {
            return MIN_BITRATE as f64;
        }
        if a.snr_db > 20.0 {
            return DEFAULT_BITRATE as f64;
        }
        if a.snr_db < 10.0 {
            return MIN_BITRATE as f64;
        }
        DEFAULT_BITRATE as f64
    }

    fn apply_quality_mode(&self, target: f64) -> f64 {
        match self.quality_mode {
            QualityMode::PowerSave => MIN_BITRATE as f64,
            QualityMode::Balanced => target.min(DEFAULT_BITRATE as f64),
            QualityMode::HighQuality => target.max(MAX_BITRATE as f64),
            QualityMode::Adaptive => {
                let ceiling =
                    MIN_BITRATE as f64 + self.quality_factor * (MAX_BITRATE - MIN_BITRATE) as f64;
                target.min(ceiling)
            }
        }
    }

    /// Recompute the target bitrate from the latest metrics, smooth it
    /// toward the currently committed value, and commit only if the change
    /// clears `stability_threshold`. Returns the new bitrate on commit.
    pub fn recompute(&mut self) -> Option<u32> {
        let combined = 0.6 * self.network_target() + 0.4 * self.audio_target();
        let target = self.apply_quality_mode(combined);

        let smoothed = self.current as f64 + self.speed * (target - self.current as f64);
        let clamped = smoothed.clamp(MIN_BITRATE as f64, MAX_BITRATE as f64).round();

        let delta_ratio = (clamped - self.current as f64).abs() / self.current as f64;
        if delta_ratio >= self.stability_threshold {
            self.current = clamped as u32;
            self.record_history();
            Some(self.current)
        } else {
            None
        }
    }

    fn record_history(&mut self) {
        let now = Instant::now();
        self.history.push_back(BitrateHistoryEntry {
            bitrate: self.current,
            at: now,
        });
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
        while matches!(self.history.front(), Some(e) if now.duration_since(e.at) > HISTORY_MAX_AGE) {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &BitrateHistoryEntry> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech_audio(rms: f64, snr_db: f64) -> AudioMetrics {
        AudioMetrics {
            snr_db,
            rms,
            speech_detected: true,
            speech_probability: 0.9,
        }
    }

    #[test]
    fn clamps_to_range_for_arbitrary_inputs() {
        let mut ctrl = BitrateController::new(DEFAULT_BITRATE);
        let inputs = [
            (0.9, 900.0, speech_audio(0.9, 30.0)),
            (0.0, 0.0, AudioMetrics::default()),
            (0.03, 300.0, speech_audio(0.05, 5.0)),
        ];
        for (loss, latency, audio) in inputs {
            ctrl.report_packet_loss(loss);
            ctrl.report_latency(latency);
            ctrl.update_audio(audio);
            for _ in 0..20 {
                if let Some(committed) = ctrl.recompute() {
                    assert!((MIN_BITRATE..=MAX_BITRATE).contains(&committed));
                }
            }
            assert!((MIN_BITRATE..=MAX_BITRATE).contains(&ctrl.current()));
        }
    }

    #[test]
    fn e3_bitrate_falls_under_loss() {
        // Start at 6000 bps; 10/100 packets lost, 100 ms latency.
        let mut ctrl = BitrateController::new(6_000);
        ctrl.report_packet_loss(0.10);
        ctrl.report_latency(100.0);
        let mut last = ctrl.current();
        for _ in 0..10 {
            if let Some(committed) = ctrl.recompute() {
                last = committed;
            }
        }
        assert!(last <= 4_600, "expected <= 4600, got {last}");
    }

    #[test]
    fn e4_bitrate_rises_under_clean_channel_with_speech() {
        // High-quality mode demonstrates the rise: a clean, speech-heavy
        // signal should be allowed to reach the ceiling.
        let mut ctrl = BitrateController::new(3_200);
        ctrl.set_quality_mode(QualityMode::HighQuality);
        ctrl.report_packet_loss(0.0);
        ctrl.report_latency(50.0);
        ctrl.update_audio(speech_audio(0.8, 25.0));
        let mut last = ctrl.current();
        for _ in 0..10 {
            if let Some(committed) = ctrl.recompute() {
                last = committed;
            }
        }
        assert!(last >= 8_000, "expected >= 8000, got {last}");
    }

    #[test]
    fn stabilizes_and_then_never_changes_again() {
        let mut ctrl = BitrateController::new(6_000);
        ctrl.report_packet_loss(0.10);
        ctrl.report_latency(100.0);
        let mut saw_stable = false;
        for _ in 0..30 {
            let changed = ctrl.recompute().is_some();
            if saw_stable {
                assert!(!changed, "bitrate changed again after stabilizing");
            }
            if !changed {
                saw_stable = true;
            }
        }
        assert!(saw_stable, "controller never stabilized");
    }

    #[test]
    fn power_save_always_floors_to_minimum() {
        let mut ctrl = BitrateController::new(MAX_BITRATE);
        ctrl.set_quality_mode(QualityMode::PowerSave);
        ctrl.set_speed(1.0);
        ctrl.update_audio(speech_audio(0.9, 30.0));
        ctrl.recompute();
        assert_eq!(ctrl.current(), MIN_BITRATE);
    }
}
