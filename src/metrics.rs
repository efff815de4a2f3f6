//! Point-in-time metrics views produced by Transport/NoiseSuppressor and
//! consumed by the `BitrateController`.

/// Network-side observations, smoothed by their producer (`Transport`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkMetrics {
    /// Packet loss ratio in `[0, 1]`.
    pub loss_ratio: f64,
    /// Exponentially smoothed round-trip-ish latency, in ms.
    pub latency_ms: f64,
    /// Jitter, in ms.
    pub jitter_ms: f64,
    /// Observed bandwidth in kbps, if known.
    pub bandwidth_kbps: Option<f64>,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            loss_ratio: 0.0,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            bandwidth_kbps: None,
        }
    }
}

/// Audio-side observations, produced by `NoiseSuppressor`/`Preprocessor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioMetrics {
    /// Signal-to-noise ratio in dB.
    pub snr_db: f64,
    /// RMS level in `[0, 1]`.
    pub rms: f64,
    /// Whether the most recent frame was classified as speech.
    pub speech_detected: bool,
    /// Most recent speech probability in `[0, 1]`.
    pub speech_probability: f64,
}

impl Default for AudioMetrics {
    fn default() -> Self {
        Self {
            snr_db: 0.0,
            rms: 0.0,
            speech_detected: false,
            speech_probability: 0.0,
        }
    }
}
