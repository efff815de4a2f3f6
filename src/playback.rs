//! Wraps a platform output device at the canonical format. On starvation
//! (no frame available within the bounded wait) the worker emits a
//! zero-filled period rather than pausing, so playback never stalls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::warn;

use crate::capture::select_device;
use crate::error::{VoxError, VoxResult};
use crate::frame_buffer::FrameBuffer;
use crate::AudioFrame;

#[derive(Debug, Default, Clone, Copy)]
pub struct PlaybackCounters {
    pub underruns: u64,
    pub frames_played: u64,
    pub silence_periods: u64,
}

pub struct Playback {
    device: cpal::Device,
    achieved_rate: u32,
    volume: Arc<Mutex<f32>>,
    underruns: Arc<AtomicU64>,
    frames_played: Arc<AtomicU64>,
    silence_periods: Arc<AtomicU64>,
    stream: Option<cpal::Stream>,
}

impl Playback {
    pub fn initialize(device_name: &str) -> VoxResult<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, device_name, false)?;
        let config = device
            .default_output_config()
            .map_err(|e| VoxError::Device(format!("no default output config: {e}")))?;
        let achieved_rate = config.sample_rate().0;
        Ok(Self {
            device,
            achieved_rate,
            volume: Arc::new(Mutex::new(1.0)),
            underruns: Arc::new(AtomicU64::new(0)),
            frames_played: Arc::new(AtomicU64::new(0)),
            silence_periods: Arc::new(AtomicU64::new(0)),
            stream: None,
        })
    }

    pub fn achieved_rate(&self) -> u32 {
        self.achieved_rate
    }

    pub fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume.clamp(0.0, 2.0);
    }

    /// Spawn the I/O worker, pulling frames from `source` with the default
    /// 10 ms bounded wait. `source` is handed over, not shared back out —
    /// `Playback` owns the consumer end only.
    pub fn start(&mut self, source: Arc<FrameBuffer<AudioFrame>>) -> VoxResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let config = self
            .device
            .default_output_config()
            .map_err(|e| VoxError::Device(format!("no default output config: {e}")))?;
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(config.into(), source)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(config.into(), source)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(config.into(), source)?,
            other => return Err(VoxError::Device(format!("unsupported sample format {other:?}"))),
        };
        stream
            .play()
            .map_err(|e| VoxError::Device(format!("playback stream play: {e}")))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn build_stream<T>(
        &self,
        cfg: cpal::StreamConfig,
        source: Arc<FrameBuffer<AudioFrame>>,
    ) -> VoxResult<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let volume = self.volume.clone();
        let underruns = self.underruns.clone();
        let frames_played = self.frames_played.clone();
        let silence_periods = self.silence_periods.clone();
        let channels = cfg.channels as usize;
        let mut cursor: Vec<i16> = Vec::new();
        let mut pos = 0usize;

        let err_fn = |e: cpal::StreamError| warn!("playback stream error: {e}");

        let stream = self
            .device
            .build_output_stream(
                &cfg,
                move |out: &mut [T], _| {
                    let v = *volume.lock();
                    for frame in out.chunks_mut(channels) {
                        if pos >= cursor.len() {
                            match source.pop_playback() {
                                Some(frame) => {
                                    frames_played.fetch_add(1, Ordering::Relaxed);
                                    cursor = frame.samples;
                                }
                                None => {
                                    underruns.fetch_add(1, Ordering::Relaxed);
                                    silence_periods.fetch_add(1, Ordering::Relaxed);
                                    cursor = vec![0i16; crate::DEVICE_FRAME_SAMPLES];
                                }
                            }
                            pos = 0;
                        }
                        let sample = cursor.get(pos).copied().unwrap_or(0);
                        pos += 1;
                        let scaled = (sample as f32 / i16::MAX as f32 * v).clamp(-1.0, 1.0);
                        let value = T::from_sample(scaled);
                        for channel_sample in frame.iter_mut() {
                            *channel_sample = value;
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| VoxError::Device(format!("build output stream: {e}")))?;
        Ok(stream)
    }

    pub fn counters(&self) -> PlaybackCounters {
        PlaybackCounters {
            underruns: self.underruns.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            silence_periods: self.silence_periods.load(Ordering::Relaxed),
        }
    }

    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.stop();
    }
}
