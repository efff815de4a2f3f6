//! Core library for `voxlink`, a peer-to-peer real-time voice endpoint.
//!
//! The binary (`main.rs`) is a thin CLI shim; everything that matters — the
//! capture/preprocess/encode/transmit pipeline and its mirror on the receive
//! side — lives here so it can be exercised directly from tests without
//! spinning up a process.

use std::time::Instant;

pub mod bitrate;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame_buffer;
pub mod logging;
pub mod metrics;
pub mod noise;
pub mod playback;
pub mod preprocessor;
pub mod resample;
pub mod session;
pub mod transport;
pub mod wire;

pub use error::{VoxError, VoxResult};

/// Bitrate floor, in bits/sec. The codec never runs below this.
pub const MIN_BITRATE: u32 = 3_200;
/// Bitrate the session starts at absent other signal.
pub const DEFAULT_BITRATE: u32 = 6_000;
/// Bitrate ceiling, in bits/sec.
pub const MAX_BITRATE: u32 = 9_200;

/// The device-facing canonical sample rate. Capture and playback run at this
/// rate; the codec runs at [`CODEC_SAMPLE_RATE`] and the `Preprocessor`
/// bridges the two.
pub const DEVICE_SAMPLE_RATE: u32 = 48_000;
/// The codec's internal sample rate.
pub const CODEC_SAMPLE_RATE: u32 = 16_000;

/// Nominal codec/network frame duration.
pub const FRAME_MS: u32 = 20;
/// Nominal denoiser work-unit duration.
pub const DENOISE_FRAME_MS: u32 = 10;

/// Samples per 20 ms frame at [`DEVICE_SAMPLE_RATE`] (960).
pub const DEVICE_FRAME_SAMPLES: usize = (DEVICE_SAMPLE_RATE as usize * FRAME_MS as usize) / 1000;
/// Samples per 20 ms frame at [`CODEC_SAMPLE_RATE`] (320).
pub const CODEC_FRAME_SAMPLES: usize = (CODEC_SAMPLE_RATE as usize * FRAME_MS as usize) / 1000;
/// Samples per 10 ms denoiser frame at [`DEVICE_SAMPLE_RATE`] (480).
pub const DENOISE_FRAME_SAMPLES: usize =
    (DEVICE_SAMPLE_RATE as usize * DENOISE_FRAME_MS as usize) / 1000;

/// Default `FrameBuffer` capacity, in frames.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10;
/// Default bound on `FrameBuffer::pop_playback`.
pub const DEFAULT_POP_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(10);
/// Maximum UDP datagram size this endpoint will ever send.
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// A contiguous block of mono S16LE PCM samples, captured or about to be
/// played back at [`DEVICE_SAMPLE_RATE`].
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Sequence number, assigned when the frame enters a `FrameBuffer` from
    /// its producer side. Strictly increasing per sender, starting at 0.
    pub seq: u32,
    /// Steady monotonic acquisition timestamp.
    pub captured_at: Instant,
    /// Mono S16LE samples.
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(seq: u32, samples: Vec<i16>) -> Self {
        Self {
            seq,
            captured_at: Instant::now(),
            samples,
        }
    }

    /// A frame of `len` zero samples, used to fill playback gaps.
    pub fn silence(seq: u32, len: usize) -> Self {
        Self::new(seq, vec![0i16; len])
    }
}

/// An opaque compressed payload produced by the codec, carrying the sequence
/// number it shares with its source `AudioFrame`, the bitrate it was encoded
/// at, and a send timestamp.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub seq: u32,
    pub bitrate: u32,
    pub sent_at: Instant,
    pub payload: Vec<u8>,
}

impl EncodedPacket {
    pub fn new(seq: u32, bitrate: u32, payload: Vec<u8>) -> Self {
        Self {
            seq,
            bitrate,
            sent_at: Instant::now(),
            payload,
        }
    }
}
