//! Frame-synchronous speech codec, 20 ms work units, runtime bitrate change.
//!
//! The codec is a capability with two implementations behind one trait:
//! [`opus`]-backed when the library is available, and a byte-for-byte
//! pass-through otherwise. `Preprocessor` only ever holds the abstract
//! `Codec` handle — it never knows which backend is underneath.

use tracing::warn;

use crate::error::{VoxError, VoxResult};
use crate::{MAX_BITRATE, MAX_DATAGRAM_LEN, MIN_BITRATE};

/// Header budget reserved on top of the payload for [`crate::wire`] framing.
const WIRE_HEADER_LEN: usize = 4;
const MAX_PAYLOAD_LEN: usize = MAX_DATAGRAM_LEN - WIRE_HEADER_LEN;

/// The operation set a codec backend must provide: encode, decode, and
/// runtime bitrate change. Both the Opus and pass-through implementations
/// are plain PCM-in/bytes-out state machines; `Codec` owns the frame-length
/// and bitrate-range validation common to both.
trait CodecBackend: Send {
    fn encode(&mut self, samples: &[i16]) -> Option<Vec<u8>>;
    fn decode(&mut self, payload: &[u8], frame_len: usize) -> Option<Vec<i16>>;
    fn set_bitrate(&mut self, bps: u32);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodecCounters {
    pub encoded_frames: u64,
    pub decoded_frames: u64,
    pub encode_errors: u64,
    pub decode_errors: u64,
}

pub struct Codec {
    backend: Box<dyn CodecBackend>,
    sample_rate: u32,
    frame_len: usize,
    bitrate: u32,
    counters: CodecCounters,
}

impl Codec {
    /// Build a codec backed by the real Opus speech codec.
    pub fn new_opus(sample_rate: u32, bitrate: u32) -> VoxResult<Self> {
        validate_sample_rate(sample_rate)?;
        validate_bitrate(bitrate)?;
        let backend = OpusBackend::new(sample_rate, bitrate)?;
        Ok(Self::build(sample_rate, bitrate, Box::new(backend)))
    }

    /// Build a codec backed by the pass-through (no compression) backend.
    /// Legitimate as an explicit operating mode when `enableCodec=false`, or
    /// as a fallback when the real codec library is unavailable.
    pub fn new_passthrough(sample_rate: u32, bitrate: u32) -> VoxResult<Self> {
        validate_sample_rate(sample_rate)?;
        validate_bitrate(bitrate)?;
        Ok(Self::build(sample_rate, bitrate, Box::new(PassthroughBackend)))
    }

    fn build(sample_rate: u32, bitrate: u32, backend: Box<dyn CodecBackend>) -> Self {
        let frame_len = (sample_rate as usize * crate::FRAME_MS as usize) / 1000;
        Self {
            backend,
            sample_rate,
            frame_len,
            bitrate,
            counters: CodecCounters::default(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Change the bitrate used by the *next* `encode` call. Valid only
    /// within `[MIN_BITRATE, MAX_BITRATE]`.
    pub fn set_bitrate(&mut self, bps: u32) -> VoxResult<()> {
        validate_bitrate(bps)?;
        self.bitrate = bps;
        self.backend.set_bitrate(bps);
        Ok(())
    }

    /// Encode exactly `frame_len` samples. Any other length fails without
    /// partial consumption and counts as an encode error.
    pub fn encode(&mut self, samples: &[i16]) -> Option<Vec<u8>> {
        if samples.len() != self.frame_len {
            warn!(
                "codec encode: expected {} samples, got {}",
                self.frame_len,
                samples.len()
            );
            self.counters.encode_errors += 1;
            return None;
        }
        match self.backend.encode(samples) {
            Some(payload) if payload.len() <= MAX_PAYLOAD_LEN => {
                self.counters.encoded_frames += 1;
                Some(payload)
            }
            Some(oversized) => {
                warn!(
                    "codec encode produced oversized payload ({} bytes), dropping",
                    oversized.len()
                );
                self.counters.encode_errors += 1;
                None
            }
            None => {
                self.counters.encode_errors += 1;
                None
            }
        }
    }

    /// Decode a payload to `frame_len` samples at the codec's sample rate.
    pub fn decode(&mut self, payload: &[u8]) -> Option<Vec<i16>> {
        match self.backend.decode(payload, self.frame_len) {
            Some(samples) if samples.len() == self.frame_len => {
                self.counters.decoded_frames += 1;
                Some(samples)
            }
            Some(_) => {
                self.counters.decode_errors += 1;
                None
            }
            None => {
                self.counters.decode_errors += 1;
                None
            }
        }
    }

    pub fn counters(&self) -> CodecCounters {
        self.counters
    }
}

fn validate_sample_rate(rate: u32) -> VoxResult<()> {
    match rate {
        16_000 | 32_000 | 48_000 => Ok(()),
        other => Err(VoxError::Config(format!(
            "unsupported codec sample rate {other}"
        ))),
    }
}

fn validate_bitrate(bps: u32) -> VoxResult<()> {
    if (MIN_BITRATE..=MAX_BITRATE).contains(&bps) {
        Ok(())
    } else {
        Err(VoxError::Config(format!(
            "bitrate {bps} out of range [{MIN_BITRATE}, {MAX_BITRATE}]"
        )))
    }
}

/// Preserves the interface but performs no compression: the encoded payload
/// is the little-endian byte view of the input samples. Kept as a legitimate
/// operating mode (see DESIGN.md) rather than scaffolding only.
struct PassthroughBackend;

impl CodecBackend for PassthroughBackend {
    fn encode(&mut self, samples: &[i16]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        Some(out)
    }

    fn decode(&mut self, payload: &[u8], _frame_len: usize) -> Option<Vec<i16>> {
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

    fn set_bitrate(&mut self, _bps: u32) {}
}

struct OpusBackend {
    encoder: opus::Encoder,
    decoder: opus::Decoder,
}

impl OpusBackend {
    fn new(sample_rate: u32, bitrate: u32) -> VoxResult<Self> {
        let mut encoder = opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| VoxError::Codec(format!("opus encoder init: {e}")))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| VoxError::Codec(format!("opus set_bitrate: {e}")))?;
        let decoder = opus::Decoder::new(sample_rate, opus::Channels::Mono)
            .map_err(|e| VoxError::Codec(format!("opus decoder init: {e}")))?;
        Ok(Self { encoder, decoder })
    }
}

impl CodecBackend for OpusBackend {
    fn encode(&mut self, samples: &[i16]) -> Option<Vec<u8>> {
        let mut out = vec![0u8; MAX_PAYLOAD_LEN];
        match self.encoder.encode(samples, &mut out) {
            Ok(len) => {
                out.truncate(len);
                Some(out)
            }
            Err(e) => {
                warn!("opus encode error: {e}");
                None
            }
        }
    }

    fn decode(&mut self, payload: &[u8], frame_len: usize) -> Option<Vec<i16>> {
        let mut out = vec![0i16; frame_len];
        match self.decoder.decode(payload, &mut out, false) {
            Ok(n) => {
                out.truncate(n);
                Some(out)
            }
            Err(e) => {
                warn!("opus decode error: {e}");
                None
            }
        }
    }

    fn set_bitrate(&mut self, bps: u32) {
        if let Err(e) = self.encoder.set_bitrate(opus::Bitrate::Bits(bps as i32)) {
            warn!("opus set_bitrate failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_round_trips_any_frame() {
        let mut codec = Codec::new_passthrough(16_000, crate::DEFAULT_BITRATE).unwrap();
        let frame: Vec<i16> = (0..codec.frame_len())
            .map(|i| ((i as i32 * 137) % 30000 - 15000) as i16)
            .collect();
        let encoded = codec.encode(&frame).expect("encodes");
        let decoded = codec.decode(&encoded).expect("decodes");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn wrong_length_fails_without_partial_consumption() {
        let mut codec = Codec::new_passthrough(16_000, crate::DEFAULT_BITRATE).unwrap();
        let short = vec![0i16; codec.frame_len() - 1];
        assert!(codec.encode(&short).is_none());
        assert_eq!(codec.counters().encode_errors, 1);
        assert_eq!(codec.counters().encoded_frames, 0);
    }

    #[test]
    fn rejects_out_of_range_bitrate() {
        assert!(Codec::new_passthrough(16_000, 100).is_err());
        assert!(Codec::new_passthrough(16_000, 20_000).is_err());
    }

    #[test]
    fn rejects_unsupported_sample_rate() {
        assert!(Codec::new_passthrough(44_100, crate::DEFAULT_BITRATE).is_err());
    }

    #[test]
    fn set_bitrate_validates_range() {
        let mut codec = Codec::new_passthrough(16_000, crate::DEFAULT_BITRATE).unwrap();
        assert!(codec.set_bitrate(1_000).is_err());
        assert!(codec.set_bitrate(8_000).is_ok());
        assert_eq!(codec.bitrate(), 8_000);
    }
}
