//! PCM codec utilities
//!
//! Conversions between float32 samples, 16-bit little-endian PCM and the
//! base64 wire encoding the live endpoint expects, plus a RIFF/WAVE header
//! builder for exporting recorded audio. All functions here are pure data
//! transforms; malformed input fails with a [`CodecError`] rather than
//! producing garbage audio.

use base64::engine::general_purpose;
use base64::Engine;
use std::time::Duration;
use thiserror::Error;

/// Sample rate of microphone audio sent to the endpoint.
pub const WIRE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized speech received from the endpoint.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Mime tag attached to outbound PCM frames.
pub const WIRE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Error type for codec operations
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("truncated PCM payload: {len} bytes is not a whole number of {channels}-channel frames")]
    Truncated { len: usize, channels: u16 },

    #[error("channel count must be at least 1")]
    NoChannels,

    #[error("unsupported mime type: {0}")]
    BadMimeType(String),
}

/// A base64-encoded PCM payload ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireAudio {
    pub data: String,
    pub mime_type: String,
}

/// Decoded audio with per-channel float32 samples in [-1, 1].
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Number of sample frames (per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Playback duration at this buffer's sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

/// Scale float32 samples in [-1, 1] to signed 16-bit PCM. Out-of-range
/// samples are clamped.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect()
}

/// Inverse of [`f32_to_i16`], within 16-bit quantization error.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|s| *s as f32 / 32768.0).collect()
}

/// Base64-encode signed 16-bit PCM as little-endian bytes, tagged with the
/// outbound mime type.
pub fn encode_pcm16(samples: &[i16]) -> WireAudio {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    WireAudio {
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: WIRE_MIME_TYPE.to_string(),
    }
}

/// Scale float32 samples to 16-bit PCM and base64-encode for the wire.
pub fn encode_to_wire(samples: &[f32]) -> WireAudio {
    encode_pcm16(&f32_to_i16(samples))
}

/// Decode a base64 PCM payload into per-channel float32 samples,
/// de-interleaving multi-channel data.
pub fn decode_from_wire(data: &str, sample_rate: u32, channels: u16) -> Result<AudioBuffer, CodecError> {
    if channels == 0 {
        return Err(CodecError::NoChannels);
    }
    let bytes = general_purpose::STANDARD.decode(data)?;
    decode_pcm16_bytes(&bytes, sample_rate, channels)
}

/// Decode raw little-endian 16-bit PCM bytes into per-channel float32
/// samples. A payload that is not a whole number of frames is rejected.
pub fn decode_pcm16_bytes(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer, CodecError> {
    if channels == 0 {
        return Err(CodecError::NoChannels);
    }
    let frame_bytes = channels as usize * 2;
    if bytes.len() % frame_bytes != 0 {
        return Err(CodecError::Truncated {
            len: bytes.len(),
            channels,
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(frames); channels as usize];
    for frame in bytes.chunks_exact(frame_bytes) {
        for (ch, sample) in frame.chunks_exact(2).enumerate() {
            let v = i16::from_le_bytes([sample[0], sample[1]]);
            out[ch].push(v as f32 / 32768.0);
        }
    }

    Ok(AudioBuffer {
        channels: out,
        sample_rate,
    })
}

/// Parse the sample rate out of a `audio/pcm;rate=NNNNN` mime tag.
pub fn rate_from_mime(mime: &str) -> Result<u32, CodecError> {
    let bad = || CodecError::BadMimeType(mime.to_string());
    let (kind, params) = mime.split_once(';').ok_or_else(bad)?;
    if kind.trim() != "audio/pcm" {
        return Err(bad());
    }
    for param in params.split(';') {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim() == "rate" {
                return value.trim().parse().map_err(|_| bad());
            }
        }
    }
    Err(bad())
}

/// Build a standard 44-byte RIFF/WAVE header for raw PCM of the given length.
pub fn wav_header(data_len: u32, sample_rate: u32, channels: u16, bits_per_sample: u16) -> [u8; 44] {
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;
    let file_size = 36 + data_len;

    let mut header = [0u8; 44];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&file_size.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    // fmt chunk
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM format
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());

    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_roundtrip_within_quantization_error() {
        let mut rng = rand::rng();
        let samples: Vec<f32> = (0..4096).map(|_| rng.random_range(-1.0f32..=1.0)).collect();

        let wire = encode_to_wire(&samples);
        let decoded = decode_from_wire(&wire.data, WIRE_SAMPLE_RATE, 1).unwrap();

        assert_eq!(decoded.channels.len(), 1);
        assert_eq!(decoded.frames(), samples.len());
        for (orig, round) in samples.iter().zip(&decoded.channels[0]) {
            assert!(
                (orig - round).abs() <= 1.5 / 32768.0,
                "sample {} round-tripped to {}",
                orig,
                round
            );
        }
    }

    #[test]
    fn test_out_of_range_samples_clamp() {
        let encoded = f32_to_i16(&[2.0, -2.0, 0.0]);
        assert_eq!(encoded, vec![32767, -32767, 0]);
    }

    #[test]
    fn test_deinterleaves_stereo() {
        // Frames: (1, -1), (2, -2) as i16
        let mut bytes = Vec::new();
        for v in [1i16, -1, 2, -2] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let data = general_purpose::STANDARD.encode(&bytes);

        let buf = decode_from_wire(&data, 24_000, 2).unwrap();
        assert_eq!(buf.channels.len(), 2);
        assert_eq!(buf.frames(), 2);
        assert!((buf.channels[0][0] - 1.0 / 32768.0).abs() < f32::EPSILON);
        assert!((buf.channels[1][1] + 2.0 / 32768.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_malformed_base64_is_an_error() {
        assert!(matches!(
            decode_from_wire("not base64!!!", 16_000, 1),
            Err(CodecError::Base64(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        // 3 bytes cannot hold a whole number of mono 16-bit frames.
        let data = general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(
            decode_from_wire(&data, 16_000, 1),
            Err(CodecError::Truncated { len: 3, channels: 1 })
        ));
    }

    #[test]
    fn test_duration() {
        let buf = AudioBuffer {
            channels: vec![vec![0.0; 24_000]],
            sample_rate: 24_000,
        };
        assert_eq!(buf.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_rate_from_mime() {
        assert_eq!(rate_from_mime("audio/pcm;rate=24000").unwrap(), 24_000);
        assert_eq!(rate_from_mime("audio/pcm; rate=16000").unwrap(), 16_000);
        assert!(rate_from_mime("audio/ogg;rate=24000").is_err());
        assert!(rate_from_mime("audio/pcm").is_err());
    }

    #[test]
    fn test_wav_header_matches_hound() {
        let samples: Vec<i16> = (0..1600).map(|i| (i % 128) as i16).collect();

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in &samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }

        let ours = wav_header(samples.len() as u32 * 2, 16_000, 1, 16);
        assert_eq!(&cursor.get_ref()[..44], &ours[..]);
    }
}
