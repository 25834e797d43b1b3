//! # PCM Codec
//!
//! Stateless conversions between the transport representation of audio
//! (base64 text wrapping 16-bit little-endian PCM) and float samples.
//!
//! ## Formats:
//! - **Outbound**: mono f32 → PCM16LE bytes → base64 (`audio/pcm;rate=16000`)
//! - **Inbound**: base64 → PCM16LE bytes → planar f32 buffer (24kHz mono by default)
//!
//! ## Scaling:
//! Samples map to integers by a factor of 32768. Encoding saturates: input is
//! clamped to [-1.0, 1.0] and the product to the i16 range, so loud input
//! clips instead of wrapping around.

use crate::audio::buffer::AudioBuffer;
use crate::live::error::{LiveError, LiveResult};
use base64::{engine::general_purpose, Engine as _};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{self, Cursor, Seek, Write};

/// Scale factor between normalized floats and 16-bit PCM.
pub const PCM16_SCALE: f32 = 32768.0;

/// Bytes per 16-bit sample.
const BYTES_PER_SAMPLE: usize = 2;

/// Encode raw bytes as standard (padded) base64 text.
pub fn bytes_to_text(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode base64 text back into raw bytes.
///
/// ## Errors:
/// `LiveError::Decode` if the text is not valid standard base64.
pub fn text_to_bytes(text: &str) -> LiveResult<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(text.trim())?)
}

/// Interpret `bytes` as interleaved PCM16LE and build a planar float buffer.
///
/// ## Truncation:
/// A trailing partial frame (fewer than `2 * channel_count` bytes) is dropped
/// silently; there is no padding policy.
///
/// ## Errors:
/// `LiveError::Decode` for a zero channel count or sample rate.
pub fn decode_frame(bytes: &[u8], sample_rate: u32, channel_count: u16) -> LiveResult<AudioBuffer> {
    if channel_count == 0 {
        return Err(LiveError::Decode("channel count must be at least 1".to_string()));
    }
    if sample_rate == 0 {
        return Err(LiveError::Decode("sample rate must be greater than 0".to_string()));
    }

    let channels = channel_count as usize;
    let frame_bytes = BYTES_PER_SAMPLE * channels;
    let frame_count = bytes.len() / frame_bytes;

    let mut planes = vec![Vec::with_capacity(frame_count); channels];
    for frame in bytes.chunks_exact(frame_bytes) {
        for (channel, sample) in frame.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
            let value = LittleEndian::read_i16(sample);
            planes[channel].push(value as f32 / PCM16_SCALE);
        }
    }

    Ok(AudioBuffer::new(sample_rate, planes))
}

/// Quantize one float sample to PCM16 with saturation.
///
/// NaN becomes silence; everything else is clamped, scaled and truncated
/// toward zero.
pub fn quantize_sample(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = sample.clamp(-1.0, 1.0) * PCM16_SCALE;
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert float samples to PCM16LE bytes.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(quantize_sample(sample));
    }
    bytes
}

/// Decode a base64 PCM16 payload straight into a playable buffer.
pub fn decode_base64_pcm(text: &str, sample_rate: u32, channel_count: u16) -> LiveResult<AudioBuffer> {
    let bytes = text_to_bytes(text)?;
    decode_frame(&bytes, sample_rate, channel_count)
}

/// Encode float samples straight into base64 PCM16 text.
pub fn encode_base64_pcm(samples: &[f32]) -> String {
    bytes_to_text(&encode_frame(samples))
}

/// Write interleaved float samples as a 16-bit PCM WAV stream.
pub fn write_wav<W: Write + Seek>(
    interleaved: &[f32],
    sample_rate: u32,
    channel_count: u16,
    writer: &mut W,
) -> io::Result<()> {
    let pcm: Vec<i16> = interleaved.iter().map(|&s| quantize_sample(s)).collect();
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, channel_count, sample_rate, 16);
    wav::write(header, &wav::BitDepth::Sixteen(pcm), writer)
}

/// Render a buffer as an in-memory WAV file.
pub fn wav_bytes(buffer: &AudioBuffer) -> io::Result<Vec<u8>> {
    let channels = u16::try_from(buffer.channel_count())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many channels"))?;
    let mut out = Cursor::new(Vec::new());
    write_wav(&buffer.interleaved(), buffer.sample_rate(), channels.max(1), &mut out)?;
    Ok(out.into_inner())
}
