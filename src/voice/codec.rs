//! # PCM Framing and Transport Coding
//!
//! Converts between the three audio representations the voice session deals
//! with:
//!
//! - **Capture frames**: floating-point samples from the widget's microphone
//!   tap, normalized to [-1.0, 1.0).
//! - **Wire payloads**: base64 text carrying raw 16-bit signed little-endian
//!   PCM, the format the live endpoint expects in both directions.
//! - **Playback frames**: de-interleaved per-channel f32 sample arrays ready
//!   for scheduling.
//!
//! Sample rate and channel count are never read from a payload; both sides
//! agree on them out of band (outbound 16 kHz mono, inbound 24 kHz mono).

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// A decoded inbound audio chunk, ready for the playback scheduler.
///
/// ## Fields:
/// - **channels**: one normalized sample array per channel
/// - **sample_rate**: the fixed session playback rate (not taken from the wire)
/// - **duration**: playback length in seconds, derived from the frame count
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
    pub duration: f64,
}

impl DecodedFrame {
    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }
}

/// Convert normalized float samples to 16-bit PCM.
///
/// Samples are scaled by 32768 and clamped into the i16 range, so values at
/// the extremes of [-1.0, 1.0) survive without wrapping.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Convert 16-bit PCM samples to normalized floats in [-1.0, 1.0).
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Pack 16-bit samples as little-endian bytes.
pub fn pack_pcm16(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing to a Vec cannot fail.
        bytes.write_i16::<LittleEndian>(sample).unwrap();
    }
    bytes
}

/// Unpack little-endian bytes into 16-bit samples.
///
/// ## Errors:
/// Rejects empty input and odd byte counts; both indicate a malformed or
/// truncated payload rather than valid audio.
pub fn unpack_pcm16(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.is_empty() {
        return Err("no audio data provided".to_string());
    }
    if data.len() % 2 != 0 {
        return Err("audio data length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode one captured microphone frame for transmission.
///
/// float samples → 16-bit PCM → little-endian bytes → base64 text. The
/// result goes out as a realtime media chunk tagged with the capture mime
/// descriptor (e.g. `audio/pcm;rate=16000`).
pub fn encode_capture_frame(samples: &[f32]) -> String {
    B64.encode(pack_pcm16(&float_to_pcm(samples)))
}

/// Decode one inbound transport payload into a playable frame.
///
/// ## Behavior:
/// base64 text → little-endian PCM16 → de-interleave into `channel_count`
/// arrays → normalize by 32768. Duration is computed from the frame count at
/// `sample_rate`.
///
/// ## Errors:
/// Malformed base64, odd byte counts, or a sample count that does not divide
/// evenly across channels all fail decoding; callers treat this as a dropped
/// frame, never a session fault.
pub fn decode_playback_payload(
    payload: &str,
    sample_rate: u32,
    channel_count: usize,
) -> Result<DecodedFrame, String> {
    if channel_count == 0 {
        return Err("channel count must be at least 1".to_string());
    }

    let bytes = B64
        .decode(payload)
        .map_err(|e| format!("invalid transport encoding: {}", e))?;
    let interleaved = unpack_pcm16(&bytes)?;

    if interleaved.len() % channel_count != 0 {
        return Err(format!(
            "sample count {} does not divide across {} channels",
            interleaved.len(),
            channel_count
        ));
    }

    let frame_count = interleaved.len() / channel_count;
    let mut channels = vec![Vec::with_capacity(frame_count); channel_count];
    for (i, &sample) in interleaved.iter().enumerate() {
        channels[i % channel_count].push(sample as f32 / 32768.0);
    }

    Ok(DecodedFrame {
        channels,
        sample_rate,
        duration: frame_count as f64 / sample_rate as f64,
    })
}
