//! # Voice Session Core
//!
//! Real-time voice loop between the assistant widget and the hosted model:
//! microphone capture frames go out as transport-encoded PCM, synthesized
//! speech comes back as PCM chunks that are scheduled for gapless playback.
//!
//! ## Components:
//! - **codec**: PCM16 ⇄ f32 framing plus base64 transport coding
//! - **playback**: the playback scheduler (cursor, active source set)
//! - **session**: session lifecycle state machine and capture handoff
//! - **live**: the upstream streaming connection over WebSocket
//!
//! ## Framing contract (fixed, agreed out of band):
//! - Outbound: 16-bit little-endian PCM, mono, 16 kHz
//! - Inbound: 16-bit little-endian PCM, mono, 24 kHz

pub mod codec;
pub mod live;
pub mod playback;
pub mod session;

use std::fmt;

/// The PCM framing both ends agreed on out of band. Payloads never carry
/// their own format description.
#[derive(Debug, Clone, Copy)]
pub struct AudioFormat {
    /// Microphone capture rate (outbound frames), Hz.
    pub capture_rate: u32,
    /// Synthesized speech rate (inbound frames), Hz.
    pub playback_rate: u32,
    /// Channel count in both directions.
    pub channels: usize,
}

impl AudioFormat {
    /// Mime descriptor attached to every outbound realtime media chunk.
    pub fn capture_mime(&self) -> String {
        format!("audio/pcm;rate={}", self.capture_rate)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            capture_rate: 16_000,
            playback_rate: 24_000,
            channels: 1,
        }
    }
}

/// Failures confined to the voice session boundary.
///
/// None of these propagate as faults to the surrounding service: the
/// session transitions to inactive, resources are released, and the widget
/// only ever observes the active/inactive signal plus a logged diagnostic.
#[derive(Debug)]
pub enum VoiceError {
    /// The widget reported that microphone access was refused.
    PermissionDenied,
    /// The upstream streaming connection could not be established.
    Connect(String),
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::PermissionDenied => write!(f, "microphone permission denied"),
            VoiceError::Connect(msg) => write!(f, "live connection failed: {}", msg),
        }
    }
}

impl std::error::Error for VoiceError {}
