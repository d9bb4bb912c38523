//! # Upstream Live Session
//!
//! WebSocket client for the hosted model's bidirectional audio endpoint.
//! The protocol is a fixed external contract: a JSON setup frame declaring
//! model, response modality and persona, then realtime media chunks out and
//! server-content frames in.
//!
//! The connection is split into a writer task (capture frames, teardown) and
//! a reader task that normalizes every server frame into a `SessionEvent`
//! tagged with the session epoch. The controller never touches the socket.

use crate::config::LiveConfig;
use crate::voice::session::{LiveConnection, OutboundFrame, SendError, SessionEvent};
use crate::voice::VoiceError;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Handle to one established upstream session.
///
/// Owned exclusively by the session controller. Dropping it (or calling
/// `close`) releases the socket; the reader task then emits `Closed`.
pub struct UpstreamSession {
    /// Capacity-1 handoff to the writer task: at most one capture frame is
    /// ever in flight, `Busy` otherwise.
    media_tx: mpsc::Sender<OutboundFrame>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl LiveConnection for UpstreamSession {
    fn send_media(&mut self, frame: OutboundFrame) -> Result<(), SendError> {
        self.media_tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(frame) => SendError::Busy(frame),
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn close(&mut self) {
        // Second close, or close after the writer already died: no-op.
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Open the streaming session and send the setup frame.
///
/// Every event the connection later produces is delivered through `events`
/// tagged with `epoch`, so the controller can discard anything from a
/// session it has since replaced. Confirmation of setup arrives as
/// `SessionEvent::Opened`, not as a return value.
pub async fn connect(
    cfg: &LiveConfig,
    api_key: &str,
    epoch: u64,
    events: mpsc::UnboundedSender<(u64, SessionEvent)>,
) -> Result<UpstreamSession, VoiceError> {
    let url = format!("{}?key={}", cfg.endpoint, api_key);
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| VoiceError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    let setup = json!({
        "setup": {
            "model": cfg.model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": cfg.voice } }
                }
            },
            "systemInstruction": { "parts": [{ "text": cfg.system_instruction }] }
        }
    });
    sink.send(Message::Text(setup.to_string()))
        .await
        .map_err(|e| VoiceError::Connect(e.to_string()))?;

    let (media_tx, mut media_rx) = mpsc::channel::<OutboundFrame>(1);
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    // Writer: forward capture frames as realtime media chunks; on teardown
    // send a close frame and stop.
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut close_rx => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                frame = media_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let chunk = json!({
                        "realtimeInput": {
                            "mediaChunks": [{ "mimeType": frame.mime, "data": frame.payload }]
                        }
                    });
                    if sink.send(Message::Text(chunk.to_string())).await.is_err() {
                        // Reader will observe the broken socket and report it.
                        break;
                    }
                }
            }
        }
    });

    // Reader: normalize server frames into session events.
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(txt)) => {
                    for event in parse_server_frame(txt.as_bytes()) {
                        let _ = events.send((epoch, event));
                    }
                }
                // The endpoint also delivers JSON frames as binary messages.
                Ok(Message::Binary(bin)) => {
                    for event in parse_server_frame(&bin) {
                        let _ = events.send((epoch, event));
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // ping/pong handled by the transport
                Err(e) => {
                    let _ = events.send((epoch, SessionEvent::Error(e.to_string())));
                    return;
                }
            }
        }
        let _ = events.send((epoch, SessionEvent::Closed));
    });

    Ok(UpstreamSession {
        media_tx,
        close_tx: Some(close_tx),
    })
}

/// Translate one server frame into session events.
///
/// A frame may carry several things at once (multiple audio parts, an
/// interruption flag); unrecognized or unparseable frames yield nothing —
/// a malformed frame is a dropped frame, not a session fault.
fn parse_server_frame(raw: &[u8]) -> Vec<SessionEvent> {
    let Ok(v) = serde_json::from_slice::<serde_json::Value>(raw) else {
        debug!("dropping unparseable server frame");
        return Vec::new();
    };

    let mut events = Vec::new();

    if v.get("setupComplete").is_some() {
        events.push(SessionEvent::Opened);
    }

    if let Some(content) = v.get("serverContent") {
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(|p| p.as_array()) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(|d| d.as_str()) {
                    events.push(SessionEvent::Media(data.to_string()));
                }
            }
        }
        if content
            .get("interrupted")
            .and_then(|i| i.as_bool())
            .unwrap_or(false)
        {
            events.push(SessionEvent::Interrupted);
        }
    }

    if let Some(err) = v.get("error") {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unspecified upstream error");
        events.push(SessionEvent::Error(msg.to_string()));
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_complete_maps_to_opened() {
        let events = parse_server_frame(br#"{"setupComplete": {}}"#);
        assert!(matches!(events.as_slice(), [SessionEvent::Opened]));
    }

    #[test]
    fn test_model_turn_audio_parts_map_to_media() {
        let frame = br#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "BBBB"}}
                    ]
                }
            }
        }"#;
        let events = parse_server_frame(frame);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SessionEvent::Media(d) if d == "AAAA"));
        assert!(matches!(&events[1], SessionEvent::Media(d) if d == "BBBB"));
    }

    #[test]
    fn test_interruption_flag_follows_audio_in_same_frame() {
        let frame = br#"{
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [{"inlineData": {"data": "AAAA"}}]}
            }
        }"#;
        let events = parse_server_frame(frame);
        assert!(matches!(&events[0], SessionEvent::Media(_)));
        assert!(matches!(&events[1], SessionEvent::Interrupted));
    }

    #[test]
    fn test_parts_without_audio_yield_nothing() {
        let frame = br#"{"serverContent": {"modelTurn": {"parts": [{"text": "hello"}]}}}"#;
        assert!(parse_server_frame(frame).is_empty());
    }

    #[test]
    fn test_error_frame_carries_message() {
        let events = parse_server_frame(br#"{"error": {"message": "quota exceeded"}}"#);
        assert!(matches!(&events[0], SessionEvent::Error(m) if m == "quota exceeded"));
    }

    #[test]
    fn test_garbage_frames_are_dropped() {
        assert!(parse_server_frame(b"not json at all").is_empty());
        assert!(parse_server_frame(br#"{"unrelated": 1}"#).is_empty());
    }
}
