//! # Assistant WebSocket Gateway
//!
//! The browser widget's single connection into the backend. Clients connect
//! to `/ws/assistant`, toggle the voice session with JSON control messages,
//! and stream microphone audio as binary frames while the session is active.
//!
//! ## WebSocket Protocol:
//! - **Client → Server (text)**: `voice_start`, `voice_stop`,
//!   `permission_denied`, `pong`
//! - **Client → Server (binary)**: raw little-endian f32 samples, one
//!   capture frame per message
//! - **Server → Client (text)**: `voice_state` transitions, `audio` chunks
//!   scheduled for playback, `stop` for force-stopped chunks, `flush` on
//!   interruption, `error`, `ping`
//!
//! Each connection owns exactly one `SessionController`; closing the socket
//! tears the live session down with it.

use crate::state::AppState;
use crate::voice::codec::{self, DecodedFrame};
use crate::voice::live::{self, UpstreamSession};
use crate::voice::playback::{AudioOutput, PlaybackScheduler, RenderClock, SourceId};
use crate::voice::session::{SessionController, SessionEvent, SessionState};
use crate::voice::{AudioFormat, VoiceError};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Gateway message types for widget-server communication.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayMessage {
    /// Widget requests a live voice session.
    #[serde(rename = "voice_start")]
    VoiceStart,

    /// Widget releases the voice session.
    #[serde(rename = "voice_stop")]
    VoiceStop,

    /// Widget could not obtain microphone access.
    #[serde(rename = "permission_denied")]
    PermissionDenied,

    /// Session lifecycle transition.
    #[serde(rename = "voice_state")]
    VoiceState { state: String },

    /// One synthesized audio chunk, scheduled for playback.
    #[serde(rename = "audio")]
    Audio {
        /// Playback source id, echoed back in `stop`.
        id: SourceId,
        /// Render-clock start time in seconds.
        start: f64,
        /// Base64 PCM16 little-endian samples.
        data: String,
        sample_rate: u32,
        channels: usize,
    },

    /// Force-stop one previously scheduled chunk.
    #[serde(rename = "stop")]
    Stop { id: SourceId },

    /// The model was interrupted; discard everything not yet played.
    #[serde(rename = "flush")]
    Flush,

    /// Error messages.
    #[serde(rename = "error")]
    Error { code: String, message: String },

    /// Heartbeat/ping message.
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// Heartbeat/pong response.
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// Render clock shared between the scheduler and the widget output, so both
/// measure time from the same origin.
#[derive(Clone, Copy)]
pub struct SharedClock {
    origin: Instant,
}

impl SharedClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl RenderClock for SharedClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Playback output that forwards scheduled chunks to the widget.
///
/// The widget does the actual rendering; this side keeps the schedule and
/// source bookkeeping authoritative. Natural end of a chunk is simulated by
/// a timer at `start + duration`, delivered back to the actor.
pub struct WidgetOutput {
    addr: Addr<AssistantSocket>,
    clock: SharedClock,
    next_id: SourceId,
}

impl AudioOutput for WidgetOutput {
    fn schedule(&mut self, frame: DecodedFrame, start: f64) -> Option<SourceId> {
        let id = self.next_id;
        self.next_id += 1;

        let ends_in = (start + frame.duration - self.clock.now()).max(0.0);
        self.addr.do_send(ChunkScheduled {
            id,
            start,
            payload: encode_widget_payload(&frame),
            sample_rate: frame.sample_rate,
            channels: frame.channels.len(),
            ends_in: Duration::from_secs_f64(ends_in),
        });
        Some(id)
    }

    fn stop(&mut self, id: SourceId) {
        self.addr.do_send(ChunkStopped { id });
    }
}

/// Re-interleave a decoded frame and transport-encode it for the widget.
fn encode_widget_payload(frame: &DecodedFrame) -> String {
    let frames = frame.frame_count();
    let mut interleaved = Vec::with_capacity(frames * frame.channels.len());
    for i in 0..frames {
        for channel in &frame.channels {
            interleaved.push(channel[i]);
        }
    }
    B64.encode(codec::pack_pcm16(&codec::float_to_pcm(&interleaved)))
}

type Controller = SessionController<UpstreamSession, SharedClock, WidgetOutput>;

/// WebSocket actor owning one widget connection and its voice session.
pub struct AssistantSocket {
    /// Connection id for log correlation.
    connection_id: Uuid,

    app_state: web::Data<AppState>,

    /// Created in `started` once the actor address exists.
    controller: Option<Controller>,

    /// Shared with the controller's scheduler and the widget output.
    clock: SharedClock,

    /// Upstream events funnel through this pair into the actor mailbox.
    event_tx: Option<mpsc::UnboundedSender<(u64, SessionEvent)>>,

    /// Whether this session is counted in the active-sessions gauge.
    counted: bool,

    /// Last state reported to the widget, to emit transitions exactly once.
    reported_state: SessionState,

    /// Upper bound on incoming capture frames, from `audio.frame_samples`.
    frame_samples: usize,

    last_heartbeat: Instant,
}

impl AssistantSocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        let frame_samples = app_state.get_config().audio.frame_samples;
        Self {
            connection_id: Uuid::new_v4(),
            app_state,
            controller: None,
            clock: SharedClock::new(),
            event_tx: None,
            counted: false,
            reported_state: SessionState::Inactive,
            frame_samples,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &GatewayMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            ctx.text(json);
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code, message, "gateway error");
        self.send_message(
            ctx,
            &GatewayMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Report a state transition to the widget and keep the session gauge
    /// in sync. Call after anything that may have changed controller state.
    fn sync_state(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(controller) = self.controller.as_ref() else {
            return;
        };
        let state = controller.state();
        if state == self.reported_state {
            return;
        }
        self.reported_state = state;

        match state {
            SessionState::Active => {
                if !self.counted {
                    self.app_state.increment_active_sessions();
                    self.counted = true;
                }
            }
            SessionState::Inactive => {
                if self.counted {
                    self.app_state.decrement_active_sessions();
                    self.counted = false;
                }
            }
            SessionState::Connecting => {}
        }

        self.send_message(
            ctx,
            &GatewayMessage::VoiceState {
                state: state.as_str().to_string(),
            },
        );
    }

    fn handle_voice_start(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let config = self.app_state.get_config();

        let max = config.performance.max_concurrent_sessions as u32;
        if !self.counted && self.app_state.active_voice_sessions() >= max {
            self.send_error(ctx, "session_limit", "All voice session slots are in use");
            return;
        }

        let api_key = match self.app_state.get_config().api_key() {
            Ok(key) => key,
            Err(err) => {
                self.send_error(ctx, "api_key_missing", &err.to_string());
                return;
            }
        };

        let (Some(controller), Some(event_tx)) = (self.controller.as_mut(), self.event_tx.clone())
        else {
            return;
        };

        let epoch = controller.start();
        self.sync_state(ctx);

        let addr = ctx.address();
        tokio::spawn(async move {
            match live::connect(&config.live, &api_key, epoch, event_tx).await {
                Ok(conn) => addr.do_send(UpstreamConnected { epoch, conn }),
                Err(err) => addr.do_send(UpstreamConnectFailed {
                    epoch,
                    reason: err.to_string(),
                }),
            }
        });
    }

    fn handle_voice_stop(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(controller) = self.controller.as_mut() {
            controller.stop();
        }
        self.sync_state(ctx);
    }

    /// The widget's getUserMedia was refused; any session in flight is
    /// useless without capture, so tear it down.
    fn handle_permission_denied(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let err = VoiceError::PermissionDenied;
        warn!(connection = %self.connection_id, "{}", err);
        if let Some(controller) = self.controller.as_mut() {
            controller.stop();
        }
        self.send_error(ctx, "permission_denied", &err.to_string());
        self.sync_state(ctx);
    }

    /// One binary microphone frame: little-endian f32 samples.
    fn handle_capture_frame(&mut self, data: &[u8]) {
        let samples = match decode_capture_frame(data, self.frame_samples) {
            Ok(samples) => samples,
            Err(err) => {
                warn!(%err, "dropping capture frame");
                return;
            }
        };

        if let Some(controller) = self.controller.as_mut() {
            controller.push_capture_frame(&samples);
        }
    }
}

/// Decode one binary microphone frame into f32 samples.
///
/// `max_samples` is the configured capture chunk size (`audio.frame_samples`);
/// the widget may flush a shorter tail frame, but anything larger is not a
/// frame it produces and is rejected.
fn decode_capture_frame(data: &[u8], max_samples: usize) -> Result<Vec<f32>, String> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(format!("malformed capture frame of {} bytes", data.len()));
    }
    let samples = data.len() / 4;
    if samples > max_samples {
        return Err(format!(
            "capture frame of {} samples exceeds the configured {}",
            samples, max_samples
        ));
    }

    Ok(data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Connection handle for a session the actor started.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamConnected {
    epoch: u64,
    conn: UpstreamSession,
}

/// Connect attempt failed before a handle existed.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamConnectFailed {
    epoch: u64,
    reason: String,
}

/// One upstream event, tagged with the epoch it belongs to.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamEvent {
    epoch: u64,
    event: SessionEvent,
}

/// The scheduler accepted a chunk; forward it to the widget and arrange the
/// natural-end timer.
#[derive(Message)]
#[rtype(result = "()")]
struct ChunkScheduled {
    id: SourceId,
    start: f64,
    payload: String,
    sample_rate: u32,
    channels: usize,
    ends_in: Duration,
}

/// The scheduler force-stopped a chunk.
#[derive(Message)]
#[rtype(result = "()")]
struct ChunkStopped {
    id: SourceId,
}

impl Actor for AssistantSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "assistant connection started");

        let addr = ctx.address();
        let output = WidgetOutput {
            addr: addr.clone(),
            clock: self.clock.clone(),
            next_id: 0,
        };
        let config = self.app_state.get_config();
        let format = AudioFormat {
            capture_rate: config.audio.capture_rate,
            playback_rate: config.audio.playback_rate,
            channels: config.audio.channels,
        };
        self.controller = Some(SessionController::new(
            format,
            PlaybackScheduler::new(self.clock.clone(), output),
        ));

        // One forwarder for the lifetime of the connection; stale epochs are
        // filtered in the controller, not here.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(u64, SessionEvent)>();
        self.event_tx = Some(event_tx);
        tokio::spawn(async move {
            while let Some((epoch, event)) = event_rx.recv().await {
                addr.do_send(UpstreamEvent { epoch, event });
            }
        });

        // Heartbeat timer.
        ctx.run_interval(Duration::from_secs(30), |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > Duration::from_secs(60) {
                warn!("assistant heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }

            let ping = GatewayMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
            };
            if let Ok(json) = serde_json::to_string(&ping) {
                ctx.text(json);
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "assistant connection stopped");

        // Socket gone: tear the live session down with it.
        if let Some(controller) = self.controller.as_mut() {
            info!(
                connection = %self.connection_id,
                frames_sent = controller.frames_sent(),
                frames_dropped = controller.frames_dropped(),
                "capture totals at teardown"
            );
            controller.stop();
        }
        if self.counted {
            self.app_state.decrement_active_sessions();
            self.counted = false;
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AssistantSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<GatewayMessage>(&text) {
                Ok(GatewayMessage::VoiceStart) => self.handle_voice_start(ctx),
                Ok(GatewayMessage::VoiceStop) => self.handle_voice_stop(ctx),
                Ok(GatewayMessage::PermissionDenied) => self.handle_permission_denied(ctx),
                Ok(GatewayMessage::Pong { .. }) => {
                    self.last_heartbeat = Instant::now();
                }
                Ok(_) => {
                    warn!("received unexpected message type from widget");
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                }
            },
            Ok(ws::Message::Binary(data)) => {
                self.handle_capture_frame(&data);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("assistant connection closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<UpstreamConnected> for AssistantSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamConnected, ctx: &mut Self::Context) {
        if let Some(controller) = self.controller.as_mut() {
            controller.connected(msg.epoch, msg.conn);
        }
        self.sync_state(ctx);
    }
}

impl Handler<UpstreamConnectFailed> for AssistantSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamConnectFailed, ctx: &mut Self::Context) {
        if let Some(controller) = self.controller.as_mut() {
            controller.connect_failed(msg.epoch, &msg.reason);
        }
        self.send_error(ctx, "connect_failed", &msg.reason);
        self.sync_state(ctx);
    }
}

impl Handler<UpstreamEvent> for AssistantSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamEvent, ctx: &mut Self::Context) {
        let interrupted = matches!(msg.event, SessionEvent::Interrupted);
        let error = match &msg.event {
            SessionEvent::Error(reason) => Some(reason.clone()),
            _ => None,
        };

        let Some(controller) = self.controller.as_mut() else {
            return;
        };
        let current = controller.epoch();
        controller.dispatch(msg.epoch, msg.event);

        // Surface to the widget only what it can act on, and only for the
        // session it is watching.
        if msg.epoch == current {
            if interrupted {
                self.send_message(ctx, &GatewayMessage::Flush);
            }
            if let Some(reason) = error {
                self.send_error(ctx, "upstream_error", &reason);
            }
        }

        self.sync_state(ctx);
    }
}

impl Handler<ChunkScheduled> for AssistantSocket {
    type Result = ();

    fn handle(&mut self, msg: ChunkScheduled, ctx: &mut Self::Context) {
        debug!(id = msg.id, start = msg.start, "forwarding audio chunk");
        self.send_message(
            ctx,
            &GatewayMessage::Audio {
                id: msg.id,
                start: msg.start,
                data: msg.payload,
                sample_rate: msg.sample_rate,
                channels: msg.channels,
            },
        );

        // The chunk ends on its own unless force-stopped first; stale end
        // reports are harmless because source ids are never reused.
        let id = msg.id;
        ctx.run_later(msg.ends_in, move |act, _ctx| {
            if let Some(controller) = act.controller.as_mut() {
                controller.handle_source_ended(id);
            }
        });
    }
}

impl Handler<ChunkStopped> for AssistantSocket {
    type Result = ();

    fn handle(&mut self, msg: ChunkStopped, ctx: &mut Self::Context) {
        self.send_message(ctx, &GatewayMessage::Stop { id: msg.id });
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to an `AssistantSocket` actor.
pub async fn assistant_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "new assistant connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    ws::start(AssistantSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_messages_parse() {
        let msg: GatewayMessage = serde_json::from_str(r#"{"type": "voice_start"}"#).unwrap();
        assert!(matches!(msg, GatewayMessage::VoiceStart));

        let msg: GatewayMessage = serde_json::from_str(r#"{"type": "voice_stop"}"#).unwrap();
        assert!(matches!(msg, GatewayMessage::VoiceStop));
    }

    #[test]
    fn test_audio_message_serialization() {
        let msg = GatewayMessage::Audio {
            id: 7,
            start: 1.25,
            data: "AAAA".to_string(),
            sample_rate: 24_000,
            channels: 1,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"audio""#));

        match serde_json::from_str::<GatewayMessage>(&json).unwrap() {
            GatewayMessage::Audio {
                id,
                start,
                sample_rate,
                ..
            } => {
                assert_eq!(id, 7);
                assert_eq!(start, 1.25);
                assert_eq!(sample_rate, 24_000);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_capture_frames_validated_against_configured_size() {
        let frame: Vec<u8> = [0.5f32, -0.5, 0.25]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = decode_capture_frame(&frame, 4).unwrap();
        assert_eq!(samples, vec![0.5, -0.5, 0.25]);

        // Truncated, empty and oversized frames are all rejected.
        assert!(decode_capture_frame(&frame[..6], 4).is_err());
        assert!(decode_capture_frame(&[], 4).is_err());
        assert!(decode_capture_frame(&frame, 2).is_err());
    }

    #[test]
    fn test_widget_payload_interleaves_channels() {
        let frame = DecodedFrame {
            channels: vec![vec![0.5, -0.5], vec![0.25, -0.25]],
            sample_rate: 24_000,
            duration: 2.0 / 24_000.0,
        };

        let payload = encode_widget_payload(&frame);
        let bytes = B64.decode(payload).unwrap();
        let samples = codec::unpack_pcm16(&bytes).unwrap();

        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], 16384); // L0
        assert_eq!(samples[1], 8192); // R0
        assert!(samples[2] < 0); // L1
        assert!(samples[3] < 0); // R1
    }
}
