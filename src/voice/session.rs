//! # Voice Session Lifecycle
//!
//! Owns the full lifecycle of a single voice session and its two
//! unidirectional flows: microphone capture frames out to the live endpoint,
//! synthesized audio chunks back in to the playback scheduler.
//!
//! ## State machine:
//! ```text
//! INACTIVE --start()--> CONNECTING --Opened--> ACTIVE
//! CONNECTING --Error/Closed--> INACTIVE
//! ACTIVE --Error/Closed/stop()--> INACTIVE
//! ACTIVE --Interrupted--> ACTIVE   (playback flushed, capture continues)
//! ```
//!
//! There is no paused state: toggling voice off always fully tears down.
//! All upstream callbacks arrive through one `dispatch` entry point, tagged
//! with the session epoch they belong to, so a callback that was already in
//! flight when the session was replaced can never corrupt its successor.

use crate::voice::codec;
use crate::voice::playback::{AudioOutput, PlaybackScheduler, RenderClock, SourceId};
use crate::voice::AudioFormat;
use tracing::{debug, info, warn};

/// Lifecycle state of the (at most one) voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; both the initial and the terminal-per-session state.
    Inactive,
    /// Connection requested, open confirmation not yet received.
    Connecting,
    /// Audio is flowing in both directions.
    Active,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Inactive => "inactive",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
        }
    }
}

/// Everything the live endpoint can tell us, normalized to one enum so the
/// legal transitions live in a single match instead of nested callbacks.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The remote session confirmed setup; audio may flow.
    Opened,
    /// One transport-encoded audio chunk of the model's reply.
    Media(String),
    /// The model cut itself off (the user started speaking); discard all
    /// queued playback immediately.
    Interrupted,
    /// Transport or protocol failure; tears the session down.
    Error(String),
    /// The remote side closed the session.
    Closed,
}

/// One captured microphone frame, transport-encoded and tagged with its mime
/// descriptor (e.g. `audio/pcm;rate=16000`).
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub payload: String,
    pub mime: String,
}

/// Why a realtime send did not go through.
#[derive(Debug)]
pub enum SendError {
    /// The single-frame handoff slot is occupied; the frame comes back to
    /// the caller so the drop-oldest policy can decide its fate.
    Busy(OutboundFrame),
    /// The connection is gone; a `Closed` event will follow shortly.
    Closed,
}

/// The remote streaming session, as the controller sees it.
///
/// `send_media` must not block: it either hands the frame to the transport
/// or reports `Busy` immediately. `close` is infallible and idempotent —
/// closing an already-closed connection is never an error.
pub trait LiveConnection {
    fn send_media(&mut self, frame: OutboundFrame) -> Result<(), SendError>;
    fn close(&mut self);
}

/// Owns one voice session end to end: connection handle, capture handoff,
/// and playback scheduling. Constructed once per widget and reused across
/// sessions; all per-session state is reset by `stop`.
pub struct SessionController<C: LiveConnection, K: RenderClock, O: AudioOutput> {
    state: SessionState,
    /// Bumped on every `start`; events carrying an older epoch are stale.
    epoch: u64,
    conn: Option<C>,
    scheduler: PlaybackScheduler<K, O>,
    format: AudioFormat,
    /// At most one captured frame held back under transmit backpressure.
    pending: Option<OutboundFrame>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl<C: LiveConnection, K: RenderClock, O: AudioOutput> SessionController<C, K, O> {
    pub fn new(format: AudioFormat, scheduler: PlaybackScheduler<K, O>) -> Self {
        Self {
            state: SessionState::Inactive,
            epoch: 0,
            conn: None,
            scheduler,
            format,
            pending: None,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Epoch of the current session; events must echo it back.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Captured frames handed to the transport this controller's lifetime.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Captured frames dropped under transmit backpressure.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Playback chunks currently scheduled or playing.
    pub fn playing_sources(&self) -> usize {
        self.scheduler.active_count()
    }

    /// Begin a new session.
    ///
    /// Any session still in a non-terminal state is fully stopped first —
    /// two live sessions must never overlap. Returns the new session epoch;
    /// the caller attaches the connection (once established) and every
    /// upstream event under that epoch.
    pub fn start(&mut self) -> u64 {
        if self.state != SessionState::Inactive {
            self.stop();
        }
        self.epoch += 1;
        self.state = SessionState::Connecting;
        debug!(epoch = self.epoch, "voice session connecting");
        self.epoch
    }

    /// The connection handle for `epoch` is established.
    ///
    /// If the session was stopped or replaced while the connect was in
    /// flight, the late handle is closed on the spot and discarded. The
    /// state may already be `Active` here: the remote open confirmation
    /// travels on the event path and can overtake the handle delivery, so
    /// the handle is accepted in any non-terminal state of its own epoch.
    pub fn connected(&mut self, epoch: u64, mut conn: C) {
        if epoch != self.epoch || self.state == SessionState::Inactive {
            debug!(epoch, "discarding stale connection handle");
            conn.close();
            return;
        }
        self.conn = Some(conn);
    }

    /// The connect attempt for `epoch` failed before a handle existed.
    pub fn connect_failed(&mut self, epoch: u64, reason: &str) {
        if epoch != self.epoch || self.state == SessionState::Inactive {
            return;
        }
        warn!(epoch, %reason, "voice session connect failed");
        self.stop();
    }

    /// Single entry point for all upstream callbacks (open, message, error,
    /// close). Events from a superseded session are ignored wholesale.
    pub fn dispatch(&mut self, epoch: u64, event: SessionEvent) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "ignoring stale session event");
            return;
        }

        match event {
            SessionEvent::Opened => {
                if self.state == SessionState::Connecting {
                    self.state = SessionState::Active;
                    info!(epoch, "voice session active");
                }
            }
            SessionEvent::Media(payload) => {
                if self.state != SessionState::Active {
                    return;
                }
                match codec::decode_playback_payload(
                    &payload,
                    self.format.playback_rate,
                    self.format.channels,
                ) {
                    // A decode racing a reset still lands here and schedules
                    // against the post-reset cursor, i.e. relative to "now".
                    Ok(frame) => {
                        self.scheduler.enqueue(frame);
                    }
                    Err(err) => {
                        // Malformed chunk: drop the frame, keep the session.
                        debug!(%err, "dropping undecodable audio chunk");
                    }
                }
            }
            SessionEvent::Interrupted => {
                if self.state == SessionState::Active {
                    debug!(epoch, "interrupted; flushing queued playback");
                    self.scheduler.reset();
                    // Capture and transmit continue; only playback is cut.
                }
            }
            SessionEvent::Error(msg) => {
                warn!(epoch, error = %msg, "voice session error");
                self.stop();
            }
            SessionEvent::Closed => {
                self.stop();
            }
        }
    }

    /// Feed one captured microphone frame (normalized f32 samples).
    ///
    /// ## Backpressure policy:
    /// At most one frame is held back waiting for the transport. When a new
    /// frame arrives and the held one still cannot be sent, the held (older)
    /// frame is dropped — memory stays bounded and the freshest audio wins.
    /// Frames always leave in capture order.
    pub fn push_capture_frame(&mut self, samples: &[f32]) {
        if self.state != SessionState::Active {
            return;
        }
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        let frame = OutboundFrame {
            payload: codec::encode_capture_frame(samples),
            mime: self.format.capture_mime(),
        };

        // Flush the held-back frame first to preserve capture order.
        if let Some(prev) = self.pending.take() {
            match conn.send_media(prev) {
                Ok(()) => self.frames_sent += 1,
                Err(SendError::Busy(_)) | Err(SendError::Closed) => {
                    // Oldest unsent frame loses.
                    self.frames_dropped += 1;
                }
            }
        }

        match conn.send_media(frame) {
            Ok(()) => self.frames_sent += 1,
            Err(SendError::Busy(frame)) => {
                self.pending = Some(frame);
            }
            Err(SendError::Closed) => {
                self.frames_dropped += 1;
            }
        }
    }

    /// Tear the session down completely. Safe to call from any state, any
    /// number of times, including mid-connect; the second call is a no-op.
    pub fn stop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            // Close failures are swallowed by the LiveConnection contract.
            conn.close();
        }
        let was_live = self.state != SessionState::Inactive;
        self.state = SessionState::Inactive;
        self.pending = None;
        self.scheduler.reset();
        if was_live {
            info!(epoch = self.epoch, "voice session stopped");
        }
    }

    /// A scheduled playback source finished naturally.
    pub fn handle_source_ended(&mut self, id: SourceId) {
        self.scheduler.handle_ended(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::playback::RenderClock;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    struct FixedClock(Rc<Cell<f64>>);

    impl RenderClock for FixedClock {
        fn now(&self) -> f64 {
            self.0.get()
        }
    }

    #[derive(Clone, Default)]
    struct NullOutput {
        scheduled: Rc<RefCell<Vec<f64>>>,
        next_id: Rc<Cell<SourceId>>,
    }

    impl AudioOutput for NullOutput {
        fn schedule(
            &mut self,
            _frame: crate::voice::codec::DecodedFrame,
            start: f64,
        ) -> Option<SourceId> {
            self.scheduled.borrow_mut().push(start);
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            Some(id)
        }

        fn stop(&mut self, _id: SourceId) {}
    }

    #[derive(Default)]
    struct ConnLog {
        sent: Vec<String>,
        busy: bool,
        closes: u32,
    }

    #[derive(Clone, Default)]
    struct MockConn(Rc<RefCell<ConnLog>>);

    impl LiveConnection for MockConn {
        fn send_media(&mut self, frame: OutboundFrame) -> Result<(), SendError> {
            let mut log = self.0.borrow_mut();
            if log.busy {
                return Err(SendError::Busy(frame));
            }
            log.sent.push(frame.payload);
            Ok(())
        }

        fn close(&mut self) {
            self.0.borrow_mut().closes += 1;
        }
    }

    fn controller(
        clock: Rc<Cell<f64>>,
    ) -> (SessionController<MockConn, FixedClock, NullOutput>, NullOutput) {
        let output = NullOutput::default();
        let scheduler = PlaybackScheduler::new(FixedClock(clock), output.clone());
        (
            SessionController::new(AudioFormat::default(), scheduler),
            output,
        )
    }

    fn pcm_payload(samples: &[i16]) -> String {
        B64.encode(crate::voice::codec::pack_pcm16(samples))
    }

    #[test]
    fn test_stop_is_idempotent_and_safe_without_start() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));

        // Never started: stop must be a harmless no-op.
        ctl.stop();
        assert_eq!(ctl.state(), SessionState::Inactive);

        let epoch = ctl.start();
        ctl.connected(epoch, MockConn::default());
        ctl.dispatch(epoch, SessionEvent::Opened);
        assert!(ctl.is_active());

        ctl.stop();
        ctl.stop();
        assert_eq!(ctl.state(), SessionState::Inactive);
        assert_eq!(ctl.playing_sources(), 0);
    }

    #[test]
    fn test_error_after_open_tears_down_completely() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let conn = MockConn::default();

        let epoch = ctl.start();
        ctl.connected(epoch, conn.clone());
        ctl.dispatch(epoch, SessionEvent::Opened);
        ctl.dispatch(epoch, SessionEvent::Media(pcm_payload(&[100; 240])));
        assert_eq!(ctl.playing_sources(), 1);

        ctl.dispatch(epoch, SessionEvent::Error("upstream fault".into()));
        assert_eq!(ctl.state(), SessionState::Inactive);
        assert_eq!(ctl.playing_sources(), 0);
        assert_eq!(conn.0.borrow().closes, 1);

        // No capture frames may be transmitted after the error.
        ctl.push_capture_frame(&[0.1; 64]);
        assert!(conn.0.borrow().sent.is_empty());
    }

    #[test]
    fn test_close_while_connecting_returns_to_inactive() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let epoch = ctl.start();
        assert_eq!(ctl.state(), SessionState::Connecting);

        ctl.dispatch(epoch, SessionEvent::Closed);
        assert_eq!(ctl.state(), SessionState::Inactive);
    }

    #[test]
    fn test_connect_failure_surfaces_as_inactive() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let epoch = ctl.start();
        ctl.connect_failed(epoch, "dns exploded");
        assert_eq!(ctl.state(), SessionState::Inactive);
    }

    #[test]
    fn test_interrupt_flushes_playback_but_keeps_session() {
        let clock = Rc::new(Cell::new(0.0));
        let (mut ctl, _) = controller(clock.clone());
        let conn = MockConn::default();

        let epoch = ctl.start();
        ctl.connected(epoch, conn.clone());
        ctl.dispatch(epoch, SessionEvent::Opened);
        ctl.dispatch(epoch, SessionEvent::Media(pcm_payload(&[5; 24_000])));
        assert_eq!(ctl.playing_sources(), 1);

        ctl.dispatch(epoch, SessionEvent::Interrupted);
        assert!(ctl.is_active());
        assert_eq!(ctl.playing_sources(), 0);

        // Capture keeps flowing after the interruption.
        ctl.push_capture_frame(&[0.2; 64]);
        assert_eq!(conn.0.borrow().sent.len(), 1);
    }

    #[test]
    fn test_late_chunk_after_interrupt_schedules_against_fresh_cursor() {
        let clock = Rc::new(Cell::new(0.0));
        let (mut ctl, output) = controller(clock.clone());

        let epoch = ctl.start();
        ctl.connected(epoch, MockConn::default());
        ctl.dispatch(epoch, SessionEvent::Opened);

        // One second of audio queued, then the model interrupts itself.
        ctl.dispatch(epoch, SessionEvent::Media(pcm_payload(&[5; 24_000])));
        ctl.dispatch(epoch, SessionEvent::Interrupted);

        // A chunk whose decode was already in flight lands afterwards at
        // t=2.0; it must schedule at 2.0, not after the stale 1.0 cursor.
        clock.set(2.0);
        ctl.dispatch(epoch, SessionEvent::Media(pcm_payload(&[7; 2_400])));
        assert_eq!(*output.scheduled.borrow().last().unwrap(), 2.0);
    }

    #[test]
    fn test_malformed_media_is_dropped_not_fatal() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let epoch = ctl.start();
        ctl.connected(epoch, MockConn::default());
        ctl.dispatch(epoch, SessionEvent::Opened);

        ctl.dispatch(epoch, SessionEvent::Media("@@garbage@@".into()));
        assert!(ctl.is_active());
        assert_eq!(ctl.playing_sources(), 0);
    }

    #[test]
    fn test_stale_events_cannot_touch_a_replacement_session() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));

        let first = ctl.start();
        ctl.connected(first, MockConn::default());
        ctl.dispatch(first, SessionEvent::Opened);
        ctl.stop();

        let second = ctl.start();
        assert_ne!(first, second);

        // Events from the dead session arrive after the restart.
        ctl.dispatch(first, SessionEvent::Opened);
        assert_eq!(ctl.state(), SessionState::Connecting);
        ctl.dispatch(first, SessionEvent::Error("old ghost".into()));
        assert_eq!(ctl.state(), SessionState::Connecting);
    }

    #[test]
    fn test_stale_connection_handle_is_closed_on_arrival() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let slow_conn = MockConn::default();

        let first = ctl.start();
        ctl.stop();
        ctl.start();

        ctl.connected(first, slow_conn.clone());
        assert_eq!(slow_conn.0.borrow().closes, 1);
        ctl.dispatch(ctl.epoch(), SessionEvent::Opened);
        // The stale handle never became the session's connection.
        ctl.push_capture_frame(&[0.5; 16]);
        assert!(slow_conn.0.borrow().sent.is_empty());
    }

    #[test]
    fn test_open_confirmation_may_overtake_connection_handle() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let conn = MockConn::default();

        // The open confirmation rides the event channel and can land before
        // the handle delivery; the handle must still be accepted.
        let epoch = ctl.start();
        ctl.dispatch(epoch, SessionEvent::Opened);
        assert!(ctl.is_active());
        ctl.connected(epoch, conn.clone());

        assert_eq!(conn.0.borrow().closes, 0);
        ctl.push_capture_frame(&[0.3; 16]);
        assert_eq!(conn.0.borrow().sent.len(), 1);
        assert_eq!(ctl.frames_sent(), 1);
    }

    #[test]
    fn test_restart_closes_previous_session_first() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let conn = MockConn::default();

        let first = ctl.start();
        ctl.connected(first, conn.clone());
        ctl.dispatch(first, SessionEvent::Opened);

        let second = ctl.start();
        assert_eq!(conn.0.borrow().closes, 1);
        assert_eq!(ctl.state(), SessionState::Connecting);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_backpressure_drops_oldest_keeps_order() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let conn = MockConn::default();

        let epoch = ctl.start();
        ctl.connected(epoch, conn.clone());
        ctl.dispatch(epoch, SessionEvent::Opened);

        conn.0.borrow_mut().busy = true;
        ctl.push_capture_frame(&[0.1; 8]); // held back
        ctl.push_capture_frame(&[0.2; 8]); // frame 1 dropped, frame 2 held
        assert_eq!(ctl.frames_dropped(), 1);
        assert!(conn.0.borrow().sent.is_empty());

        conn.0.borrow_mut().busy = false;
        ctl.push_capture_frame(&[0.3; 8]); // flushes 2, then sends 3

        let log = conn.0.borrow();
        assert_eq!(log.sent.len(), 2);
        assert_eq!(log.sent[0], codec::encode_capture_frame(&[0.2; 8]));
        assert_eq!(log.sent[1], codec::encode_capture_frame(&[0.3; 8]));
    }

    #[test]
    fn test_media_before_open_is_ignored() {
        let (mut ctl, _) = controller(Rc::new(Cell::new(0.0)));
        let epoch = ctl.start();
        ctl.connected(epoch, MockConn::default());

        ctl.dispatch(epoch, SessionEvent::Media(pcm_payload(&[1; 240])));
        assert_eq!(ctl.playing_sources(), 0);
        assert_eq!(ctl.state(), SessionState::Connecting);
    }
}
