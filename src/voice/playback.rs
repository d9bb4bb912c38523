//! # Playback Scheduling
//!
//! Turns an ordered stream of decoded audio chunks into gapless, correctly
//! ordered output, and supports an immediate full stop when the remote end
//! interrupts itself.
//!
//! ## Scheduling model:
//! The scheduler keeps a single cursor: the render-clock timestamp at which
//! the next chunk should begin. Every `enqueue` schedules at
//! `max(cursor, now)` and advances the cursor by the chunk's duration, so
//! chunks that arrive faster than real time play back-to-back with no gap,
//! and chunks that arrive late never overlap what is already playing.
//!
//! ## Ownership:
//! The cursor and the set of still-playing sources belong exclusively to the
//! scheduler. The session controller only ever calls `enqueue` and `reset`.

use crate::voice::codec::DecodedFrame;
use std::collections::HashSet;
use std::time::Instant;

/// Monotone time reference of the audio output subsystem, in seconds.
///
/// Abstracted so tests can drive scheduling decisions with a fake clock.
pub trait RenderClock {
    fn now(&self) -> f64;
}

/// Wall-clock implementation backed by a monotonic `Instant`.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Identifies one scheduled playback source. Ids are never reused, so a
/// completion report for a source stopped long ago is harmlessly stale.
pub type SourceId = u64;

/// The output half of the render context: schedule a frame to start at a
/// given render-clock time, or force-stop a previously scheduled one.
///
/// `schedule` returns `None` when the render context is unavailable (e.g.
/// the widget went away mid-session); the scheduler then drops the audio
/// silently, which is acceptable for a best-effort presentation path.
/// `stop` on an already-ended source must be a no-op.
pub trait AudioOutput {
    fn schedule(&mut self, frame: DecodedFrame, start: f64) -> Option<SourceId>;
    fn stop(&mut self, id: SourceId);
}

/// Schedules decoded chunks back-to-back and tracks which are still playing.
pub struct PlaybackScheduler<K: RenderClock, O: AudioOutput> {
    clock: K,
    output: O,
    /// Render-clock time at which the next chunk should begin.
    next_start: f64,
    /// Sources scheduled by this session that have not yet reported ending.
    active: HashSet<SourceId>,
}

impl<K: RenderClock, O: AudioOutput> PlaybackScheduler<K, O> {
    pub fn new(clock: K, output: O) -> Self {
        Self {
            clock,
            output,
            next_start: 0.0,
            active: HashSet::new(),
        }
    }

    /// Schedule a decoded chunk for playback.
    ///
    /// ## Guarantees:
    /// - start time is `max(cursor, now)`: never in the past, never before
    ///   the end of the previously scheduled chunk
    /// - the cursor advances by the chunk's duration, so consecutive chunks
    ///   neither gap (when enqueued promptly) nor overlap (ever)
    ///
    /// Returns the scheduled start time, or `None` when the render context
    /// was unavailable and the chunk was dropped.
    pub fn enqueue(&mut self, frame: DecodedFrame) -> Option<f64> {
        let start = self.next_start.max(self.clock.now());
        let duration = frame.duration;

        let id = self.output.schedule(frame, start)?;
        self.next_start = start + duration;
        self.active.insert(id);
        Some(start)
    }

    /// A source finished playing naturally; forget its handle.
    pub fn handle_ended(&mut self, id: SourceId) {
        self.active.remove(&id);
    }

    /// Stop everything and forget all pending history.
    ///
    /// Every still-active source is force-stopped, the set is emptied, and
    /// the cursor returns to zero so the next `enqueue` schedules relative
    /// to the current render-clock time rather than stale history. Used on
    /// interruption signals and on full session teardown.
    pub fn reset(&mut self) {
        for id in self.active.drain() {
            self.output.stop(id);
        }
        self.next_start = 0.0;
    }

    /// Current cursor value (next scheduled start time).
    pub fn cursor(&self) -> f64 {
        self.next_start
    }

    /// Number of sources currently playing or scheduled.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Test clock whose current time is set explicitly by each test step.
    #[derive(Clone)]
    struct FakeClock(Rc<Cell<f64>>);

    impl FakeClock {
        fn at(t: f64) -> Self {
            Self(Rc::new(Cell::new(t)))
        }

        fn set(&self, t: f64) {
            self.0.set(t);
        }
    }

    impl RenderClock for FakeClock {
        fn now(&self) -> f64 {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct Recorded {
        next_id: SourceId,
        scheduled: Vec<(SourceId, f64, f64)>, // (id, start, duration)
        stopped: Vec<SourceId>,
        unavailable: bool,
    }

    /// Records every schedule/stop call for assertion.
    #[derive(Clone, Default)]
    struct RecordingOutput(Rc<RefCell<Recorded>>);

    impl AudioOutput for RecordingOutput {
        fn schedule(&mut self, frame: DecodedFrame, start: f64) -> Option<SourceId> {
            let mut rec = self.0.borrow_mut();
            if rec.unavailable {
                return None;
            }
            let id = rec.next_id;
            rec.next_id += 1;
            rec.scheduled.push((id, start, frame.duration));
            Some(id)
        }

        fn stop(&mut self, id: SourceId) {
            self.0.borrow_mut().stopped.push(id);
        }
    }

    fn frame(duration: f64) -> DecodedFrame {
        let samples = (duration * 24_000.0).round() as usize;
        DecodedFrame {
            channels: vec![vec![0.0; samples]],
            sample_rate: 24_000,
            duration,
        }
    }

    #[test]
    fn test_back_to_back_chunks_never_overlap() {
        let clock = FakeClock::at(0.0);
        let out = RecordingOutput::default();
        let mut sched = PlaybackScheduler::new(clock.clone(), out.clone());

        // Enqueue faster than real time with jittery durations.
        let mut t = 0.0;
        for d in [0.3, 0.12, 0.5, 0.08, 1.0] {
            sched.enqueue(frame(d));
            t += 0.01;
            clock.set(t);
        }

        let rec = out.0.borrow();
        for pair in rec.scheduled.windows(2) {
            let (_, start_a, dur_a) = pair[0];
            let (_, start_b, _) = pair[1];
            assert!(start_b >= start_a + dur_a - 1e-9);
        }
    }

    #[test]
    fn test_prompt_chunks_play_gapless() {
        let clock = FakeClock::at(0.0);
        let out = RecordingOutput::default();
        let mut sched = PlaybackScheduler::new(clock.clone(), out.clone());

        sched.enqueue(frame(1.0));
        clock.set(0.2);
        sched.enqueue(frame(0.5));
        clock.set(0.4);
        sched.enqueue(frame(0.25));

        // Each start is exactly the previous end: no artificial gap.
        let rec = out.0.borrow();
        assert_eq!(rec.scheduled[0].1, 0.0);
        assert_eq!(rec.scheduled[1].1, 1.0);
        assert_eq!(rec.scheduled[2].1, 1.5);
    }

    #[test]
    fn test_late_chunk_schedules_at_current_time() {
        let clock = FakeClock::at(0.0);
        let mut sched = PlaybackScheduler::new(clock.clone(), RecordingOutput::default());

        sched.enqueue(frame(1.0));
        // Playback drained long ago; the next chunk must not be scheduled
        // retroactively.
        clock.set(5.0);
        assert_eq!(sched.enqueue(frame(0.5)), Some(5.0));
        assert_eq!(sched.cursor(), 5.5);
    }

    #[test]
    fn test_partially_played_chunk_pushes_next_start_out() {
        // enqueue(bufA, 1.0s) at t=0.0 -> start 0.0;
        // enqueue(bufB, 0.5s) at t=0.3 -> start must be 1.0 (not 0.3, not 0.8).
        let clock = FakeClock::at(0.0);
        let mut sched = PlaybackScheduler::new(clock.clone(), RecordingOutput::default());

        assert_eq!(sched.enqueue(frame(1.0)), Some(0.0));
        clock.set(0.3);
        assert_eq!(sched.enqueue(frame(0.5)), Some(1.0));
    }

    #[test]
    fn test_reset_clears_sources_and_cursor() {
        let clock = FakeClock::at(0.0);
        let out = RecordingOutput::default();
        let mut sched = PlaybackScheduler::new(clock.clone(), out.clone());

        sched.enqueue(frame(1.0));
        clock.set(0.3);
        sched.enqueue(frame(0.5));
        assert_eq!(sched.active_count(), 2);

        sched.reset();
        assert_eq!(sched.active_count(), 0);
        assert_eq!(out.0.borrow().stopped.len(), 2);
        assert_eq!(sched.cursor(), 0.0);

        // After the reset the next chunk schedules relative to "now", not to
        // the pre-reset cursor.
        clock.set(2.0);
        assert_eq!(sched.enqueue(frame(1.0)), Some(2.0));
    }

    #[test]
    fn test_natural_end_removes_from_active_set() {
        let clock = FakeClock::at(0.0);
        let out = RecordingOutput::default();
        let mut sched = PlaybackScheduler::new(clock, out.clone());

        sched.enqueue(frame(1.0));
        let id = out.0.borrow().scheduled[0].0;
        sched.handle_ended(id);
        assert_eq!(sched.active_count(), 0);

        // A stale completion report for the same id changes nothing.
        sched.handle_ended(id);
        assert_eq!(sched.active_count(), 0);

        // Reset afterwards must not try to stop the already-ended source.
        sched.reset();
        assert!(out.0.borrow().stopped.is_empty());
    }

    #[test]
    fn test_unavailable_output_drops_audio_without_advancing() {
        let out = RecordingOutput::default();
        out.0.borrow_mut().unavailable = true;
        let mut sched = PlaybackScheduler::new(FakeClock::at(0.0), out);

        assert_eq!(sched.enqueue(frame(1.0)), None);
        assert_eq!(sched.cursor(), 0.0);
        assert_eq!(sched.active_count(), 0);
    }
}
