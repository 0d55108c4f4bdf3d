//! Late-join playback sync
//!
//! The host answers a sync request with a snapshot of its playback clock; a
//! viewer applies the first valid snapshot it receives.

use parking_lot::Mutex;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::SyncSnapshot;

/// Playback position source (host) and sink (viewer)
pub trait PlaybackClock: Send + Sync {
    fn snapshot(&self) -> SyncSnapshot;

    fn apply(&self, snapshot: &SyncSnapshot);
}

/// Reject snapshots no clock can represent
pub fn validate_snapshot(snapshot: &SyncSnapshot) -> Result<()> {
    if !snapshot.current_time.is_finite() || snapshot.current_time < 0.0 {
        return Err(Error::InvalidPayload(format!(
            "currentTime must be a non-negative number, got {}",
            snapshot.current_time
        )));
    }
    if !snapshot.loop_duration.is_finite() || snapshot.loop_duration < 0.0 {
        return Err(Error::InvalidPayload(format!(
            "loopDuration must be a non-negative number, got {}",
            snapshot.loop_duration
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct ClockState {
    /// Position at `anchored_at`, in seconds
    position: f64,
    anchored_at: Instant,
    loop_duration: f64,
    playing: bool,
}

impl ClockState {
    fn position_at(&self, now: Instant) -> f64 {
        let mut position = self.position;
        if self.playing {
            position += now.saturating_duration_since(self.anchored_at).as_secs_f64();
        }
        wrap(position, self.loop_duration)
    }

    fn reanchor(&mut self, now: Instant) {
        self.position = self.position_at(now);
        self.anchored_at = now;
    }
}

fn wrap(position: f64, loop_duration: f64) -> f64 {
    if loop_duration > 0.0 {
        position.rem_euclid(loop_duration)
    } else {
        position.max(0.0)
    }
}

/// Wall-clock driven position inside a repeating loop
#[derive(Debug)]
pub struct LoopClock {
    state: Mutex<ClockState>,
}

impl LoopClock {
    #[must_use]
    pub fn new(loop_duration: f64) -> Self {
        Self {
            state: Mutex::new(ClockState {
                position: 0.0,
                anchored_at: Instant::now(),
                loop_duration: loop_duration.max(0.0),
                playing: false,
            }),
        }
    }

    pub fn play(&self) {
        let mut state = self.state.lock();
        state.reanchor(Instant::now());
        state.playing = true;
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.reanchor(Instant::now());
        state.playing = false;
    }

    pub fn seek(&self, position: f64) {
        let mut state = self.state.lock();
        state.position = wrap(position, state.loop_duration);
        state.anchored_at = Instant::now();
    }

    pub fn set_loop_duration(&self, loop_duration: f64) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.reanchor(now);
        state.loop_duration = loop_duration.max(0.0);
        state.position = wrap(state.position, state.loop_duration);
    }

    #[must_use]
    pub fn position(&self) -> f64 {
        self.state.lock().position_at(Instant::now())
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    #[must_use]
    pub fn loop_duration(&self) -> f64 {
        self.state.lock().loop_duration
    }
}

impl Default for LoopClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl PlaybackClock for LoopClock {
    fn snapshot(&self) -> SyncSnapshot {
        let state = self.state.lock();
        SyncSnapshot {
            current_time: state.position_at(Instant::now()),
            loop_duration: state.loop_duration,
            is_playing: state.playing,
        }
    }

    fn apply(&self, snapshot: &SyncSnapshot) {
        let mut state = self.state.lock();
        state.loop_duration = snapshot.loop_duration.max(0.0);
        state.position = wrap(snapshot.current_time, state.loop_duration);
        state.anchored_at = Instant::now();
        state.playing = snapshot.is_playing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_paused_clock_holds_position() {
        let clock = LoopClock::new(8.0);
        clock.seek(3.5);
        std::thread::sleep(Duration::from_millis(10));
        let snapshot = clock.snapshot();
        assert_eq!(snapshot.current_time, 3.5);
        assert_eq!(snapshot.loop_duration, 8.0);
        assert!(!snapshot.is_playing);
    }

    #[test]
    fn test_seek_wraps_inside_loop() {
        let clock = LoopClock::new(4.0);
        clock.seek(9.0);
        assert_eq!(clock.position(), 1.0);
        clock.seek(-1.0);
        assert_eq!(clock.position(), 3.0);
    }

    #[test]
    fn test_playing_clock_advances() {
        let clock = LoopClock::new(60.0);
        clock.play();
        std::thread::sleep(Duration::from_millis(30));
        assert!(clock.position() > 0.0);

        clock.pause();
        let paused_at = clock.position();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.position(), paused_at);
    }

    #[test]
    fn test_apply_adopts_snapshot() {
        let clock = LoopClock::default();
        clock.apply(&SyncSnapshot {
            current_time: 2.0,
            loop_duration: 16.0,
            is_playing: false,
        });
        assert_eq!(clock.position(), 2.0);
        assert_eq!(clock.loop_duration(), 16.0);
        assert!(!clock.is_playing());
    }

    #[test]
    fn test_snapshot_validation() {
        let valid = SyncSnapshot {
            current_time: 1.0,
            loop_duration: 4.0,
            is_playing: true,
        };
        assert!(validate_snapshot(&valid).is_ok());
        assert!(validate_snapshot(&SyncSnapshot { current_time: f64::NAN, ..valid }).is_err());
        assert!(validate_snapshot(&SyncSnapshot { loop_duration: -1.0, ..valid }).is_err());
    }
}
