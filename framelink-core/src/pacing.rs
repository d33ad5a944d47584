//! Fixed-rate frame schedule.
//!
//! Frame `i` is due at `(i + 1) / fps` seconds after the session began.
//! Deadlines are computed from the start time rather than from the
//! previous frame, so a late frame does not push every later deadline
//! back.

use std::time::Duration;

use crate::error::FramelinkError;

/// Lowest accepted frame rate: one frame every 1000 seconds.
pub const MIN_FPS: f64 = 1e-3;

/// Reject rates that are not finite or below [`MIN_FPS`].
pub fn check_fps(fps: f64) -> Result<(), FramelinkError> {
    if fps.is_finite() && fps >= MIN_FPS {
        Ok(())
    } else {
        Err(FramelinkError::Config(format!(
            "fps must be a finite number of at least {MIN_FPS}, got {fps}"
        )))
    }
}

/// Deadline schedule and late-frame counter for a pacing loop.
#[derive(Debug, Clone)]
pub struct Pacer {
    fps: f64,
    /// Slack under which a deadline counts as reached (1% of a period).
    fudge: Duration,
    late_count: u64,
}

impl Pacer {
    pub fn new(fps: f64) -> Result<Self, FramelinkError> {
        check_fps(fps)?;
        Ok(Self {
            fps,
            fudge: Duration::from_secs_f64(1.0 / fps / 100.0),
            late_count: 0,
        })
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }

    /// Deadline of `frame`, measured from the session start. Saturates
    /// at `Duration::MAX`.
    pub fn deadline(&self, frame: u64) -> Duration {
        Duration::try_from_secs_f64(frame.saturating_add(1) as f64 / self.fps)
            .unwrap_or(Duration::MAX)
    }

    /// Time left before `frame` is due, or `None` once it is due.
    pub fn remaining(&self, frame: u64, elapsed: Duration) -> Option<Duration> {
        let deadline = self.deadline(frame);
        if elapsed + self.fudge >= deadline {
            None
        } else {
            Some(deadline - elapsed)
        }
    }

    /// Close out `frame`.
    ///
    /// `waited` says whether the loop got to wait at all before the
    /// deadline; a frame whose work ran past its deadline is late.
    /// Returns `true` and bumps the late counter in that case.
    pub fn finish_frame(&mut self, frame: u64, elapsed: Duration, waited: bool) -> bool {
        let late = !waited && self.remaining(frame, elapsed).is_none();
        if late {
            self.late_count += 1;
        }
        late
    }

    pub fn late_count(&self) -> u64 {
        self.late_count
    }
}
