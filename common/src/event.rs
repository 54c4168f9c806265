//! Door event state machine.
//!
//! Decides which `[start, stop]` window makes up one door event.  The
//! machine is a plain reducer: feed it an [`Input`] together with the
//! current time and it returns the [`Effect`]s the caller must carry out.
//! It never sleeps and never touches the clock, so the whole transition
//! table can be exercised without a runtime.
//!
//! ```text
//!            OPEN                       CLOSED
//!   Idle ───────────► Capturing ───────────────────► Closing
//!                      ▲   │  still-open timeout        │
//!                      │   └───────────────────────────►│
//!                      │              OPEN              │
//!                      └────────────────────────────────┤
//!   Idle ◄──────────────────── finalize ────────────────┘
//! ```
//!
//! At most one timer is live at a time.  Every timer is identified by a
//! [`TimerToken`] carrying a monotonically increasing epoch; arming a new
//! timer or finishing a cycle bumps the epoch, so a token that fires late
//! is recognised as stale and ignored.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Timings;
use crate::signal::DoorSignal;

/// The resolved time interval of one door event, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureWindow {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl CaptureWindow {
    pub fn duration(&self) -> TimeDelta {
        self.stop - self.start
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The door has been open for too long.
    StillOpen,
    /// The trailing grace period is over; hand the window to the pipeline.
    Finalize,
}

/// Identity of one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    epoch: u64,
    kind: TimerKind,
}

impl TimerToken {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }
}

/// Everything the machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Door(DoorSignal),
    Timer(TimerToken),
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Schedule `token` to be fed back after `after`.  Replaces (and
    /// invalidates) any previously armed timer.
    Arm { token: TimerToken, after: Duration },
    /// Drop the pending timer, if any.
    Disarm,
    /// A cycle completed; run the capture pipeline for this window.
    Capture(CaptureWindow),
}

/// Coarse view of where the current cycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Capturing,
    Closing,
}

/// The current event record plus the single live timer.
#[derive(Debug)]
pub struct EventMachine {
    timings: Timings,
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
    epoch: u64,
    armed: Option<TimerToken>,
}

impl EventMachine {
    pub fn new(timings: Timings) -> Self {
        Self {
            timings,
            start: None,
            stop: None,
            epoch: 0,
            armed: None,
        }
    }

    pub fn phase(&self) -> Phase {
        match (self.start, self.stop) {
            (None, _) => Phase::Idle,
            (Some(_), None) => Phase::Capturing,
            (Some(_), Some(_)) => Phase::Closing,
        }
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn stop(&self) -> Option<DateTime<Utc>> {
        self.stop
    }

    /// The only timer whose firing will be honoured.
    pub fn armed(&self) -> Option<TimerToken> {
        self.armed
    }

    /// Apply one input observed at `now`.
    pub fn handle(&mut self, input: Input, now: DateTime<Utc>) -> Vec<Effect> {
        match input {
            Input::Door(DoorSignal::Opened) => self.door_opened(now),
            Input::Door(DoorSignal::Closed) => self.door_closed(now),
            Input::Timer(token) => {
                if self.armed != Some(token) {
                    debug!(
                        "Ignoring stale {:?} timer (epoch {}, current {})",
                        token.kind, token.epoch, self.epoch
                    );
                    return Vec::new();
                }
                self.armed = None;
                match token.kind {
                    TimerKind::StillOpen => self.still_open(now),
                    TimerKind::Finalize => self.finalize(),
                }
            }
        }
    }

    fn door_opened(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        info!("Door opened");
        if self.start.is_none() {
            info!("Starting fresh event");
            self.start = Some(now - delta(self.timings.pre));
        } else {
            info!("Continuing previous capture");
        }
        if self.stop.take().is_some() {
            info!("Continuing previously finished capture");
        }
        vec![self.arm(TimerKind::StillOpen, self.timings.open)]
    }

    fn door_closed(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if self.start.is_none() {
            debug!("Door closed with no capture in progress");
            return Vec::new();
        }
        info!("Door closed");
        self.stop = Some(now + delta(self.timings.post));
        vec![self.arm(TimerKind::Finalize, self.timings.post + self.timings.delay)]
    }

    fn still_open(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if self.start.is_none() {
            warn!("Open door timer fired without a capture in progress");
            return Vec::new();
        }
        info!("Door is open for a long time");
        self.stop = Some(now);
        vec![self.arm(TimerKind::Finalize, self.timings.delay)]
    }

    fn finalize(&mut self) -> Vec<Effect> {
        let window = match (self.start, self.stop) {
            (Some(start), Some(stop)) => CaptureWindow { start, stop },
            _ => {
                warn!("Finalize timer fired without a complete capture window");
                return Vec::new();
            }
        };
        info!("Saving capture {} → {}", window.start, window.stop);
        self.start = None;
        self.stop = None;
        self.epoch += 1;
        vec![Effect::Disarm, Effect::Capture(window)]
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) -> Effect {
        self.epoch += 1;
        let token = TimerToken {
            epoch: self.epoch,
            kind,
        };
        self.armed = Some(token);
        Effect::Arm { token, after }
    }
}

/// Timings are bounded at config load, so the conversion cannot overflow.
fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, 30, 6, 20, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + TimeDelta::seconds(secs)
    }

    fn machine() -> EventMachine {
        EventMachine::new(Timings::default())
    }

    /// Pull the single armed token out of a transition's effects.
    fn armed(effects: &[Effect]) -> (TimerToken, Duration) {
        match effects {
            [Effect::Arm { token, after }] => (*token, *after),
            other => panic!("expected a single Arm effect, got {other:?}"),
        }
    }

    fn captured(effects: &[Effect]) -> Option<CaptureWindow> {
        effects.iter().find_map(|e| match e {
            Effect::Capture(w) => Some(*w),
            _ => None,
        })
    }

    #[test]
    fn test_door_closed_while_idle_is_noop() {
        let mut m = machine();
        assert!(m.handle(Input::Door(DoorSignal::Closed), at(0)).is_empty());
        assert_eq!(m.phase(), Phase::Idle);
        assert!(m.armed().is_none());
    }

    #[test]
    fn test_open_then_close_literal_scenario() {
        let mut m = machine();

        let (open_timer, after) = armed(&m.handle(Input::Door(DoorSignal::Opened), at(0)));
        assert_eq!(open_timer.kind(), TimerKind::StillOpen);
        assert_eq!(after, Duration::from_secs(30));
        assert_eq!(m.start(), Some(at(-10)));
        assert_eq!(m.phase(), Phase::Capturing);

        let (finalize, after) = armed(&m.handle(Input::Door(DoorSignal::Closed), at(5)));
        assert_eq!(finalize.kind(), TimerKind::Finalize);
        assert_eq!(after, Duration::from_secs(12));
        assert_eq!(m.stop(), Some(at(15)));
        assert_eq!(m.phase(), Phase::Closing);

        // The open timer was superseded by the close.
        assert!(m.handle(Input::Timer(open_timer), at(30)).is_empty());

        let effects = m.handle(Input::Timer(finalize), at(17));
        let window = captured(&effects).unwrap();
        assert_eq!(window, CaptureWindow { start: at(-10), stop: at(15) });
        assert_eq!(window.duration(), TimeDelta::seconds(25));
        assert!(effects.contains(&Effect::Disarm));
        assert_eq!(m.phase(), Phase::Idle);
        assert!(m.armed().is_none());
    }

    #[test]
    fn test_forced_close_when_door_stays_open() {
        let mut m = machine();
        let (open_timer, _) = armed(&m.handle(Input::Door(DoorSignal::Opened), at(0)));

        let (finalize, after) = armed(&m.handle(Input::Timer(open_timer), at(30)));
        assert_eq!(finalize.kind(), TimerKind::Finalize);
        assert_eq!(after, Duration::from_secs(2));
        assert_eq!(m.stop(), Some(at(30)));

        let window = captured(&m.handle(Input::Timer(finalize), at(32))).unwrap();
        assert_eq!(window, CaptureWindow { start: at(-10), stop: at(30) });
    }

    #[test]
    fn test_reopen_before_finalize_extends_same_cycle() {
        let mut m = machine();
        m.handle(Input::Door(DoorSignal::Opened), at(0));
        let (first_finalize, _) = armed(&m.handle(Input::Door(DoorSignal::Closed), at(5)));

        // Door reopens inside the POST + DELAY grace period.
        let (open_timer, _) = armed(&m.handle(Input::Door(DoorSignal::Opened), at(10)));
        assert_eq!(open_timer.kind(), TimerKind::StillOpen);
        assert_eq!(m.start(), Some(at(-10)));
        assert_eq!(m.stop(), None);
        assert_eq!(m.phase(), Phase::Capturing);

        // The superseded finalize must not produce a capture.
        assert!(m.handle(Input::Timer(first_finalize), at(17)).is_empty());
        assert_eq!(m.phase(), Phase::Capturing);

        let (finalize, _) = armed(&m.handle(Input::Door(DoorSignal::Closed), at(20)));
        let window = captured(&m.handle(Input::Timer(finalize), at(32))).unwrap();
        assert_eq!(window, CaptureWindow { start: at(-10), stop: at(30) });
    }

    #[test]
    fn test_repeated_open_keeps_start() {
        let mut m = machine();
        m.handle(Input::Door(DoorSignal::Opened), at(0));
        m.handle(Input::Door(DoorSignal::Opened), at(20));
        assert_eq!(m.start(), Some(at(-10)));
        assert_eq!(m.armed().map(|t| t.kind()), Some(TimerKind::StillOpen));
    }

    #[test]
    fn test_finalize_runs_at_most_once() {
        let mut m = machine();
        m.handle(Input::Door(DoorSignal::Opened), at(0));
        let (finalize, _) = armed(&m.handle(Input::Door(DoorSignal::Closed), at(5)));

        assert!(captured(&m.handle(Input::Timer(finalize), at(17))).is_some());
        assert!(m.handle(Input::Timer(finalize), at(17)).is_empty());
    }

    #[test]
    fn test_new_cycle_after_finalize_is_independent() {
        let mut m = machine();
        m.handle(Input::Door(DoorSignal::Opened), at(0));
        let (finalize, _) = armed(&m.handle(Input::Door(DoorSignal::Closed), at(5)));
        m.handle(Input::Timer(finalize), at(17));

        m.handle(Input::Door(DoorSignal::Opened), at(18));
        assert_eq!(m.start(), Some(at(8)));
        assert_eq!(m.stop(), None);
    }

    #[test]
    fn test_epochs_increase() {
        let mut m = machine();
        let (a, _) = armed(&m.handle(Input::Door(DoorSignal::Opened), at(0)));
        let (b, _) = armed(&m.handle(Input::Door(DoorSignal::Opened), at(1)));
        let (c, _) = armed(&m.handle(Input::Door(DoorSignal::Closed), at(2)));
        assert!(a.epoch() < b.epoch());
        assert!(b.epoch() < c.epoch());
    }

    #[test]
    fn test_still_open_without_capture_is_ignored() {
        let mut m = machine();
        // A token that matches the armed slot but with no event recorded
        // cannot be produced through `handle`; poke the record directly.
        m.epoch = 7;
        let token = TimerToken {
            epoch: 7,
            kind: TimerKind::StillOpen,
        };
        m.armed = Some(token);
        assert!(m.handle(Input::Timer(token), at(0)).is_empty());
        assert_eq!(m.phase(), Phase::Idle);
    }
}
