//! Event worker – the single owner of the door event state.
//!
//! Door signals from the subscriber and expirations of the worker's own
//! timer are funnelled into one task, so transitions never interleave.
//! Only the most recently armed timer task is kept; arming a new one
//! aborts the previous task, and the epoch carried by each token makes a
//! late firing that slipped through a guaranteed no-op.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use doorcap_common::config::Timings;
use doorcap_common::event::{CaptureWindow, Effect, EventMachine, Input, Phase, TimerToken};
use doorcap_common::signal::DoorSignal;

/// Capacity of the door signal queue.
const SIGNAL_QUEUE: usize = 64;

/// Wall-clock time derived from a wall-clock anchor plus monotonic
/// elapsed time.
///
/// The anchor is taken again at the start of every door event, so a step
/// of the system clock (an NTP sync after boot, say) is picked up by the
/// next event while the event in progress keeps a consistent timeline.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    source: fn() -> DateTime<Utc>,
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self::with_source(Utc::now)
    }

    /// A clock that anchors itself on `source`.
    pub fn with_source(source: fn() -> DateTime<Utc>) -> Self {
        Self {
            source,
            wall: source(),
            mono: Instant::now(),
        }
    }

    /// Take a fresh wall-clock anchor.
    pub fn reanchor(&mut self) {
        self.wall = (self.source)();
        self.mono = Instant::now();
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.wall + TimeDelta::from_std(self.mono.elapsed()).unwrap_or(TimeDelta::zero())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

struct Worker {
    machine: EventMachine,
    clock: Clock,
    signals: mpsc::Receiver<DoorSignal>,
    timer_tx: mpsc::UnboundedSender<TimerToken>,
    timer_rx: mpsc::UnboundedReceiver<TimerToken>,
    timer: Option<JoinHandle<()>>,
    captures: mpsc::UnboundedSender<CaptureWindow>,
}

/// Start the worker.  Completed windows are sent to `captures`.
///
/// The worker stops once every clone of the returned sender is dropped.
pub fn spawn(
    timings: Timings,
    clock: Clock,
    captures: mpsc::UnboundedSender<CaptureWindow>,
) -> (mpsc::Sender<DoorSignal>, JoinHandle<()>) {
    let (signal_tx, signals) = mpsc::channel(SIGNAL_QUEUE);
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();

    let worker = Worker {
        machine: EventMachine::new(timings),
        clock,
        signals,
        timer_tx,
        timer_rx,
        timer: None,
        captures,
    };
    (signal_tx, tokio::spawn(worker.run()))
}

impl Worker {
    async fn run(mut self) {
        loop {
            let input = tokio::select! {
                signal = self.signals.recv() => match signal {
                    Some(signal) => Input::Door(signal),
                    None => break,
                },
                Some(token) = self.timer_rx.recv() => Input::Timer(token),
            };

            if input == Input::Door(DoorSignal::Opened) && self.machine.phase() == Phase::Idle {
                self.clock.reanchor();
            }
            let now = self.clock.now();
            for effect in self.machine.handle(input, now) {
                self.apply(effect);
            }
        }

        self.cancel_timer();
        if self.machine.phase() != Phase::Idle {
            warn!(
                "Signal feed closed with a capture in progress (start={:?}); dropping it",
                self.machine.start()
            );
        }
        info!("Event worker stopped");
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Arm { token, after } => self.arm(token, after),
            Effect::Disarm => self.cancel_timer(),
            Effect::Capture(window) => {
                if self.captures.send(window).is_err() {
                    warn!(
                        "Capture pipeline is gone, dropping window {} → {}",
                        window.start, window.stop
                    );
                }
            }
        }
    }

    fn arm(&mut self, token: TimerToken, after: Duration) {
        self.cancel_timer();
        debug!(
            "Arming {:?} timer (epoch {}) for {}s",
            token.kind(),
            token.epoch(),
            after.as_secs_f32()
        );
        let tx = self.timer_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(token);
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::time;

    use std::cell::Cell;

    // Tests run with a paused clock: time only moves when every task is
    // idle, which makes the timer arithmetic exact.  The system clock is
    // stood in for by a per-thread wall time that follows virtual time
    // and can be stepped.

    thread_local! {
        static WALL: Cell<Option<(Instant, DateTime<Utc>)>> = const { Cell::new(None) };
    }

    /// Step the fake system clock so that it reads `wall` right now.
    fn set_wall(wall: DateTime<Utc>) {
        WALL.with(|w| w.set(Some((Instant::now(), wall))));
    }

    fn fake_wall() -> DateTime<Utc> {
        let (set_at, wall) = WALL.with(Cell::get).unwrap_or((Instant::now(), t0()));
        wall + TimeDelta::from_std(set_at.elapsed()).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 1, 30, 6, 20, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + TimeDelta::seconds(secs)
    }

    fn start_worker() -> (
        mpsc::Sender<DoorSignal>,
        mpsc::UnboundedReceiver<CaptureWindow>,
        JoinHandle<()>,
    ) {
        set_wall(t0());
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (signals, handle) = spawn(Timings::default(), Clock::with_source(fake_wall), capture_tx);
        (signals, capture_rx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_virtual_time() {
        set_wall(t0());
        let clock = Clock::with_source(fake_wall);
        time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), at(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_ignores_wall_step_until_reanchored() {
        set_wall(t0());
        let mut clock = Clock::with_source(fake_wall);
        time::sleep(Duration::from_secs(10)).await;
        set_wall(at(3600));

        assert_eq!(clock.now(), at(10));
        clock.reanchor();
        assert_eq!(clock.now(), at(3600));
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.now(), at(3605));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_close_produces_one_capture() {
        let begin = Instant::now();
        let (signals, mut captures, _worker) = start_worker();

        signals.send(DoorSignal::Opened).await.unwrap();
        time::sleep(Duration::from_secs(5)).await;
        signals.send(DoorSignal::Closed).await.unwrap();

        let window = captures.recv().await.unwrap();
        assert_eq!(begin.elapsed(), Duration::from_secs(17));
        assert_eq!(window, CaptureWindow { start: at(-10), stop: at(15) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_door_left_open_is_cut_after_open_timeout() {
        let begin = Instant::now();
        let (signals, mut captures, _worker) = start_worker();

        signals.send(DoorSignal::Opened).await.unwrap();

        let window = captures.recv().await.unwrap();
        assert_eq!(begin.elapsed(), Duration::from_secs(32));
        assert_eq!(window, CaptureWindow { start: at(-10), stop: at(30) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_during_grace_period_merges_cycles() {
        let begin = Instant::now();
        let (signals, mut captures, _worker) = start_worker();

        signals.send(DoorSignal::Opened).await.unwrap();
        time::sleep(Duration::from_secs(5)).await;
        signals.send(DoorSignal::Closed).await.unwrap();
        time::sleep(Duration::from_secs(5)).await;
        signals.send(DoorSignal::Opened).await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        signals.send(DoorSignal::Closed).await.unwrap();

        let window = captures.recv().await.unwrap();
        assert_eq!(begin.elapsed(), Duration::from_secs(32));
        assert_eq!(window, CaptureWindow { start: at(-10), stop: at(30) });

        // Nothing else is pending.
        let extra = time::timeout(Duration::from_secs(600), captures.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_cycles_are_independent() {
        let (signals, mut captures, _worker) = start_worker();

        signals.send(DoorSignal::Opened).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        signals.send(DoorSignal::Closed).await.unwrap();
        let first = captures.recv().await.unwrap();
        assert_eq!(first, CaptureWindow { start: at(-10), stop: at(11) });

        // t = 13: a fresh cycle begins right after the first was finalized.
        signals.send(DoorSignal::Opened).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        signals.send(DoorSignal::Closed).await.unwrap();
        let second = captures.recv().await.unwrap();
        assert_eq!(second, CaptureWindow { start: at(3), stop: at(25) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_step_applies_from_next_event() {
        let (signals, mut captures, _worker) = start_worker();

        signals.send(DoorSignal::Opened).await.unwrap();
        time::sleep(Duration::from_secs(5)).await;
        // The system clock jumps an hour ahead mid-event.
        set_wall(at(3605));
        signals.send(DoorSignal::Closed).await.unwrap();
        let first = captures.recv().await.unwrap();
        assert_eq!(first, CaptureWindow { start: at(-10), stop: at(15) });

        // t = 17: the next event is anchored on the stepped clock.
        signals.send(DoorSignal::Opened).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        signals.send(DoorSignal::Closed).await.unwrap();
        let second = captures.recv().await.unwrap();
        assert_eq!(second, CaptureWindow { start: at(3607), stop: at(3628) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_open_is_ignored() {
        let (signals, mut captures, _worker) = start_worker();

        signals.send(DoorSignal::Closed).await.unwrap();
        let nothing = time::timeout(Duration::from_secs(600), captures.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_when_feed_closes() {
        let (signals, mut captures, worker) = start_worker();

        signals.send(DoorSignal::Opened).await.unwrap();
        drop(signals);
        worker.await.unwrap();

        // The capture sender was dropped with the worker.
        assert!(captures.recv().await.is_none());
    }
}
