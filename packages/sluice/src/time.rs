//! Timers and tickers which deliver over channels, for use with [`select`](crate::select()).

use crate::{util::abort_on_drop::AbortOnDrop, Channel};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering::AcqRel},
        Arc,
    },
    time::Duration,
};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};


/// One-shot timer which writes the instant it fired into a channel
///
/// The channel has capacity 1, so firing never waits for a reader. Dropping the timer stops it.
pub struct Timer {
    channel: Channel<Instant>,
    fired: Arc<AtomicBool>,
    task: AbortOnDrop,
}

impl Timer {
    /// Start a timer which fires once `duration` has elapsed
    ///
    /// Must be called within a tokio runtime.
    pub fn new(duration: Duration) -> Self {
        let channel = Channel::new(1);
        let fired = Arc::new(AtomicBool::new(false));
        let task = {
            let channel = channel.clone();
            let fired = Arc::clone(&fired);
            AbortOnDrop::spawn(async move {
                sleep(duration).await;
                if !fired.swap(true, AcqRel) {
                    trace!("timer fired");
                    let _ = channel.try_write(Instant::now());
                }
            })
        };
        Timer { channel, fired, task }
    }

    /// Channel the firing instant is written into
    pub fn channel(&self) -> &Channel<Instant> {
        &self.channel
    }

    /// Stop the timer from firing
    ///
    /// Returns true if this call stopped it, or false if it had already fired or been stopped.
    /// The channel is left open.
    pub fn stop(&self) -> bool {
        self.task.abort();
        !self.fired.swap(true, AcqRel)
    }
}


/// Periodic ticker which writes the instant of each tick into a channel
///
/// The channel has capacity 1. Ticks are dropped rather than queued while a reader is slow to
/// take them. Dropping the ticker stops it.
pub struct Ticker {
    channel: Channel<Instant>,
    task: AbortOnDrop,
}

impl Ticker {
    /// Start a ticker which first ticks once `period` has elapsed
    ///
    /// Panics if `period` is zero. Must be called within a tokio runtime.
    pub fn new(period: Duration) -> Self {
        assert!(!period.is_zero(), "ticker period must be non-zero");
        let channel = Channel::new(1);
        let first = Instant::now() + period;
        let task = {
            let channel = channel.clone();
            AbortOnDrop::spawn(async move {
                let mut interval = interval_at(first, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    let tick = interval.tick().await;
                    if let Err(e) = channel.try_write(tick) {
                        if e.is_closed() {
                            break;
                        }
                        trace!("dropping tick for slow reader");
                    }
                }
            })
        };
        Ticker { channel, task }
    }

    /// Channel the tick instants are written into
    pub fn channel(&self) -> &Channel<Instant> {
        &self.channel
    }

    /// Stop ticking and close the channel
    ///
    /// A tick already buffered can still be read.
    pub fn stop(&self) {
        self.task.abort();
        self.channel.close();
    }
}
