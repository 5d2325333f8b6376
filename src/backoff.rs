//! Bounded exponential backoff for connection retry loops.
//!
//! A [`BackoffSchedule`] describes the delay curve; [`BackoffSequence`] drives
//! it: each call to `next()` yields the current delay BEFORE sleeping, then
//! waits the upcoming delay in the gap between yields. Consumers attempt the
//! work after each yield and break on success. The in-gap sleep is raced
//! against a cancellation signal so shutdown never waits out a backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

/// Abstraction over waiting so retry loops stay deterministic under test.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Sleeper that returns immediately. Keeps reconnect tests fast.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Sleeper that records every requested duration without waiting.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations requested so far, in order.
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}

/// Delay curve: `delay_i = min(max, initial * multiplier^(i-1))` for
/// `i` in `1..=max_attempts`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSchedule {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl BackoffSchedule {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self { initial, max, multiplier, max_attempts }
    }

    /// Delay for a 1-indexed attempt, saturating at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial.min(self.max);
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Start driving the schedule with the given sleeper.
    pub fn sequence(&self, sleeper: Arc<dyn Sleeper>) -> BackoffSequence {
        BackoffSequence { schedule: self.clone(), sleeper, yielded: 0, cancel: None }
    }
}

/// Lazy, finite, cancellable delay sequence.
///
/// The first `next()` yields `delay_1` immediately; each later `next()`
/// sleeps the upcoming delay, then yields it. After `max_attempts` yields,
/// or on cancellation, the sequence returns `None`.
pub struct BackoffSequence {
    schedule: BackoffSchedule,
    sleeper: Arc<dyn Sleeper>,
    yielded: u32,
    cancel: Option<watch::Receiver<bool>>,
}

impl BackoffSequence {
    /// Terminate the sequence when the channel observes `true`.
    ///
    /// A dropped sender counts as cancellation: the owner of the shutdown
    /// signal is gone, so the retry loop must not keep running.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn next(&mut self) -> Option<Duration> {
        if self.yielded >= self.schedule.max_attempts || self.cancelled() {
            return None;
        }
        let attempt = self.yielded + 1;
        let delay = self.schedule.delay(attempt);
        if attempt > 1 && !self.sleep_interruptible(delay).await {
            return None;
        }
        self.yielded = attempt;
        Some(delay)
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Returns false when the sleep was cut short by cancellation.
    async fn sleep_interruptible(&mut self, delay: Duration) -> bool {
        let Some(rx) = self.cancel.as_ref() else {
            self.sleeper.sleep(delay).await;
            return true;
        };
        let mut rx = rx.clone();
        tokio::select! {
            _ = self.sleeper.sleep(delay) => true,
            _ = rx.wait_for(|cancelled| *cancelled) => false,
        }
    }
}
