//! Loop profiling.
//!
//! Stages of the tracking pipeline record their durations in [`Timer`]s. A [`RateLog`] counts
//! processed frames and, once per second, logs the frame rate together with the average duration
//! of each timed stage.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Accumulates the time spent in one pipeline stage.
pub struct Timer {
    name: &'static str,
    spent: Mutex<Spent>,
}

#[derive(Default, Clone, Copy)]
struct Spent {
    total: Duration,
    runs: u32,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            spent: Mutex::default(),
        }
    }

    /// Runs `stage` and adds its duration to this timer.
    pub fn time<T>(&self, stage: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = stage();
        self.record(start.elapsed());
        result
    }

    fn record(&self, elapsed: Duration) {
        let mut spent = self.spent.lock().unwrap_or_else(PoisonError::into_inner);
        spent.total += elapsed;
        spent.runs += 1;
    }

    /// Returns the stage name, the number of runs and their mean duration since the last call,
    /// and starts a new measurement period.
    fn take(&self) -> (&'static str, u32, Duration) {
        let mut spent = self.spent.lock().unwrap_or_else(PoisonError::into_inner);
        let Spent { total, runs } = std::mem::take(&mut *spent);
        let mean = total.checked_div(runs).unwrap_or_default();
        (self.name, runs, mean)
    }
}

/// Formats as `name: <runs>x<mean>ms` and resets the timer.
impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, runs, mean) = self.take();
        write!(f, "{name}: {runs}x{:.1}ms", mean.as_secs_f32() * 1000.0)
    }
}

/// Logs the frame rate of a loop at *debug* level, once per second.
pub struct RateLog {
    name: &'static str,
    frames: u32,
    since: Instant,
}

impl RateLog {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            frames: 0,
            since: Instant::now(),
        }
    }

    /// Counts one frame. If a second has passed, logs the rate and the `timers`' summaries.
    pub fn frame(&mut self, timers: &[&Timer]) {
        self.frames += 1;
        if self.since.elapsed() < Duration::from_secs(1) {
            return;
        }

        let stages = timers
            .iter()
            .map(|timer| timer.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        log::debug!("{}: {} FPS [{stages}]", self.name, self.frames);

        self.frames = 0;
        self.since = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_resets() {
        let timer = Timer::new("decode");
        timer.time(|| ());
        assert_eq!(timer.time(|| 7), 7);
        assert!(timer.to_string().starts_with("decode: 2x"));
        assert_eq!(timer.to_string(), "decode: 0x0.0ms");
    }

    #[test]
    fn mean_duration() {
        let timer = Timer::new("infer");
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));
        assert_eq!(timer.to_string(), "infer: 2x20.0ms");
    }

    #[test]
    fn rate_log_counts_until_a_second_passed() {
        let timer = Timer::new("read");
        timer.record(Duration::from_millis(5));

        let mut log = RateLog::new("loop");
        log.frame(&[&timer]);
        log.frame(&[&timer]);
        assert_eq!(log.frames, 2);
        // Timers are only summarized (and reset) when the rate is logged.
        assert_eq!(timer.to_string(), "read: 1x5.0ms");

        log.since -= Duration::from_secs(2);
        log.frame(&[]);
        assert_eq!(log.frames, 0);
    }
}
