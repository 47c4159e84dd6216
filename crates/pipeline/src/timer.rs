use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{
        Duration,
        Instant,
    },
};

/// Clock handle threaded through hydration and advancement so the bounded
/// advancement discipline is testable without real sleeps.
pub trait AdvanceTimer {
    /// Cumulative elapsed time since the operation this timer measures
    /// began.
    fn total_elapsed(&self) -> Duration;
}

pub struct WallClockTimer {
    start: Instant,
}

impl WallClockTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for WallClockTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvanceTimer for WallClockTimer {
    fn total_elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Test timer returning a scripted sequence of readings; the last reading
/// repeats once the script is exhausted.
pub struct ScriptedTimer {
    readings: Mutex<VecDeque<Duration>>,
    last: Mutex<Duration>,
}

impl ScriptedTimer {
    pub fn new(readings: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().collect()),
            last: Mutex::new(Duration::ZERO),
        }
    }

    pub fn constant(reading: Duration) -> Self {
        Self::new([reading])
    }
}

impl AdvanceTimer for ScriptedTimer {
    fn total_elapsed(&self) -> Duration {
        let mut readings = self.readings.lock().expect("timer poisoned");
        match readings.pop_front() {
            Some(reading) => {
                *self.last.lock().expect("timer poisoned") = reading;
                reading
            },
            None => *self.last.lock().expect("timer poisoned"),
        }
    }
}
