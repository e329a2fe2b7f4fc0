//! Phase timing for a run

use std::time::{Duration, Instant};

/// Wall clock of a run, split into named phases.
#[derive(Debug)]
pub struct Stopwatch {
    start: Instant,
    laps: Vec<(&'static str, Duration)>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            laps: Vec::new(),
        }
    }

    /// Close the current phase under `label`.
    pub fn lap(&mut self, label: &'static str) {
        self.laps.push((label, self.start.elapsed()));
    }

    pub fn total(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn total_ms(&self) -> u64 {
        self.total().as_millis() as u64
    }

    /// Duration of each phase, not cumulative.
    pub fn lap_times(&self) -> Vec<(&'static str, Duration)> {
        let mut prev = Duration::ZERO;
        self.laps
            .iter()
            .map(|(label, cumulative)| {
                let lap = cumulative.saturating_sub(prev);
                prev = *cumulative;
                (*label, lap)
            })
            .collect()
    }

    /// `plan=3ms dispatch=120ms`
    pub fn format(&self) -> String {
        self.lap_times()
            .iter()
            .map(|(label, d)| format!("{}={}ms", label, d.as_millis()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_stopwatch_phases() {
        let mut sw = Stopwatch::new();
        sleep(Duration::from_millis(10));
        sw.lap("plan");
        sleep(Duration::from_millis(10));
        sw.lap("dispatch");

        let laps = sw.lap_times();
        assert_eq!(laps.len(), 2);
        assert!(laps.iter().all(|(_, d)| *d >= Duration::from_millis(10)));
        assert!(sw.total_ms() >= 20);
        assert!(sw.format().starts_with("plan="));
    }
}
