//! Timestamp sanity statistics for recorded event files.

use edvs_core::Event;
use std::fmt;

/// A place where the timestamp went backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderViolation {
    /// Index of the offending event
    pub index: u64,
    /// Timestamp of the event before it
    pub previous: u64,
    /// Timestamp of the event itself
    pub timestamp: u64,
}

/// Accumulates event count, order violations and inter-event deltas.
///
/// Only strictly increasing neighbours contribute to the delta statistics.
#[derive(Debug, Default)]
pub struct TimestampCheck {
    count: u64,
    last: Option<u64>,
    violations: Vec<OrderViolation>,
    deltas: Vec<u64>,
}

impl TimestampCheck {
    /// Creates an empty check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the next events of the file, in file order.
    pub fn add(&mut self, events: &[Event]) {
        for event in events {
            if let Some(previous) = self.last {
                if event.timestamp < previous {
                    self.violations.push(OrderViolation {
                        index: self.count,
                        previous,
                        timestamp: event.timestamp,
                    });
                } else if event.timestamp > previous {
                    self.deltas.push(event.timestamp - previous);
                }
            }
            self.last = Some(event.timestamp);
            self.count += 1;
        }
    }

    /// Events seen so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Every backwards step, in file order.
    pub fn violations(&self) -> &[OrderViolation] {
        &self.violations
    }

    /// Delta statistics, `None` if no two events had increasing timestamps.
    pub fn summary(&self) -> Option<DeltaSummary> {
        if self.deltas.is_empty() {
            return None;
        }
        let mut sorted = self.deltas.clone();
        sorted.sort_unstable();

        let n = sorted.len() as f64;
        let mean = sorted.iter().map(|&d| d as f64).sum::<f64>() / n;
        let variance = sorted
            .iter()
            .map(|&d| (d as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        // 20% bins
        let quintiles = [1, 2, 3, 4].map(|q| sorted[(sorted.len() - 1) * q / 5]);

        Some(DeltaSummary {
            samples: sorted.len(),
            mean,
            std_dev: variance.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            quintiles,
        })
    }
}

/// Statistics of the time between consecutive events, in microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaSummary {
    /// Number of positive deltas
    pub samples: usize,
    /// Mean delta
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    /// Smallest delta
    pub min: u64,
    /// Largest delta
    pub max: u64,
    /// Deltas at the 20, 40, 60 and 80 percent ranks
    pub quintiles: [u64; 4],
}

impl fmt::Display for DeltaSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Samples:      {}", self.samples)?;
        writeln!(f, "  Mean:         {:.2} µs", self.mean)?;
        writeln!(f, "  Std dev:      {:.2} µs", self.std_dev)?;
        writeln!(f, "  Min / max:    {} / {} µs", self.min, self.max)?;
        let [q1, q2, q3, q4] = self.quintiles;
        write!(f, "  Quintiles:    {} - {} - {} - {} µs", q1, q2, q3, q4)
    }
}
