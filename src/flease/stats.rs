//! Optional handler-timing statistics of the coordinator.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::Duration;

use statistical::{mean, standard_deviation};

/// Kind of work item the coordinator handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatKind {
    Request,
    Message,
    Timer,
}

/// Sink for per-item handler durations, fed from the coordinator task.
pub trait StatsCollector: Send + Sync {
    fn record(&self, kind: StatKind, elapsed: Duration);

    /// Summary of everything recorded since the last report, if the
    /// collector produces one. Called periodically by the coordinator.
    fn report(&self) -> Option<String> {
        None
    }
}

/// Collector keeping raw samples and reporting count, mean and standard
/// deviation (in microseconds) per kind.
#[derive(Debug, Default)]
pub struct SummaryStats {
    samples: Mutex<HashMap<StatKind, Vec<f64>>>,
}

impl SummaryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(count, mean_us, stdev_us)` of the samples of given kind.
    pub fn summarize(&self, kind: StatKind) -> (usize, f64, f64) {
        let samples = match self.samples.lock() {
            Ok(samples) => samples,
            Err(poisoned) => poisoned.into_inner(),
        };
        match samples.get(&kind) {
            Some(v) if !v.is_empty() => summarize_samples(v),
            _ => (0, 0.0, 0.0),
        }
    }
}

fn summarize_samples(v: &[f64]) -> (usize, f64, f64) {
    let avg = mean(v);
    // stdev is undefined for a single sample
    let stdev = if v.len() > 1 {
        standard_deviation(v, Some(avg))
    } else {
        0.0
    };
    (v.len(), avg, stdev)
}

impl StatsCollector for SummaryStats {
    fn record(&self, kind: StatKind, elapsed: Duration) {
        let mut samples = match self.samples.lock() {
            Ok(samples) => samples,
            Err(poisoned) => poisoned.into_inner(),
        };
        samples
            .entry(kind)
            .or_default()
            .push(elapsed.as_micros() as f64);
    }

    fn report(&self) -> Option<String> {
        let mut samples = match self.samples.lock() {
            Ok(samples) => samples,
            Err(poisoned) => poisoned.into_inner(),
        };
        if samples.values().all(|v| v.is_empty()) {
            return None;
        }
        let mut kinds: Vec<_> = samples.keys().copied().collect();
        kinds.sort();
        let parts: Vec<String> = kinds
            .into_iter()
            .filter_map(|kind| {
                let v = samples.get(&kind)?;
                if v.is_empty() {
                    return None;
                }
                let (cnt, avg, stdev) = summarize_samples(v);
                Some(format!(
                    "{:?} cnt {} avg {:.1} us sd {:.1} us",
                    kind, cnt, avg, stdev
                ))
            })
            .collect();
        samples.clear();
        Some(parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_per_kind() {
        let stats = SummaryStats::new();
        assert!(stats.report().is_none());
        for us in [100, 200, 300] {
            stats.record(StatKind::Message, Duration::from_micros(us));
        }
        stats.record(StatKind::Timer, Duration::from_micros(50));

        let (cnt, avg, stdev) = stats.summarize(StatKind::Message);
        assert_eq!(cnt, 3);
        assert!((avg - 200.0).abs() < 1e-9);
        assert!(stdev > 0.0);
        assert_eq!(stats.summarize(StatKind::Timer), (1, 50.0, 0.0));
        assert_eq!(stats.summarize(StatKind::Request).0, 0);

        let report = stats.report().unwrap();
        assert!(report.starts_with("Message cnt 3"));
        assert!(report.contains("Timer cnt 1"));
        // reporting resets the samples
        assert!(stats.report().is_none());
    }
}
