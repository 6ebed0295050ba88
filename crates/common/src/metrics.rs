use std::collections::VecDeque;
use std::sync::{atomic::{AtomicUsize, Ordering}, Arc, Mutex};
use std::time::Duration;
use serde::Serialize;
use tracing::info;

/// Processing budget for one controller event.
pub const EVENT_DEADLINE: Duration = Duration::from_millis(1);

/// Results kept by [`MetricsRecorder::new`]; about three hours of 200 ms ticks
/// plus traffic.
pub const DEFAULT_RETAINED: usize = 50_000;

#[derive(Debug, Serialize, Clone)]
pub struct CycleResult {
    pub cycle_id: u64,
    pub event: &'static str,
    pub processing_time_ns: u64,
    pub deadline_met: bool,
    pub lateness_ns: i64,
}

impl CycleResult {
    pub fn new(cycle_id: u64, event: &'static str, elapsed: Duration) -> Self {
        let deadline_met = elapsed <= EVENT_DEADLINE;
        let lateness_ns = if deadline_met {
            0
        } else {
            elapsed.as_nanos() as i64 - EVENT_DEADLINE.as_nanos() as i64
        };
        Self {
            cycle_id,
            event,
            processing_time_ns: elapsed.as_nanos() as u64,
            deadline_met,
            lateness_ns,
        }
    }
}

/// Thread-safe recorder of per-event processing times.
/// Cloning shares the same underlying storage.
///
/// Keeps the most recent `limit` results; older ones are evicted, while the
/// counters cover everything ever recorded.
#[derive(Clone)]
pub struct MetricsRecorder {
    results: Arc<Mutex<VecDeque<CycleResult>>>,
    limit: usize,
    recorded: Arc<AtomicUsize>,
    missed_deadlines: Arc<AtomicUsize>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_RETAINED)
    }

    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            results: Arc::new(Mutex::new(VecDeque::with_capacity(limit.min(10_000)))),
            limit,
            recorded: Arc::new(AtomicUsize::new(0)),
            missed_deadlines: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn record(&self, result: CycleResult) {
        if let Ok(mut data) = self.results.lock() {
            if !result.deadline_met {
                self.missed_deadlines.fetch_add(1, Ordering::Relaxed);
            }
            self.recorded.fetch_add(1, Ordering::Relaxed);
            if data.len() == self.limit {
                data.pop_front();
            }
            data.push_back(result);
        }
    }

    /// Results recorded since creation, including evicted ones.
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn missed_deadlines(&self) -> usize {
        self.missed_deadlines.load(Ordering::Relaxed)
    }

    pub fn get_results(&self) -> Vec<CycleResult> {
        self.results
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn save_to_csv(&self, filename: &str) -> Result<(), Box<dyn std::error::Error>> {
        let data = self.get_results();
        let mut wtr = csv::Writer::from_path(filename)?;
        for record in data.iter() {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        info!(
            records = data.len(),
            evicted = self.recorded().saturating_sub(data.len()),
            path = filename,
            "saved event metrics"
        );
        Ok(())
    }
}
