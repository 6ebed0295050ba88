use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct SharedDiagnostics {
    pub frame_errors: AtomicU64,
    pub decisions: AtomicU64,
    pub rejects: AtomicU64,
    pub dropped_reports: AtomicU64,
    pub sensor_disconnects: AtomicU64,
}

impl SharedDiagnostics {
    pub fn record_frame_errors(&self, count: u64) {
        self.frame_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_decision(&self) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reject(&self) {
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_report(&self) {
        self.dropped_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sensor_disconnect(&self) {
        self.sensor_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            decisions: self.decisions.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            dropped_reports: self.dropped_reports.load(Ordering::Relaxed),
            sensor_disconnects: self.sensor_disconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagnosticsSnapshot {
    pub frame_errors: u64,
    pub decisions: u64,
    pub rejects: u64,
    pub dropped_reports: u64,
    pub sensor_disconnects: u64,
}
