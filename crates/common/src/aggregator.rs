//! Sliding-window debouncing of per-frame recognition results.
//!
//! A window opens on the first recognition sample and lasts
//! `window_duration`. It closes early once one identity collects
//! `early_accept` qualifying samples. A closed window yields at most one
//! decision, and the next sample always opens a fresh window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::protocol::RecognitionEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    pub duration: Duration,
    pub score_threshold: u8,
    /// Qualifying same-identity samples that close the window at once; 0 disables.
    pub early_accept: usize,
    pub reset_on_detection: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            score_threshold: 80,
            early_accept: 2,
            reset_on_detection: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub identity: String,
    /// Highest qualifying score seen for `identity` in the window.
    pub confidence: u8,
    pub qualifying_samples: usize,
    pub total_samples: usize,
}

/// What a closed window produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOutcome {
    Accepted(Decision),
    /// Window elapsed with samples but none qualifying.
    Rejected { attempts: usize },
}

#[derive(Debug, Clone)]
struct Sample {
    label: String,
    score: u8,
    qualifying: bool,
}

#[derive(Debug)]
struct RecognitionWindow {
    start: Instant,
    samples: Vec<Sample>,
}

#[derive(Debug)]
pub struct RecognitionAggregator {
    config: WindowConfig,
    window: Option<RecognitionWindow>,
}

impl RecognitionAggregator {
    pub fn new(config: WindowConfig) -> Self {
        Self { config, window: None }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.window.is_some()
    }

    /// When the open window times out, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.window.as_ref().map(|w| w.start + self.config.duration)
    }

    fn qualifies(&self, event: &RecognitionEvent) -> bool {
        event.is_known() && event.score >= self.config.score_threshold
    }

    /// Adds one recognition sample observed at `now`.
    ///
    /// A window that had already elapsed is closed first, so a single call
    /// can yield the outcome of the expired window and an early accept of
    /// the window this sample opens.
    pub fn observe(&mut self, event: &RecognitionEvent, now: Instant) -> Vec<WindowOutcome> {
        let mut outcomes = Vec::new();
        if let Some(outcome) = self.poll(now) {
            outcomes.push(outcome);
        }

        let qualifying = self.qualifies(event);
        let window = self.window.get_or_insert_with(|| {
            debug!("opening recognition window");
            RecognitionWindow {
                start: now,
                samples: Vec::new(),
            }
        });
        window.samples.push(Sample {
            label: event.label.clone(),
            score: event.score,
            qualifying,
        });

        if qualifying && self.config.early_accept > 0 {
            let same = window
                .samples
                .iter()
                .filter(|s| s.qualifying && s.label == event.label)
                .count();
            if same >= self.config.early_accept {
                debug!(user = %event.label, samples = same, "early accept");
                if let Some(outcome) = self.close() {
                    outcomes.push(outcome);
                }
            }
        }
        outcomes
    }

    /// Closes the window if it has elapsed by `now`.
    pub fn poll(&mut self, now: Instant) -> Option<WindowOutcome> {
        let expired = self
            .window
            .as_ref()
            .is_some_and(|w| now.saturating_duration_since(w.start) >= self.config.duration);
        if expired {
            self.close()
        } else {
            None
        }
    }

    /// Applies the detection policy; returns true if an open window was discarded.
    pub fn on_detection(&mut self) -> bool {
        if self.config.reset_on_detection && self.window.is_some() {
            debug!("detection reset the recognition window");
            self.window = None;
            return true;
        }
        false
    }

    /// Discards the open window without an outcome.
    pub fn reset(&mut self) {
        self.window = None;
    }

    fn close(&mut self) -> Option<WindowOutcome> {
        let window = self.window.take()?;
        let outcome = evaluate(&window.samples);
        match &outcome {
            Some(WindowOutcome::Accepted(decision)) => info!(
                user = %decision.identity,
                score = decision.confidence,
                samples = decision.qualifying_samples,
                "recognition window accepted"
            ),
            Some(WindowOutcome::Rejected { attempts }) => {
                info!(attempts, "recognition window rejected")
            }
            None => {}
        }
        outcome
    }
}

/// Plurality of qualifying labels, ties going to the label whose latest
/// qualifying sample is most recent.
fn evaluate(samples: &[Sample]) -> Option<WindowOutcome> {
    if samples.is_empty() {
        return None;
    }

    // label -> (count, max score, index of latest qualifying sample)
    let mut tally: HashMap<&str, (usize, u8, usize)> = HashMap::new();
    for (i, sample) in samples.iter().enumerate().filter(|(_, s)| s.qualifying) {
        let entry = tally.entry(sample.label.as_str()).or_insert((0, 0, i));
        entry.0 += 1;
        entry.1 = entry.1.max(sample.score);
        entry.2 = i;
    }

    let Some((label, (count, confidence, _))) = tally
        .into_iter()
        .max_by_key(|(_, (count, _, latest))| (*count, *latest))
    else {
        return Some(WindowOutcome::Rejected {
            attempts: samples.len(),
        });
    };

    Some(WindowOutcome::Accepted(Decision {
        identity: label.to_string(),
        confidence,
        qualifying_samples: count,
        total_samples: samples.len(),
    }))
}
