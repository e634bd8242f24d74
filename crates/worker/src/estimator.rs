//! Run-time estimation for the `estimate` client event.
//!
//! Keeps an exponentially-weighted moving average of prep, LLM, and tool
//! latencies per model. Confidence grows with sample count.

use std::collections::HashMap;

use parking_lot::Mutex;

use fd_domain::events::{Confidence, EstimateBreakdown};

const ALPHA: f64 = 0.3;

#[derive(Debug, Clone)]
struct ModelStats {
    prep_seconds: f64,
    llm_seconds: f64,
    tool_seconds: f64,
    samples: u32,
}

impl Default for ModelStats {
    fn default() -> Self {
        // Cold-start priors.
        Self {
            prep_seconds: 0.5,
            llm_seconds: 3.0,
            tool_seconds: 0.0,
            samples: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Estimate {
    pub estimated_seconds: f64,
    pub confidence: Confidence,
    pub breakdown: EstimateBreakdown,
}

#[derive(Default)]
pub struct TimeEstimator {
    stats: Mutex<HashMap<String, ModelStats>>,
}

impl TimeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, prep_seconds: f64, llm_seconds: f64, tool_seconds: f64) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(model.to_owned()).or_default();
        if entry.samples == 0 {
            entry.prep_seconds = prep_seconds;
            entry.llm_seconds = llm_seconds;
            entry.tool_seconds = tool_seconds;
        } else {
            entry.prep_seconds = ALPHA * prep_seconds + (1.0 - ALPHA) * entry.prep_seconds;
            entry.llm_seconds = ALPHA * llm_seconds + (1.0 - ALPHA) * entry.llm_seconds;
            entry.tool_seconds = ALPHA * tool_seconds + (1.0 - ALPHA) * entry.tool_seconds;
        }
        entry.samples += 1;
    }

    pub fn estimate(&self, model: &str) -> Estimate {
        let stats = self.stats.lock();
        let entry = stats.get(model).cloned().unwrap_or_default();
        let confidence = match entry.samples {
            0..=2 => Confidence::Low,
            3..=9 => Confidence::Medium,
            _ => Confidence::High,
        };
        Estimate {
            estimated_seconds: entry.prep_seconds + entry.llm_seconds + entry.tool_seconds,
            confidence,
            breakdown: EstimateBreakdown {
                prep: round1(entry.prep_seconds),
                llm: round1(entry.llm_seconds),
                tools: round1(entry.tool_seconds),
            },
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
