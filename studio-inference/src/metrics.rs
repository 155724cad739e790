//! Time-to-first-token and time-per-output-token accounting.
//!
//! The tracker only trusts `usage.completion_tokens`: a chunk counts when the
//! reported total strictly increases. Chunks that jump by several tokens at
//! once contribute one timestamp per implied token, which yields zero-length
//! intervals; those are kept for the mean and dropped for the distribution
//! statistics.

use crate::chunk::Usage;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// The final metrics object sent before `[DONE]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Seconds from dispatch to the first completion token.
    pub ttft: Option<f64>,
    /// Mean seconds per output token.
    pub tpot: f64,
    pub tpot_median: f64,
    pub tpot_min: f64,
    pub tpot_max: f64,
    pub tpot_p95: f64,
    pub tpot_p99: f64,
    pub tokens_decoded: u64,
    pub tokens_prefilled: u64,
    pub context_length: u64,
}

/// Per-request metrics state.
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    started: Instant,
    ttft: Option<f64>,
    token_times: Vec<Instant>,
    completion_tokens: u64,
    prompt_tokens: u64,
}

impl MetricsTracker {
    /// Start the clock now.
    pub fn start() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started: Instant) -> Self {
        Self {
            started,
            ttft: None,
            token_times: Vec::new(),
            completion_tokens: 0,
            prompt_tokens: 0,
        }
    }

    pub fn observe(&mut self, usage: Usage) {
        self.observe_at(usage, Instant::now());
    }

    /// Record a usage report that arrived at `now`.
    pub fn observe_at(&mut self, usage: Usage, now: Instant) {
        if usage.completion_tokens <= self.completion_tokens {
            return;
        }
        if self.ttft.is_none() {
            self.ttft = Some(now.duration_since(self.started).as_secs_f64());
            self.prompt_tokens = usage.prompt_tokens;
        } else if self.prompt_tokens == 0 {
            self.prompt_tokens = usage.prompt_tokens;
        }
        let advanced = usage.completion_tokens - self.completion_tokens;
        for _ in 0..advanced {
            self.token_times.push(now);
        }
        self.completion_tokens = usage.completion_tokens;
    }

    pub fn tokens_decoded(&self) -> u64 {
        self.completion_tokens
    }

    pub fn finish(&self) -> StreamMetrics {
        let intervals: Vec<f64> = self
            .token_times
            .windows(2)
            .map(|w| w[1].duration_since(w[0]).as_secs_f64())
            .collect();

        let tpot = match (self.token_times.first(), self.token_times.last()) {
            (Some(first), Some(last)) if !intervals.is_empty() => {
                last.duration_since(*first).as_secs_f64() / intervals.len() as f64
            }
            _ => 0.0,
        };

        let mut nonzero: Vec<f64> = intervals.into_iter().filter(|d| *d > 0.0).collect();
        nonzero.sort_by(f64::total_cmp);

        StreamMetrics {
            ttft: self.ttft,
            tpot,
            tpot_median: median(&nonzero),
            tpot_min: nonzero.first().copied().unwrap_or(0.0),
            tpot_max: nonzero.last().copied().unwrap_or(0.0),
            tpot_p95: percentile(&nonzero, 95.0),
            tpot_p99: percentile(&nonzero, 99.0),
            tokens_decoded: self.completion_tokens,
            tokens_prefilled: self.prompt_tokens,
            context_length: self.prompt_tokens + self.completion_tokens,
        }
    }
}

fn median(sorted: &[f64]) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n if n % 2 == 1 => sorted[n / 2],
        n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
