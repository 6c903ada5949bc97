/// Load-weighted selection
///
/// Each endpoint gets a favorability score in `0..=100` from its load
/// fraction: unloaded endpoints score 100, fully loaded ones 0, and anything
/// in between `|ceil(10 * ln(fraction))|` capped at 100. The selectable list
/// then holds one slot per score threshold (100, 95, ..., 5) the endpoint
/// clears, plus a fixed number of baseline slots every endpoint receives.
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use super::{next_slot, SelectionStrategy};
use crate::core::{metrics, Endpoint};
use crate::pool::EndpointPool;
use crate::transport::RequestMessage;

pub const DEFAULT_QUEUE_CAPACITY: f64 = 8192.0;
/// Assumed CPU utilization (percent) of an endpoint that reports none
pub const DEFAULT_CPU_UTILIZATION: f64 = 50.0;
pub const DEFAULT_BASELINE_SLOTS: usize = 1;

pub const MAX_SCORE: u32 = 100;
const SCORE_STEP: u32 = 5;

/// Which endpoint metric drives the load fraction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadMetric {
    /// Pending requests relative to `capacity`; a missing metric counts as idle
    QueueDepth { capacity: f64 },
    /// CPU utilization in percent
    CpuUtilization,
}

impl Default for LoadMetric {
    fn default() -> Self {
        LoadMetric::QueueDepth {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl LoadMetric {
    /// Load of the endpoint as a fraction of its capacity
    pub fn load_fraction(&self, endpoint: &Endpoint) -> f64 {
        match self {
            LoadMetric::QueueDepth { capacity } => {
                endpoint.metric(metrics::QUEUE_DEPTH).unwrap_or(0.0) / capacity
            }
            LoadMetric::CpuUtilization => {
                endpoint
                    .metric(metrics::CPU_UTILIZATION)
                    .unwrap_or(DEFAULT_CPU_UTILIZATION)
                    / 100.0
            }
        }
    }
}

/// Favorability of an endpoint at the given load fraction
pub fn favorability_score(fraction: f64) -> u32 {
    if fraction.is_nan() {
        return 0;
    }
    if fraction <= 0.0 {
        return MAX_SCORE;
    }
    // Past capacity the magnitude grows again
    let score = (fraction.ln() * 10.0).ceil().abs();
    score.min(MAX_SCORE as f64) as u32
}

/// Number of selectable slots an endpoint with `score` receives
pub fn slot_count(score: u32, baseline_slots: usize) -> usize {
    (score.min(MAX_SCORE) / SCORE_STEP) as usize + baseline_slots
}

/// Favors lightly loaded endpoints by giving them more selectable slots
#[derive(Debug)]
pub struct LoadWeighted {
    metric: LoadMetric,
    baseline_slots: usize,
    counter: AtomicUsize,
}

impl LoadWeighted {
    pub fn new(metric: LoadMetric) -> Self {
        Self::with_baseline(metric, DEFAULT_BASELINE_SLOTS)
    }

    pub fn with_baseline(metric: LoadMetric, baseline_slots: usize) -> Self {
        Self {
            metric,
            baseline_slots,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn metric(&self) -> LoadMetric {
        self.metric
    }

    pub fn score(&self, endpoint: &Endpoint) -> u32 {
        favorability_score(self.metric.load_fraction(endpoint))
    }
}

impl Default for LoadWeighted {
    fn default() -> Self {
        Self::new(LoadMetric::default())
    }
}

impl SelectionStrategy for LoadWeighted {
    fn name(&self) -> &'static str {
        "load_weighted"
    }

    fn init(&self, pools: Vec<Arc<EndpointPool>>) -> Vec<Arc<EndpointPool>> {
        let scored: Vec<(u32, Arc<EndpointPool>)> = pools
            .into_iter()
            .map(|pool| (self.score(&pool.endpoint()), pool))
            .collect();

        let capacity = scored
            .iter()
            .map(|(score, _)| slot_count(*score, self.baseline_slots))
            .sum();
        let mut selectable = Vec::with_capacity(capacity);

        // Interleave threshold by threshold so consecutive picks spread out
        let mut threshold = MAX_SCORE;
        while threshold >= SCORE_STEP {
            for (score, pool) in &scored {
                if *score >= threshold {
                    selectable.push(Arc::clone(pool));
                }
            }
            threshold -= SCORE_STEP;
        }
        for _ in 0..self.baseline_slots {
            selectable.extend(scored.iter().map(|(_, pool)| Arc::clone(pool)));
        }

        selectable
    }

    fn select<'a>(
        &self,
        _request: &RequestMessage,
        selectable: &'a [Arc<EndpointPool>],
    ) -> Option<&'a Arc<EndpointPool>> {
        next_slot(&self.counter, selectable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pool_for;
    use std::collections::HashMap;

    fn slots_by_address(selectable: &[Arc<EndpointPool>]) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for pool in selectable {
            *counts.entry(pool.address()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_favorability_score() {
        assert_eq!(favorability_score(0.0), 100);
        assert_eq!(favorability_score(1.0), 0);
        assert_eq!(favorability_score(2.5), 10);
        assert_eq!(favorability_score(1e9), 100);
        assert_eq!(favorability_score(0.5), 6);
        assert_eq!(favorability_score(0.1), 23);
        assert_eq!(favorability_score(0.0001), 92);
        assert_eq!(favorability_score(1e-9), 100);
        assert_eq!(favorability_score(f64::NAN), 0);
    }

    #[test]
    fn test_unloaded_endpoints_get_equal_slots() {
        let strategy = LoadWeighted::default();
        let pools = vec![
            pool_for(Endpoint::new("a:1").with_metric(metrics::QUEUE_DEPTH, 0.0)),
            pool_for(Endpoint::new("b:1").with_metric(metrics::QUEUE_DEPTH, 0.0)),
            pool_for(Endpoint::new("c:1")),
        ];

        let counts = slots_by_address(&strategy.init(pools));
        let expected = slot_count(MAX_SCORE, DEFAULT_BASELINE_SLOTS);

        assert_eq!(expected, 21);
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|count| *count == expected));
    }

    #[test]
    fn test_loaded_endpoints_get_fewer_slots() {
        let strategy = LoadWeighted::new(LoadMetric::CpuUtilization);
        let pools = vec![
            pool_for(Endpoint::new("idle:1").with_metric(metrics::CPU_UTILIZATION, 10.0)),
            pool_for(Endpoint::new("busy:1").with_metric(metrics::CPU_UTILIZATION, 100.0)),
            pool_for(Endpoint::new("unknown:1")),
        ];

        let counts = slots_by_address(&strategy.init(pools));

        // 10% scores 23, a missing reading is treated as 50% and scores 6
        assert_eq!(counts["idle:1"], 4 + 1);
        assert_eq!(counts["unknown:1"], 1 + 1);
        assert_eq!(counts["busy:1"], 1);
    }

    #[test]
    fn test_overloaded_queue_keeps_threshold_slots() {
        let strategy = LoadWeighted::default();
        let pools = vec![pool_for(
            Endpoint::new("busy:1").with_metric(metrics::QUEUE_DEPTH, 20480.0),
        )];

        assert_eq!(strategy.score(&pools[0].endpoint()), 10);
        let counts = slots_by_address(&strategy.init(pools));
        assert_eq!(counts["busy:1"], 3);
    }

    #[test]
    fn test_every_endpoint_keeps_a_baseline_slot() {
        let strategy = LoadWeighted::with_baseline(LoadMetric::default(), 2);
        let pools = vec![pool_for(
            Endpoint::new("a:1").with_metric(metrics::QUEUE_DEPTH, DEFAULT_QUEUE_CAPACITY * 2.0),
        )];

        assert_eq!(strategy.init(pools).len(), 2);
    }

    #[test]
    fn test_select_walks_slots() {
        let strategy = LoadWeighted::default();
        let selectable = strategy.init(vec![pool_for(Endpoint::new("a:1"))]);
        let request = RequestMessage::new("g.V()");

        for _ in 0..50 {
            assert_eq!(strategy.select(&request, &selectable).unwrap().address(), "a:1");
        }
        assert!(strategy.select(&request, &[]).is_none());
    }
}
