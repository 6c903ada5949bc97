/// Selection strategies
///
/// A strategy lays out the selectable list once per pool collection
/// (`init`) and then picks one entry per acquire attempt (`select`).
/// Strategies read endpoint metadata but never modify it.
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::pool::EndpointPool;
use crate::transport::RequestMessage;

pub mod weighted;

pub use weighted::{favorability_score, LoadMetric, LoadWeighted};

/// Selection strategy trait
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Arrange the pools of a new collection into the list `select` draws from
    fn init(&self, pools: Vec<Arc<EndpointPool>>) -> Vec<Arc<EndpointPool>>;

    /// Pick one entry of `selectable`, or `None` when it is empty
    fn select<'a>(
        &self,
        request: &RequestMessage,
        selectable: &'a [Arc<EndpointPool>],
    ) -> Option<&'a Arc<EndpointPool>>;
}

/// Cycles through the selectable list
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn init(&self, pools: Vec<Arc<EndpointPool>>) -> Vec<Arc<EndpointPool>> {
        pools
    }

    fn select<'a>(
        &self,
        _request: &RequestMessage,
        selectable: &'a [Arc<EndpointPool>],
    ) -> Option<&'a Arc<EndpointPool>> {
        next_slot(&self.counter, selectable)
    }
}

pub(crate) fn next_slot<'a>(
    counter: &AtomicUsize,
    selectable: &'a [Arc<EndpointPool>],
) -> Option<&'a Arc<EndpointPool>> {
    if selectable.is_empty() {
        return None;
    }
    let index = counter.fetch_add(1, Ordering::Relaxed) % selectable.len();
    selectable.get(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pools_for;

    #[test]
    fn test_round_robin_cycles_in_order() {
        let rr = RoundRobin::new();
        let selectable = rr.init(pools_for(&["a:1", "b:1", "c:1"]));
        let request = RequestMessage::new("g.V()");

        let picked: Vec<String> = (0..6)
            .map(|_| rr.select(&request, &selectable).unwrap().address())
            .collect();

        assert_eq!(picked, vec!["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);
    }

    #[test]
    fn test_round_robin_empty() {
        let rr = RoundRobin::new();
        let request = RequestMessage::new("g.V()");
        assert!(rr.select(&request, &[]).is_none());
    }
}
