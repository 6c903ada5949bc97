/// Endpoint filters
///
/// A filter first enriches a candidate endpoint (annotating it or attaching
/// metrics) and then decides whether it may be pooled. Every client runs its
/// user filter behind the baseline [`EmptyAddressFilter`].
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::core::{annotations, Endpoint, STATUS_AVAILABLE};

/// Outcome of a filter decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Accepted,
    Rejected { reason: String },
}

impl Approval {
    pub fn rejected<S: Into<String>>(reason: S) -> Self {
        Approval::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Approval::Accepted)
    }
}

impl fmt::Display for Approval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Approval::Accepted => write!(f, "Accepted"),
            Approval::Rejected { reason } => write!(f, "Rejected: {}", reason),
        }
    }
}

/// Endpoint filter trait
pub trait EndpointFilter: Send + Sync {
    /// Annotate or attach metrics to an endpoint before it is judged
    fn enrich(&self, endpoint: Endpoint) -> Endpoint {
        endpoint
    }

    /// Decide whether the (enriched) endpoint may be pooled
    fn approve(&self, endpoint: &Endpoint) -> Approval;
}

impl<F: EndpointFilter + ?Sized> EndpointFilter for Arc<F> {
    fn enrich(&self, endpoint: Endpoint) -> Endpoint {
        (**self).enrich(endpoint)
    }

    fn approve(&self, endpoint: &Endpoint) -> Approval {
        (**self).approve(endpoint)
    }
}

/// Rejects endpoints with a blank address
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyAddressFilter;

impl EndpointFilter for EmptyAddressFilter {
    fn approve(&self, endpoint: &Endpoint) -> Approval {
        if endpoint.is_blank() {
            Approval::rejected("empty address")
        } else {
            Approval::Accepted
        }
    }
}

/// Rejects endpoints whose `status` annotation says they cannot serve
/// traffic. Endpoints without a status (cluster-level addresses) pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableStatusFilter;

impl EndpointFilter for UnavailableStatusFilter {
    fn approve(&self, endpoint: &Endpoint) -> Approval {
        match endpoint.annotation(annotations::STATUS) {
            Some(status) if !status.eq_ignore_ascii_case(STATUS_AVAILABLE) => {
                Approval::rejected(format!("status {}", status))
            }
            _ => Approval::Accepted,
        }
    }
}

/// Operator-controlled list of suspended addresses.
///
/// `enrich` marks listed endpoints with `state=suspended`; `approve` rejects
/// any endpoint carrying that marker, including ones the topology service
/// already annotated.
#[derive(Debug, Default)]
pub struct SuspendedEndpoints {
    addresses: RwLock<HashSet<String>>,
}

impl SuspendedEndpoints {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: RwLock::new(addresses.into_iter().map(Into::into).collect()),
        }
    }

    pub fn suspend<S: Into<String>>(&self, address: S) {
        self.addresses.write().insert(address.into());
    }

    pub fn resume(&self, address: &str) -> bool {
        self.addresses.write().remove(address)
    }

    pub fn is_suspended(&self, address: &str) -> bool {
        self.addresses.read().contains(address)
    }
}

impl EndpointFilter for SuspendedEndpoints {
    fn enrich(&self, mut endpoint: Endpoint) -> Endpoint {
        if self.is_suspended(endpoint.address()) {
            endpoint.annotate(annotations::STATE, annotations::SUSPENDED);
        }
        endpoint
    }

    fn approve(&self, endpoint: &Endpoint) -> Approval {
        if endpoint.is_suspended() {
            Approval::rejected("suspended")
        } else {
            Approval::Accepted
        }
    }
}

/// Runs filters in order: every filter enriches, the first rejection wins
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn EndpointFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The baseline empty-address filter followed by an optional user filter
    pub fn baseline(user_filter: Option<Arc<dyn EndpointFilter>>) -> Self {
        let chain = FilterChain::new().with(EmptyAddressFilter);
        match user_filter {
            Some(filter) => chain.with_shared(filter),
            None => chain,
        }
    }

    pub fn with<F: EndpointFilter + 'static>(self, filter: F) -> Self {
        self.with_shared(Arc::new(filter))
    }

    pub fn with_shared(mut self, filter: Arc<dyn EndpointFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl EndpointFilter for FilterChain {
    fn enrich(&self, endpoint: Endpoint) -> Endpoint {
        self.filters
            .iter()
            .fold(endpoint, |endpoint, filter| filter.enrich(endpoint))
    }

    fn approve(&self, endpoint: &Endpoint) -> Approval {
        for filter in &self.filters {
            let approval = filter.approve(endpoint);
            if !approval.is_accepted() {
                return approval;
            }
        }
        Approval::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_display() {
        assert_eq!(Approval::Accepted.to_string(), "Accepted");
        assert_eq!(
            Approval::rejected("suspended").to_string(),
            "Rejected: suspended"
        );
    }

    #[test]
    fn test_empty_address_filter() {
        assert!(EmptyAddressFilter.approve(&Endpoint::new("db:8182")).is_accepted());
        assert_eq!(
            EmptyAddressFilter.approve(&Endpoint::new("")),
            Approval::rejected("empty address")
        );
    }

    #[test]
    fn test_unavailable_status_filter() {
        let cluster = Endpoint::new("cluster:8182");
        let available = Endpoint::new("a:8182").with_annotation(annotations::STATUS, "available");
        let stopped = Endpoint::new("b:8182").with_annotation(annotations::STATUS, "stopped");

        assert!(UnavailableStatusFilter.approve(&cluster).is_accepted());
        assert!(UnavailableStatusFilter.approve(&available).is_accepted());
        assert_eq!(
            UnavailableStatusFilter.approve(&stopped),
            Approval::rejected("status stopped")
        );
    }

    #[test]
    fn test_suspended_endpoints_enrich_then_reject() {
        let suspended = SuspendedEndpoints::new(["a:8182"]);

        let enriched = suspended.enrich(Endpoint::new("a:8182"));
        assert!(enriched.is_suspended());
        assert_eq!(suspended.approve(&enriched), Approval::rejected("suspended"));

        let untouched = suspended.enrich(Endpoint::new("b:8182"));
        assert!(!untouched.is_suspended());
        assert!(suspended.approve(&untouched).is_accepted());

        assert!(suspended.resume("a:8182"));
        let resumed = suspended.enrich(Endpoint::new("a:8182"));
        assert!(suspended.approve(&resumed).is_accepted());
    }

    #[test]
    fn test_chain_first_rejection_wins() {
        let chain = FilterChain::baseline(Some(Arc::new(SuspendedEndpoints::new([""]))));
        assert_eq!(chain.len(), 2);

        let endpoint = chain.enrich(Endpoint::new(""));
        assert_eq!(chain.approve(&endpoint), Approval::rejected("empty address"));
    }
}
