//! Prometheus metrics of the backend.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels of the per-endpoint request counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    /// The endpoint that was hit.
    pub target: String,
}

/// Labels of the resource state gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    /// The resource type.
    pub rtype: String,
    /// The reachability state.
    pub functional: String,
    /// The bandwidth state.
    pub ratio: String,
    /// Whether the bridge authority saw the bridge running.
    pub running: String,
}

/// Labels of the per-distributor resource gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DistributorLabels {
    /// The distributor owning the partition.
    pub distributor: String,
    /// The resource type.
    pub rtype: String,
}

/// The backend's metrics, exposed in Prometheus text exposition format
/// on the metrics endpoint.
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,

    /// The number of API requests by endpoint.
    pub requests: Family<EndpointLabels, Counter>,

    /// The number of resources we have by their type, functionality,
    /// ratio and running state.
    pub resources: Family<ResourceLabels, Gauge>,

    /// The number of working resources we have per distributor.
    pub distributor_resources: Family<DistributorLabels, Gauge>,

    /// Whether rdsys is distributing non functional bridges.
    pub distributing_non_functional: Gauge,

    /// Whether rdsys is ignoring the resource bandwidth ratio.
    pub ignoring_bandwidth_ratio: Gauge,

    /// Diffs dropped because a subscriber was not consuming them.
    pub dropped_diffs: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Initialise our Prometheus metrics.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("rdsys_backend");

        let requests = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "requests",
            "The number of API requests",
            requests.clone(),
        );

        let resources = Family::<ResourceLabels, Gauge>::default();
        registry.register(
            "resources",
            "The number of resources we have by their type, \
             functionality, ratio and running state",
            resources.clone(),
        );

        let distributor_resources =
            Family::<DistributorLabels, Gauge>::default();
        registry.register(
            "distributor_resources",
            "The number of resources we have per distributor",
            distributor_resources.clone(),
        );

        let distributing_non_functional = Gauge::default();
        registry.register(
            "distributing_non_functional_resources",
            "If rdsys is distributing non functional bridges",
            distributing_non_functional.clone(),
        );

        let ignoring_bandwidth_ratio = Gauge::default();
        registry.register(
            "ignoring_resource_bandwidth_ratio",
            "If rdsys is ignoring the resource bandwidth ratio",
            ignoring_bandwidth_ratio.clone(),
        );

        let dropped_diffs = Gauge::default();
        registry.register(
            "dropped_diffs",
            "The number of resource diffs dropped on backed-up \
             subscriber channels",
            dropped_diffs.clone(),
        );

        Self {
            registry,
            requests,
            resources,
            distributor_resources,
            distributing_non_functional,
            ignoring_bandwidth_ratio,
            dropped_diffs,
        }
    }

    /// Count a request against the given endpoint.
    pub fn inc_request(&self, target: &str) {
        self.requests
            .get_or_create(&EndpointLabels {
                target: target.to_string(),
            })
            .inc();
    }

    /// Render the registry in text exposition format.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        encode(&mut out, &self.registry)
            .expect("metrics encoding is infallible");
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_carries_prefix_and_counts() {
        let metrics = Metrics::new();
        metrics.inc_request("/resources");
        metrics.inc_request("/resources");
        metrics.distributing_non_functional.set(1);

        let out = metrics.encode();
        assert!(out.contains(
            "rdsys_backend_requests_total{target=\"/resources\"} 2"
        ));
        assert!(out
            .contains("rdsys_backend_distributing_non_functional_resources 1"));
    }
}
