use chrono::{DateTime, Utc};
use kube::runtime::events::{Recorder, Reporter};
use kube::{Client, ResourceExt};
use prometheus::{
    histogram_opts, opts, Histogram, HistogramTimer, IntCounter, IntCounterVec, Registry,
};
use serde::Serialize;

use crate::api::kops_cluster::KopsCluster;
use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconciliations = IntCounter::with_opts(opts!(
            "kops_operator_reconciliations_total",
            "Total reconciliation passes"
        ))
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "kops_operator_reconcile_failures_total",
                "Failed reconciliation passes"
            ),
            &["cluster", "error"],
        )
        .unwrap();
        let reconcile_duration = Histogram::with_opts(histogram_opts!(
            "kops_operator_reconcile_duration_seconds",
            "Duration of reconciliation passes",
            vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0]
        ))
        .unwrap();
        Self {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        Ok(self)
    }

    pub fn count_and_measure(&self) -> HistogramTimer {
        self.reconciliations.inc();
        self.reconcile_duration.start_timer()
    }

    pub fn reconcile_failure(&self, cluster: &KopsCluster, error: &Error) {
        self.failures
            .with_label_values(&[cluster.name_any().as_ref(), error.metric_label()])
            .inc()
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "kops-operator".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}
