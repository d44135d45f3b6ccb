use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    executed: Family<ActionLabels, Counter>,
    failed: Family<ActionLabels, Counter>,
    retried: Family<ActionLabels, Counter>,
    dropped: Family<ActionLabels, Counter>,
    skipped: Counter,
    queue_depth: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct ActionLabels {
    kind: String,
    op: String,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let executed = Family::default();
        prom.register(
            "executed",
            "Count of actions applied to the cluster",
            executed.clone(),
        );

        let failed = Family::default();
        prom.register(
            "failed",
            "Count of action executions that failed",
            failed.clone(),
        );

        let retried = Family::default();
        prom.register(
            "retried",
            "Count of failed actions that were requeued",
            retried.clone(),
        );

        let dropped = Family::default();
        prom.register(
            "dropped",
            "Count of actions dropped after exhausting retries",
            dropped.clone(),
        );

        let skipped = Counter::default();
        prom.register(
            "skipped",
            "Count of actions skipped because this controller does not hold the write lease",
            skipped.clone(),
        );

        let queue_depth = Gauge::default();
        prom.register(
            "queue_depth",
            "Number of actions waiting to be executed",
            queue_depth.clone(),
        );

        Self {
            executed,
            failed,
            retried,
            dropped,
            skipped,
            queue_depth,
        }
    }

    pub(crate) fn executed(&self, labels: &ActionLabels) {
        self.executed.get_or_create(labels).inc();
    }

    pub(crate) fn failed(&self, labels: &ActionLabels) {
        self.failed.get_or_create(labels).inc();
    }

    pub(crate) fn retried(&self, labels: &ActionLabels) {
        self.retried.get_or_create(labels).inc();
    }

    pub(crate) fn dropped(&self, labels: &ActionLabels) {
        self.dropped.get_or_create(labels).inc();
    }

    pub(crate) fn skipped(&self) {
        self.skipped.inc();
    }

    pub(crate) fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }
}

impl ActionLabels {
    pub(crate) fn new(action: &crate::Action) -> Self {
        Self {
            kind: action.target().kind.clone(),
            op: action.op().to_string(),
        }
    }
}
