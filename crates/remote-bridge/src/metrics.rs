use lazy_static::lazy_static;
use prometheus::{
    core::Collector, histogram_opts, opts, Histogram, IntCounter, IntCounterVec, IntGauge,
    Registry,
};
use tracing::error;

lazy_static! {
    static ref BRIDGE_CONNECTIONS_LIVE: IntGauge =
        IntGauge::new("soul_bridge_connections_live", "Live tenant connections").unwrap();
    static ref BRIDGE_PENDING_REQUESTS: IntGauge = IntGauge::new(
        "soul_bridge_pending_requests",
        "Commands awaiting a reply"
    )
    .unwrap();
    static ref BRIDGE_COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "soul_bridge_commands_total",
            "Commands finished grouped by terminal status"
        ),
        &["status"]
    )
    .unwrap();
    static ref BRIDGE_COMMAND_LATENCY: Histogram = Histogram::with_opts(histogram_opts!(
        "soul_bridge_command_latency_seconds",
        "Time from dispatch to terminal outcome",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ))
    .unwrap();
    static ref BRIDGE_PROTOCOL_ERRORS: IntCounter = IntCounter::new(
        "soul_bridge_protocol_errors_total",
        "Inbound frames dropped as unparseable or unexpected"
    )
    .unwrap();
    static ref BRIDGE_SUPERSESSIONS: IntCounter = IntCounter::new(
        "soul_bridge_supersessions_total",
        "Connections replaced by a newer connection for the same tenant"
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register bridge metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, BRIDGE_CONNECTIONS_LIVE.clone());
    register(registry, BRIDGE_PENDING_REQUESTS.clone());
    register(registry, BRIDGE_COMMANDS_TOTAL.clone());
    register(registry, BRIDGE_COMMAND_LATENCY.clone());
    register(registry, BRIDGE_PROTOCOL_ERRORS.clone());
    register(registry, BRIDGE_SUPERSESSIONS.clone());
}

pub fn set_live_connections(count: usize) {
    BRIDGE_CONNECTIONS_LIVE.set(count as i64);
}

pub fn set_pending_requests(count: usize) {
    BRIDGE_PENDING_REQUESTS.set(count as i64);
}

pub fn record_command(status: &str, elapsed_secs: f64) {
    BRIDGE_COMMANDS_TOTAL.with_label_values(&[status]).inc();
    BRIDGE_COMMAND_LATENCY.observe(elapsed_secs);
}

pub fn record_protocol_error() {
    BRIDGE_PROTOCOL_ERRORS.inc();
}

pub fn record_supersession() {
    BRIDGE_SUPERSESSIONS.inc();
}
