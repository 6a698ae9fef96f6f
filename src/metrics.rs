//! Prometheus metric handles, compiled in only behind the `metrics`
//! feature. The dashboard/scrape surface is out of scope here; this
//! module just keeps the gauges/counters themselves up to date so a
//! deployment can wire its own `/metrics` exporter against the registry.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::LazyLock;

static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

pub struct Metrics {
    pub registry: Registry,

    /// Queued-but-not-yet-processing messages per conversation.
    pub conversation_queue_depth: IntGaugeVec,

    /// Circuit breaker state per breaker name (0 = closed, 1 = open,
    /// 2 = half-open).
    pub breaker_state: IntGaugeVec,

    /// Approval requests currently awaiting a human response.
    pub hitl_pending: IntGauge,

    /// Tool calls dispatched, labeled by tool name and outcome.
    pub tool_calls_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let conversation_queue_depth = IntGaugeVec::new(
            Opts::new(
                "loop_gateway_conversation_queue_depth",
                "Queued messages per conversation awaiting a turn",
            ),
            &["conversation_id"],
        )
        .expect("hardcoded metric descriptor");

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "loop_gateway_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            ),
            &["breaker"],
        )
        .expect("hardcoded metric descriptor");

        let hitl_pending = IntGauge::new(
            "loop_gateway_hitl_pending",
            "Approval requests currently awaiting a human response",
        )
        .expect("hardcoded metric descriptor");

        let tool_calls_total = IntCounterVec::new(
            Opts::new("loop_gateway_tool_calls_total", "Total tool calls dispatched"),
            &["tool_name", "outcome"],
        )
        .expect("hardcoded metric descriptor");

        registry
            .register(Box::new(conversation_queue_depth.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(breaker_state.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(hitl_pending.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(tool_calls_total.clone()))
            .expect("hardcoded metric");

        Self {
            registry,
            conversation_queue_depth,
            breaker_state,
            hitl_pending,
            tool_calls_total,
        }
    }

    pub fn global() -> &'static Self {
        &METRICS
    }
}
