//! Prometheus metrics for peer sessions.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

use crate::bgp::SessionState;

/// Registry shared by every session in the process.
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// BGP session state gauge (1 if in state, 0 otherwise).
static SESSION_STATE: OnceLock<IntGaugeVec> = OnceLock::new();

/// BGP messages sent.
static MESSAGES_SENT: OnceLock<IntCounterVec> = OnceLock::new();

/// BGP messages received.
static MESSAGES_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Routes received from peers, by event kind.
static ROUTES_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscriptions changed because of RTC routes.
static RTC_SUBSCRIPTIONS: OnceLock<IntCounterVec> = OnceLock::new();

/// Outbound messages that could not be encoded or written.
static SEND_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("metric creation");
    registry.register(Box::new(counter.clone())).ok(); // Ignore if already registered
    counter
}

/// Register the session metrics. Calling it again is a no-op.
pub fn init() {
    let registry = REGISTRY.get_or_init(Registry::new);

    SESSION_STATE.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("bgp_session_state", "BGP session state (1 if active)"),
            &["peer", "state"],
        )
        .expect("metric creation");
        registry.register(Box::new(gauge.clone())).ok();
        gauge
    });
    MESSAGES_SENT.get_or_init(|| {
        counter_vec(registry, "bgp_messages_sent_total", "BGP messages sent", &["peer", "type"])
    });
    MESSAGES_RECEIVED.get_or_init(|| {
        counter_vec(
            registry,
            "bgp_messages_received_total",
            "BGP messages received",
            &["peer", "type"],
        )
    });
    ROUTES_RECEIVED.get_or_init(|| {
        counter_vec(
            registry,
            "bgp_routes_received_total",
            "Routes received from peers",
            &["peer", "family", "kind"],
        )
    });
    RTC_SUBSCRIPTIONS.get_or_init(|| {
        counter_vec(
            registry,
            "bgp_rtc_subscription_changes_total",
            "Subscriptions changed by RTC routes",
            &["peer", "family", "kind"],
        )
    });
    SEND_FAILURES.get_or_init(|| {
        counter_vec(
            registry,
            "bgp_send_failures_total",
            "Outbound messages dropped on encode or write failure",
            &["peer", "stage"],
        )
    });
}

/// Record the current state of a session.
pub fn record_session_state(peer: &str, state: SessionState) {
    if let Some(gauge) = SESSION_STATE.get() {
        for s in SessionState::ALL {
            gauge.with_label_values(&[peer, s.as_str()]).set(0);
        }
        gauge.with_label_values(&[peer, state.as_str()]).set(1);
    }
}

/// Record a message sent.
pub fn record_message_sent(peer: &str, msg_type: &str) {
    if let Some(counter) = MESSAGES_SENT.get() {
        counter.with_label_values(&[peer, msg_type]).inc();
    }
}

/// Record a message received.
pub fn record_message_received(peer: &str, msg_type: &str) {
    if let Some(counter) = MESSAGES_RECEIVED.get() {
        counter.with_label_values(&[peer, msg_type]).inc();
    }
}

/// Record a route received from a peer.
pub fn record_route_received(peer: &str, family: &str, kind: &str) {
    if let Some(counter) = ROUTES_RECEIVED.get() {
        counter.with_label_values(&[peer, family, kind]).inc();
    }
}

/// Record a subscribe/unsubscribe triggered by an RTC route.
pub fn record_rtc_subscription(peer: &str, family: &str, kind: &str) {
    if let Some(counter) = RTC_SUBSCRIPTIONS.get() {
        counter.with_label_values(&[peer, family, kind]).inc();
    }
}

/// Record an outbound message that was dropped. `stage` is `encode` or `write`.
pub fn record_send_failure(peer: &str, stage: &str) {
    if let Some(counter) = SEND_FAILURES.get() {
        counter.with_label_values(&[peer, stage]).inc();
    }
}

/// Gather and encode all metrics in Prometheus text format.
pub fn gather() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .unwrap_or_default()
}
