//! Prometheus counters, registered on the default registry and exposed at GET /metrics

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    /// Admission attempts by outcome: leased, default, overflow, no_capacity
    pub static ref ADMISSIONS: IntCounterVec = register_int_counter_vec!(
        "xtreamhub_admissions_total",
        "Stream admission attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to register ADMISSIONS");

    /// Streams moved to a backup channel, by trigger
    pub static ref FAILOVERS: IntCounterVec = register_int_counter_vec!(
        "xtreamhub_failovers_total",
        "Streams served from a backup channel",
        &["reason"]
    )
    .expect("Failed to register FAILOVERS");

    /// Upstream catalog refreshes by result
    pub static ref UPSTREAM_REFRESHES: IntCounterVec = register_int_counter_vec!(
        "xtreamhub_upstream_refreshes_total",
        "Upstream catalog refreshes",
        &["result"]
    )
    .expect("Failed to register UPSTREAM_REFRESHES");

    pub static ref SWEPT_SESSIONS: IntCounter = register_int_counter!(
        "xtreamhub_swept_sessions_total",
        "Sessions removed for missing heartbeats"
    )
    .expect("Failed to register SWEPT_SESSIONS");
}
