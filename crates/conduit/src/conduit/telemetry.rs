use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// Call once per process. Without a recorder every `metrics::*!` macro is a no-op,
/// which is what tests rely on.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;

    metrics::describe_counter!("conduit_sessions_total", "Tunnel sessions accepted");
    metrics::describe_gauge!("conduit_active_sessions", "Tunnel sessions currently open");
    metrics::describe_counter!(
        "conduit_handshake_failures_total",
        "Sessions closed before a valid header was received"
    );
    metrics::describe_counter!("conduit_dial_failures_total", "Destination dials that failed");
    metrics::describe_counter!(
        "conduit_bytes_upstream_total",
        "Bytes relayed from clients to destinations"
    );
    metrics::describe_counter!(
        "conduit_bytes_downstream_total",
        "Bytes relayed from destinations to clients"
    );

    Ok(handle)
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

/// Counts a session as active for as long as the guard lives.
pub struct ActiveSessionGuard;

impl ActiveSessionGuard {
    pub fn new() -> Self {
        metrics::counter!("conduit_sessions_total").increment(1);
        metrics::gauge!("conduit_active_sessions").increment(1.0);
        Self
    }
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        metrics::gauge!("conduit_active_sessions").decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with('s'));
    }
}
