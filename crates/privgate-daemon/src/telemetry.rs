use parking_lot::Mutex;
use privgate_core::mediation::EventSink;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Debug, Default)]
struct TelemetryState {
    queries_total: u64,
    rejects_total: HashMap<String, u64>,
    budget_low_total: HashMap<String, u64>,
    policy_violations_total: HashMap<String, u64>,
    datasets_encrypted_total: u64,
    computes_total: u64,
    anonymize_total: u64,
    budget_remaining: HashMap<String, f64>,
}

/// Counter registry shared across request handlers and the sweeps. Also
/// the engine's outbound event sink, so `budget_low` and
/// `policy_violation` surface both as counters and as tracing events.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    state: Arc<Mutex<TelemetryState>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.state.lock().queries_total += 1;
    }

    pub fn record_reject(&self, reason: &str) {
        let mut guard = self.state.lock();
        let entry = guard.rejects_total.entry(reason.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_dataset_encrypted(&self) {
        self.state.lock().datasets_encrypted_total += 1;
    }

    pub fn record_compute(&self) {
        self.state.lock().computes_total += 1;
    }

    pub fn record_anonymize(&self) {
        self.state.lock().anonymize_total += 1;
    }

    pub fn rejects_for(&self, reason: &str) -> u64 {
        self.state
            .lock()
            .rejects_total
            .get(reason)
            .copied()
            .unwrap_or(0)
    }

    pub fn render_prometheus(&self) -> String {
        let guard = self.state.lock();
        let mut out = String::new();
        let _ = writeln!(out, "privgate_queries_total {}", guard.queries_total);
        let _ = writeln!(
            out,
            "privgate_datasets_encrypted_total {}",
            guard.datasets_encrypted_total
        );
        let _ = writeln!(out, "privgate_computes_total {}", guard.computes_total);
        let _ = writeln!(out, "privgate_anonymize_total {}", guard.anonymize_total);
        for (reason, count) in &guard.rejects_total {
            let _ = writeln!(
                out,
                "privgate_rejects_total{{reason=\"{reason}\"}} {count}"
            );
        }
        for (source, count) in &guard.budget_low_total {
            let _ = writeln!(
                out,
                "privgate_budget_low_total{{data_source=\"{source}\"}} {count}"
            );
        }
        for (kind, count) in &guard.policy_violations_total {
            let _ = writeln!(
                out,
                "privgate_policy_violations_total{{kind=\"{kind}\"}} {count}"
            );
        }
        for (source, remaining) in &guard.budget_remaining {
            let _ = writeln!(
                out,
                "privgate_budget_remaining{{data_source=\"{source}\"}} {remaining}"
            );
        }
        out
    }
}

impl EventSink for Telemetry {
    fn budget_low(&self, data_source_id: &str, remaining: f64, allowance: f64) {
        tracing::warn!(
            target: "privgate.events",
            data_source_id,
            remaining,
            allowance,
            "privacy budget running low"
        );
        let mut guard = self.state.lock();
        let entry = guard
            .budget_low_total
            .entry(data_source_id.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
        guard
            .budget_remaining
            .insert(data_source_id.to_string(), remaining);
    }

    fn policy_violation(&self, kind: &str, details: &str) {
        tracing::warn!(
            target: "privgate.events",
            kind,
            details,
            "policy violation"
        );
        let mut guard = self.state.lock();
        let entry = guard
            .policy_violations_total
            .entry(kind.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_render() {
        let telemetry = Telemetry::new();
        telemetry.record_query();
        telemetry.record_query();
        telemetry.record_reject("insufficient_budget");
        telemetry.budget_low("src1", 0.5, 10.0);
        telemetry.policy_violation("technique_not_permitted", "noise on telemetry");

        assert_eq!(telemetry.rejects_for("insufficient_budget"), 1);
        let rendered = telemetry.render_prometheus();
        assert!(rendered.contains("privgate_queries_total 2"));
        assert!(rendered.contains("privgate_rejects_total{reason=\"insufficient_budget\"} 1"));
        assert!(rendered.contains("privgate_budget_low_total{data_source=\"src1\"} 1"));
        assert!(rendered
            .contains("privgate_policy_violations_total{kind=\"technique_not_permitted\"} 1"));
    }
}
