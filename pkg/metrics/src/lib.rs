use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};

/// A lightweight, thread-safe metrics registry that renders in Prometheus text exposition format.
///
/// Every metric is a family of series distinguished by their labels.
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Family>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    /// Monotonically increasing
    Counter,
    /// Can go up or down
    Gauge,
}

struct Family {
    kind: MetricKind,
    help: String,
    /// keyed by the rendered label set, e.g. `controller="policy"`
    series: BTreeMap<String, AtomicI64>,
}

fn render_labels(labels: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        self.register(name, help, MetricKind::Counter);
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        self.register(name, help, MetricKind::Gauge);
    }

    fn register(&self, name: &str, help: &str, kind: MetricKind) {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        families.entry(name.to_string()).or_insert_with(|| Family {
            kind,
            help: help.to_string(),
            series: BTreeMap::new(),
        });
    }

    /// Add `delta` to a series, creating it on first use. Unregistered names are ignored.
    fn add(&self, name: &str, labels: &[(&str, &str)], delta: i64, expected: MetricKind) {
        let key = render_labels(labels);
        {
            let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
            match families.get(name) {
                Some(f) if f.kind != expected => return,
                Some(f) => {
                    if let Some(v) = f.series.get(&key) {
                        v.fetch_add(delta, Ordering::Relaxed);
                        return;
                    }
                }
                None => return,
            }
        }
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(f) = families.get_mut(name) {
            f.series
                .entry(key)
                .or_insert_with(|| AtomicI64::new(0))
                .fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(name, labels, 1, MetricKind::Counter);
    }

    /// Increment a counter by a given amount.
    pub fn counter_add(&self, name: &str, labels: &[(&str, &str)], val: u64) {
        self.add(name, labels, i64::try_from(val).unwrap_or(i64::MAX), MetricKind::Counter);
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(name, labels, 1, MetricKind::Gauge);
    }

    pub fn gauge_dec(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(name, labels, -1, MetricKind::Gauge);
    }

    /// Current value of a series, if it has been touched.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        families
            .get(name)?
            .series
            .get(&render_labels(labels))
            .map(|v| v.load(Ordering::Relaxed))
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        for (name, family) in families.iter() {
            let kind = match family.kind {
                MetricKind::Counter => "counter",
                MetricKind::Gauge => "gauge",
            };
            output.push_str(&format!("# HELP {} {}\n", name, family.help));
            output.push_str(&format!("# TYPE {} {}\n", name, kind));
            for (labels, value) in family.series.iter() {
                let value = value.load(Ordering::Relaxed);
                if labels.is_empty() {
                    output.push_str(&format!("{} {}\n", name, value));
                } else {
                    output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
                }
            }
        }
        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_counters_are_independent() {
        let m = MetricsRegistry::new();
        m.register_counter("reconcile_total", "Reconcile passes");
        m.counter_inc("reconcile_total", &[("controller", "policy")]);
        m.counter_inc("reconcile_total", &[("controller", "policy")]);
        m.counter_add("reconcile_total", &[("controller", "role")], 5);

        assert_eq!(m.value("reconcile_total", &[("controller", "policy")]), Some(2));
        assert_eq!(m.value("reconcile_total", &[("controller", "role")]), Some(5));
        assert_eq!(m.value("reconcile_total", &[("controller", "irsa")]), None);
    }

    #[test]
    fn unregistered_or_mismatched_metrics_are_ignored() {
        let m = MetricsRegistry::new();
        m.counter_inc("missing", &[]);
        assert_eq!(m.value("missing", &[]), None);

        m.register_gauge("in_flight", "Passes running");
        m.counter_inc("in_flight", &[]);
        assert_eq!(m.value("in_flight", &[]), None);
        m.gauge_inc("in_flight", &[]);
        m.gauge_inc("in_flight", &[]);
        m.gauge_dec("in_flight", &[]);
        assert_eq!(m.value("in_flight", &[]), Some(1));
    }

    #[test]
    fn render_prometheus_text() {
        let m = MetricsRegistry::new();
        m.register_counter("errors_total", "Errors");
        m.register_gauge("in_flight", "In flight");
        m.counter_inc("errors_total", &[("controller", "role"), ("a", "b")]);
        m.gauge_inc("in_flight", &[]);

        let text = m.render();
        assert!(text.contains("# TYPE errors_total counter\n"));
        assert!(text.contains("errors_total{a=\"b\",controller=\"role\"} 1\n"));
        assert!(text.contains("# TYPE in_flight gauge\n"));
        assert!(text.contains("in_flight 1\n"));
    }
}
