use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Point-in-time gauges sampled by the caller at render time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GaugeSnapshot {
    pub connections: usize,
    pub users: usize,
    pub resources: usize,
}

#[derive(Default)]
pub struct GatewayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_events_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    auth_rejections_total: Mutex<HashMap<String, u64>>,
    connections_accepted_total: AtomicU64,
    capacity_rejections_total: AtomicU64,
    heartbeat_timeouts_total: AtomicU64,
}

impl GatewayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_event(&self, event: &str, is_error: bool) {
        let label = normalize_label(event);
        increment_label_counter(&self.ws_events_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn record_auth_rejection(&self, code: &str) {
        increment_label_counter(&self.auth_rejections_total, &normalize_label(code), 1);
    }

    pub fn increment_connections_accepted(&self) {
        self.connections_accepted_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_capacity_rejections(&self) {
        self.capacity_rejections_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_heartbeat_timeouts(&self) {
        self.heartbeat_timeouts_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self, gauges: GaugeSnapshot) -> String {
        let mut output = String::new();

        output.push_str("# HELP gateway_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE gateway_request_rate_total counter\n");
        append_counter_lines(&mut output, "gateway_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP gateway_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE gateway_request_errors_total counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str("# HELP gateway_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE gateway_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP gateway_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE gateway_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP gateway_ws_events_total Total websocket events by type.\n");
        output.push_str("# TYPE gateway_ws_events_total counter\n");
        append_label_counter_lines(&mut output, "gateway_ws_events_total", "event", &self.ws_events_total);

        output.push_str("# HELP gateway_ws_errors_total Total failed websocket events by type.\n");
        output.push_str("# TYPE gateway_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "gateway_ws_errors_total", "event", &self.ws_errors_total);

        output.push_str(
            "# HELP gateway_auth_rejections_total Rejected handshakes by error code.\n",
        );
        output.push_str("# TYPE gateway_auth_rejections_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_auth_rejections_total",
            "code",
            &self.auth_rejections_total,
        );

        append_scalar(
            &mut output,
            "gateway_connections_accepted_total",
            "Connections admitted into the pool.",
            "counter",
            self.connections_accepted_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "gateway_capacity_rejections_total",
            "Connections refused by the per-user limit.",
            "counter",
            self.capacity_rejections_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "gateway_heartbeat_timeouts_total",
            "Connections closed for missing heartbeats.",
            "counter",
            self.heartbeat_timeouts_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "gateway_connections",
            "Live connections.",
            "gauge",
            gauges.connections as u64,
        );
        append_scalar(
            &mut output,
            "gateway_connected_users",
            "Users with at least one live connection.",
            "gauge",
            gauges.users as u64,
        );
        append_scalar(
            &mut output,
            "gateway_active_resources",
            "Resources with at least one member.",
            "gauge",
            gauges.resources as u64,
        );

        output
    }
}

fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn normalize_endpoint(path: &str) -> String {
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if uuid::Uuid::parse_str(segment).is_ok() {
                "{uuid}"
            } else if segment.chars().all(|character| character.is_ascii_digit()) {
                "{number}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>();

    format!("/{}", segments.join("/"))
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_scalar(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {value}\n"));
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
