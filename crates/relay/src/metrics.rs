use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use picsync_common::types::LeaveReason;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_messages_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    leaves_total: Mutex<HashMap<String, u64>>,
    rooms_active: AtomicI64,
    connections_active: AtomicI64,
    outbound_frames_dropped_total: AtomicU64,
    protocol_violations_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_messages_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            leaves_total: Mutex::new(HashMap::new()),
            rooms_active: AtomicI64::new(0),
            connections_active: AtomicI64::new(0),
            outbound_frames_dropped_total: AtomicU64::new(0),
            protocol_violations_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_message(kind: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_message(kind, is_error);
    }
}

pub fn record_leave(reason: LeaveReason) {
    if let Some(metrics) = global_metrics() {
        metrics.record_leave(reason);
    }
}

pub fn add_rooms_active(delta: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.rooms_active.fetch_add(delta, Ordering::SeqCst);
    }
}

pub fn add_connections_active(delta: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.connections_active.fetch_add(delta, Ordering::SeqCst);
    }
}

pub fn increment_outbound_frames_dropped() {
    if let Some(metrics) = global_metrics() {
        metrics.outbound_frames_dropped_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_protocol_violations() {
    if let Some(metrics) = global_metrics() {
        metrics.protocol_violations_total.fetch_add(1, Ordering::SeqCst);
    }
}

impl RelayMetrics {
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

    pub fn record_ws_message(&self, kind: &str, is_error: bool) {
        let normalized = normalize_label(kind);
        increment_label_counter(&self.ws_messages_total, &normalized, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &normalized, 1);
        }
    }

    pub fn record_leave(&self, reason: LeaveReason) {
        increment_label_counter(&self.leaves_total, reason.as_str(), 1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_messages_total Inbound websocket messages by type.\n");
        output.push_str("# TYPE relay_ws_messages_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_messages_total",
            "type",
            &self.ws_messages_total,
        );

        output.push_str(
            "# HELP relay_ws_errors_total Inbound websocket messages answered with an error.\n",
        );
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_errors_total",
            "type",
            &self.ws_errors_total,
        );

        output.push_str(
            "# HELP relay_room_leaves_total Participants removed from rooms by reason.\n",
        );
        output.push_str("# TYPE relay_room_leaves_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_room_leaves_total",
            "reason",
            &self.leaves_total,
        );

        output.push_str("# HELP relay_rooms_active Editing rooms currently open.\n");
        output.push_str("# TYPE relay_rooms_active gauge\n");
        output.push_str(&format!(
            "relay_rooms_active {}\n",
            self.rooms_active.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP relay_connections_active WebSocket connections currently open.\n");
        output.push_str("# TYPE relay_connections_active gauge\n");
        output.push_str(&format!(
            "relay_connections_active {}\n",
            self.connections_active.load(Ordering::SeqCst).max(0)
        ));

        output.push_str(
            "# HELP relay_outbound_frames_dropped_total Frames evicted from full queues.\n",
        );
        output.push_str("# TYPE relay_outbound_frames_dropped_total counter\n");
        output.push_str(&format!(
            "relay_outbound_frames_dropped_total {}\n",
            self.outbound_frames_dropped_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP relay_protocol_violations_total Malformed or misaddressed inbound frames.\n",
        );
        output.push_str("# TYPE relay_protocol_violations_total counter\n");
        output.push_str(&format!(
            "relay_protocol_violations_total {}\n",
            self.protocol_violations_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
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
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
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
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
