use tracing::trace;

// Counters are trace events; the Prometheus recorder only backs /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(target = "intake.metrics", route = route, "requests_total_inc");
}

pub fn inc_events(kind: &'static str) {
    trace!(target = "intake.metrics", kind = kind, "webhook_events_total_inc");
}

pub fn upload_finished(state: &'static str) {
    trace!(target = "intake.metrics", state = state, "uploads_finished_total_inc");
}

pub fn step_elapsed(step: &'static str, elapsed_ms: u64) {
    trace!(
        target = "intake.metrics",
        step = step,
        elapsed_ms = elapsed_ms,
        "step_elapsed"
    );
}
