use tracing::trace;

// Trace-based counters; the Prometheus recorder only renders what is registered.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "wizard.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_transition(from: u8, to: u8) {
    trace!(
        target = "wizard.metrics",
        from = from,
        to = to,
        "stage_transition"
    );
}

pub fn upload_finished(field: &str, ok: bool, elapsed_ms: u128) {
    trace!(
        target = "wizard.metrics",
        field = field,
        ok = ok,
        elapsed_ms = elapsed_ms as u64,
        "upload_finished"
    );
}

pub fn collaborator_elapsed(call: &'static str, elapsed_ms: u128) {
    trace!(
        target = "wizard.metrics",
        call = call,
        elapsed_ms = elapsed_ms as u64,
        "collaborator_elapsed"
    );
}
