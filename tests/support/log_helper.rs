use logcost::{LogCostTracker, Severity};

#[inline(never)]
pub fn log_order(tracker: &LogCostTracker, order: u32) {
    tracker.track_call(Severity::Info, "order {} submitted", &[&order]);
}

#[inline(never)]
pub fn emit_order(order: u32) {
    tracing::info!(order, "order submitted");
}
