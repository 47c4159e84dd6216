use metrics::{
    log_counter,
    log_counter_with_labels,
    log_distribution,
    register_sync_counter,
    register_sync_gauge,
    register_sync_histogram,
    MetricLabel,
    StatusTimer,
    STATUS_LABEL,
};
use sync_types::ClientMessage;

register_sync_histogram!(
    SYNC_HANDLE_MESSAGE_SECONDS,
    "Time to handle one client message",
    &["status", "endpoint"]
);
pub fn handle_message_timer(message: &ClientMessage) -> StatusTimer {
    let mut timer = StatusTimer::new(&SYNC_HANDLE_MESSAGE_SECONDS);
    timer.add_label(MetricLabel::new("endpoint", message.tag()));
    timer
}

register_sync_histogram!(
    SYNC_ADVANCE_CYCLE_SECONDS,
    "Time for one advance cycle: pipelines, CVR flush, poke fan-out",
    &STATUS_LABEL
);
pub fn advance_cycle_timer() -> StatusTimer {
    StatusTimer::new(&SYNC_ADVANCE_CYCLE_SECONDS)
}

register_sync_counter!(SYNC_POKES_TOTAL, "Pokes sent to clients");
pub fn log_poke() {
    log_counter(&SYNC_POKES_TOTAL, 1);
}

register_sync_counter!(
    SYNC_SLOW_CONSUMER_TOTAL,
    "Clients disconnected for falling behind on their outbound queue"
);
pub fn log_slow_consumer() {
    log_counter(&SYNC_SLOW_CONSUMER_TOTAL, 1);
}

register_sync_counter!(
    SYNC_CVR_CONFLICT_TOTAL,
    "Optimistic CVR flush conflicts",
    &["outcome"]
);
pub fn log_cvr_conflict(retried: bool) {
    let outcome = if retried { "retried" } else { "fatal" };
    log_counter_with_labels(
        &SYNC_CVR_CONFLICT_TOTAL,
        1,
        vec![MetricLabel::new("outcome", outcome)],
    );
}

register_sync_counter!(
    SYNC_PIPELINE_RESET_TOTAL,
    "Pipeline resets triggered by the coordinator"
);
pub fn log_pipeline_reset() {
    log_counter(&SYNC_PIPELINE_RESET_TOTAL, 1);
}

register_sync_gauge!(SYNC_CONNECTED_CLIENTS, "Currently connected clients");
pub fn log_connected_clients(count: usize) {
    metrics::log_gauge(&SYNC_CONNECTED_CLIENTS, count as f64);
}

register_sync_histogram!(SYNC_QUERY_SET_TOTAL, "Size of the query set per CVR");
pub fn log_query_set_size(num_queries: usize) {
    log_distribution(&SYNC_QUERY_SET_TOTAL, num_queries as f64);
}

register_sync_counter!(
    SYNC_TRANSFORM_ERRORS_TOTAL,
    "Custom queries rejected by the resolver"
);
pub fn log_transform_error() {
    log_counter(&SYNC_TRANSFORM_ERRORS_TOTAL, 1);
}
