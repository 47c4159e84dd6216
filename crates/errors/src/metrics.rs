use metrics::{
    log_counter,
    register_sync_counter,
};

register_sync_counter!(
    ERRORS_REPORTED_TOTAL,
    "Number of errors reported at a swallowing boundary"
);
pub fn log_errors_reported_total() {
    log_counter(&ERRORS_REPORTED_TOTAL, 1);
}
