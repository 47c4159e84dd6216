use std::time::Duration;

use metrics::{
    log_counter,
    log_distribution,
    register_sync_counter,
    register_sync_histogram,
};

register_sync_histogram!(
    PIPELINE_HYDRATION_SECONDS,
    "Time to hydrate one query pipeline"
);
pub fn log_hydration(duration: Duration) {
    log_distribution(&PIPELINE_HYDRATION_SECONDS, duration.as_secs_f64());
}

register_sync_histogram!(
    PIPELINE_ADVANCE_SECONDS,
    "Time to push one change-log batch through all pipelines"
);
pub fn log_advance(duration: Duration) {
    log_distribution(&PIPELINE_ADVANCE_SECONDS, duration.as_secs_f64());
}

register_sync_counter!(
    PIPELINE_RESET_TOTAL,
    "Number of pipeline resets after bounded-advancement violations"
);
pub fn log_reset() {
    log_counter(&PIPELINE_RESET_TOTAL, 1);
}

register_sync_counter!(
    PIPELINE_CHANGES_TOTAL,
    "Row-level output changes emitted by pipelines"
);
pub fn log_changes(count: u64) {
    log_counter(&PIPELINE_CHANGES_TOTAL, count);
}
