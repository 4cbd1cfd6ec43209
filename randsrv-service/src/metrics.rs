//! Metrics definitions for the randomness service.
//!
//! All metrics carry an `instance` label with the name of the OPRF instance.

/// Metrics key for evaluated points
pub const METRICS_KEY_POINTS_EVALUATED: &str = "randsrv.points.evaluated";
/// Metrics key for punctured epochs
pub const METRICS_KEY_EPOCH_PUNCTURES: &str = "randsrv.epoch.punctures";
/// Metrics key for key rotations
pub const METRICS_KEY_KEY_ROTATIONS: &str = "randsrv.key.rotations";
/// Metrics key for failed sync attempts
pub const METRICS_KEY_SYNC_FAILURES: &str = "randsrv.sync.failures";
/// Metrics key for the current epoch
pub const METRICS_KEY_EPOCH_CURRENT: &str = "randsrv.epoch.current";
/// Metrics key for live keys
pub const METRICS_KEY_KEY_LIVE: &str = "randsrv.key.live";

/// Label key used for the instance name.
pub const METRICS_LABEL_INSTANCE: &str = "instance";

/// Describe all metrics used by the service.
///
/// This calls the `describe_*` functions from the `metrics` crate to set metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_KEY_POINTS_EVALUATED,
        metrics::Unit::Count,
        "Number of points evaluated"
    );
    metrics::describe_counter!(
        METRICS_KEY_EPOCH_PUNCTURES,
        metrics::Unit::Count,
        "Number of punctured epochs"
    );
    metrics::describe_counter!(
        METRICS_KEY_KEY_ROTATIONS,
        metrics::Unit::Count,
        "Number of keys replaced after exhaustion"
    );
    metrics::describe_counter!(
        METRICS_KEY_SYNC_FAILURES,
        metrics::Unit::Count,
        "Number of failed attempts to fetch the key state from the leader"
    );
    metrics::describe_gauge!(
        METRICS_KEY_EPOCH_CURRENT,
        metrics::Unit::Count,
        "The currently active epoch"
    );
    metrics::describe_gauge!(
        METRICS_KEY_KEY_LIVE,
        metrics::Unit::Count,
        "Whether the instance has a live key"
    );
}
