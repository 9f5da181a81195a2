use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

lazy_static::lazy_static! {
    pub static ref INDEX_BUILD_DURATION: HistogramVec = register_histogram_vec!(
        "quiver_index_build_duration_seconds", "Full index build duration",
        &["column", "index_type"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();
    pub static ref TRAINING_DURATION: HistogramVec = register_histogram_vec!(
        "quiver_training_duration_seconds", "Training stage duration",
        &["stage"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();
    pub static ref ASSIGNMENT_DURATION: HistogramVec = register_histogram_vec!(
        "quiver_assignment_duration_seconds", "Batched nearest-centroid assignment duration",
        &["path"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();
    pub static ref OPTIMIZE_DURATION: HistogramVec = register_histogram_vec!(
        "quiver_optimize_duration_seconds", "Incremental optimize duration",
        &["column"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();
    pub static ref COMPACTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiver_compactions_total", "Delta compactions", &["column", "status"]
    ).unwrap();
    pub static ref ROWS_INDEXED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiver_rows_indexed_total", "Rows encoded into posting lists", &["column", "phase"]
    ).unwrap();
    pub static ref ACCELERATOR_FALLBACKS_TOTAL: IntCounter = register_int_counter!(
        "quiver_accelerator_fallbacks_total",
        "Preferred accelerator requests served by the reference path"
    ).unwrap();
    pub static ref INDEX_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiver_index_errors_total", "Index operation failures", &["operation", "kind"]
    ).unwrap();
    pub static ref CACHED_MODELS: IntGauge = register_int_gauge!(
        "quiver_cached_models", "Loaded index models held in the cache"
    ).unwrap();

    pub static ref STORAGE_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "quiver_storage_operation_duration_seconds", "Object store operation latency",
        &["operation"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
    pub static ref STORAGE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiver_storage_errors_total", "Object store operation errors", &["operation"]
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&INDEX_BUILD_DURATION);
    lazy_static::initialize(&TRAINING_DURATION);
    lazy_static::initialize(&ASSIGNMENT_DURATION);
    lazy_static::initialize(&OPTIMIZE_DURATION);
    lazy_static::initialize(&COMPACTIONS_TOTAL);
    lazy_static::initialize(&ROWS_INDEXED_TOTAL);
    lazy_static::initialize(&ACCELERATOR_FALLBACKS_TOTAL);
    lazy_static::initialize(&INDEX_ERRORS_TOTAL);
    lazy_static::initialize(&CACHED_MODELS);
    lazy_static::initialize(&STORAGE_OPERATION_DURATION);
    lazy_static::initialize(&STORAGE_ERRORS_TOTAL);
}

/// Render every registered metric in the prometheus text format.
pub fn gather_text() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
