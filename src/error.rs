use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuiverError {
    // Storage errors
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("storage path error: {0}")]
    StoragePath(#[from] object_store::path::Error),

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    // Dataset errors
    #[error("dataset already exists: {uri}")]
    DatasetExists { uri: String },

    #[error("dataset not found: {uri}")]
    DatasetNotFound { uri: String },

    #[error("column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("manifest conflict (concurrent write) for dataset: {uri}")]
    ManifestConflict { uri: String },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Index configuration and precondition errors
    #[error("invalid index config: {0}")]
    InvalidConfig(String),

    #[error("dimension {dim} is not divisible by num_sub_vectors {num_sub_vectors}")]
    InvalidDimension { dim: usize, num_sub_vectors: usize },

    #[error("insufficient data: need at least {required} rows, got {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("index already exists on column {column} (use replace to rebuild)")]
    IndexExists { column: String },

    #[error("no index on column {column}")]
    IndexNotFound { column: String },

    #[error("unsupported metric: {0}")]
    UnsupportedMetric(String),

    #[error("accelerator unavailable: {requested} execution was requested")]
    AcceleratorUnavailable { requested: String },

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("illegal index state transition: {0}")]
    IllegalTransition(String),

    #[error("operation cancelled")]
    Cancelled,

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker task failed: {0}")]
    Join(String),
}

impl From<rmp_serde::encode::Error> for QuiverError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        QuiverError::Serialization(format!("msgpack encode: {e}"))
    }
}

impl From<tokio::task::JoinError> for QuiverError {
    fn from(e: tokio::task::JoinError) -> Self {
        QuiverError::Join(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuiverError>;

impl QuiverError {
    /// Stable short label, used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            QuiverError::NotFound { .. } => "not_found",
            QuiverError::Storage(_) | QuiverError::StoragePath(_) => "storage",
            QuiverError::Json(_) | QuiverError::Serialization(_) => "serialization",
            QuiverError::ChecksumMismatch { .. } => "checksum_mismatch",
            QuiverError::DatasetExists { .. } => "dataset_exists",
            QuiverError::DatasetNotFound { .. } => "dataset_not_found",
            QuiverError::ColumnNotFound { .. } => "column_not_found",
            QuiverError::ManifestConflict { .. } => "manifest_conflict",
            QuiverError::DimensionMismatch { .. } => "dimension_mismatch",
            QuiverError::InvalidConfig(_) => "invalid_config",
            QuiverError::InvalidDimension { .. } => "invalid_dimension",
            QuiverError::InsufficientData { .. } => "insufficient_data",
            QuiverError::IndexExists { .. } => "index_exists",
            QuiverError::IndexNotFound { .. } => "index_not_found",
            QuiverError::UnsupportedMetric(_) => "unsupported_metric",
            QuiverError::AcceleratorUnavailable { .. } => "accelerator_unavailable",
            QuiverError::CorruptIndex(_) => "corrupt_index",
            QuiverError::IllegalTransition(_) => "illegal_transition",
            QuiverError::Cancelled => "cancelled",
            QuiverError::Config(_) => "config",
            QuiverError::Io(_) => "io",
            QuiverError::Join(_) => "join",
        }
    }

    /// True for errors raised by eager validation, before training or
    /// encoding has started.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            QuiverError::InvalidConfig(_)
                | QuiverError::InvalidDimension { .. }
                | QuiverError::InsufficientData { .. }
                | QuiverError::IndexExists { .. }
                | QuiverError::UnsupportedMetric(_)
                | QuiverError::ColumnNotFound { .. }
                | QuiverError::AcceleratorUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(QuiverError::InvalidConfig("num_bits".into()).is_precondition());
        assert!(QuiverError::InsufficientData {
            required: 8,
            available: 4
        }
        .is_precondition());
        assert!(QuiverError::IndexExists {
            column: "vector".into()
        }
        .is_precondition());
        assert!(QuiverError::UnsupportedMetric("hamming".into()).is_precondition());

        assert!(!QuiverError::CorruptIndex("bad magic".into()).is_precondition());
        assert!(!QuiverError::Cancelled.is_precondition());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(
            QuiverError::InvalidDimension {
                dim: 10,
                num_sub_vectors: 3
            }
            .kind(),
            "invalid_dimension"
        );
        assert_eq!(
            QuiverError::AcceleratorUnavailable {
                requested: "required".into()
            }
            .kind(),
            "accelerator_unavailable"
        );
        assert_eq!(QuiverError::Config("x".into()).kind(), "config");
    }

    #[test]
    fn test_display_formatting() {
        let err = QuiverError::InsufficientData {
            required: 256,
            available: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("256"));
        assert!(msg.contains("100"));

        let err = QuiverError::InvalidDimension {
            dim: 130,
            num_sub_vectors: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("130"));
        assert!(msg.contains('4'));

        let err = QuiverError::ChecksumMismatch {
            expected: 111,
            actual: 222,
        };
        let msg = err.to_string();
        assert!(msg.contains("111"));
        assert!(msg.contains("222"));
    }

    #[test]
    fn test_from_msgpack_error() {
        let err: QuiverError =
            rmp_serde::encode::Error::Syntax("test error".into()).into();
        match &err {
            QuiverError::Serialization(msg) => assert!(msg.contains("test error")),
            other => panic!("expected Serialization, got {:?}", other),
        }
    }
}
