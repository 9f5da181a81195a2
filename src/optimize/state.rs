use crate::dataset::IndexRef;
use crate::error::{QuiverError, Result};

/// Lifecycle of a logical index.
///
/// `Published -> (Append) -> HasDeltas -> (ThresholdExceeded) -> Compacting
/// -> (Swapped) -> Published`. `HasDeltas` also accepts further appends.
/// `Compacting` only exists inside an optimize pass and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Published,
    HasDeltas,
    Compacting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEvent {
    /// A delta segment was published.
    Append,
    /// Accumulated deltas crossed the compaction threshold, or a compaction
    /// was forced.
    ThresholdExceeded,
    /// The compacted main segment replaced main and deltas.
    Swapped,
}

impl IndexState {
    /// State as derived from the persisted index reference.
    pub fn of(index_ref: &IndexRef) -> Self {
        if index_ref.deltas.is_empty() {
            IndexState::Published
        } else {
            IndexState::HasDeltas
        }
    }

    pub fn apply(self, event: IndexEvent) -> Result<Self> {
        use IndexEvent::*;
        use IndexState::*;
        match (self, event) {
            (Published, Append) | (HasDeltas, Append) => Ok(HasDeltas),
            (HasDeltas, ThresholdExceeded) => Ok(Compacting),
            (Compacting, Swapped) => Ok(Published),
            (state, event) => Err(QuiverError::IllegalTransition(format!(
                "{event:?} is not allowed in state {state:?}"
            ))),
        }
    }
}
