//! Merge of a main segment and its deltas into one main segment.
//!
//! Partitions are merged one at a time so only one partition per segment is
//! resident. Order within a partition is main first, then deltas in publish
//! order; a row id seen earlier wins over later copies.

use std::collections::BTreeSet;

use roaring::RoaringTreemap;
use tracing::{debug, warn};

use crate::dataset::SegmentRef;
use crate::error::{QuiverError, Result};
use crate::index::posting::{PartitionedPostings, PostingList, PostingShape};
use crate::index::store::IndexStore;

#[derive(Debug)]
pub struct MergeOutcome {
    pub postings: PartitionedPostings,
    pub duplicates: usize,
    /// Sorted union of the inputs' fragment ids.
    pub fragment_ids: Vec<u32>,
}

/// Concatenate `lists` into one, dropping row ids already in `seen`.
pub fn merge_lists(
    shape: PostingShape,
    lists: &[&PostingList],
    seen: &mut RoaringTreemap,
) -> Result<(PostingList, usize)> {
    let mut merged = PostingList::new(shape);
    let mut duplicates = 0usize;
    for list in lists {
        if list.shape() != shape {
            return Err(QuiverError::CorruptIndex(format!(
                "cannot merge posting list of shape {:?} into {:?}",
                list.shape(),
                shape
            )));
        }
        for entry in list.entries() {
            if seen.insert(entry.row_id) {
                merged.push_entry(entry)?;
            } else {
                duplicates += 1;
            }
        }
    }
    Ok((merged, duplicates))
}

/// Merge stored `segments` (main first) and an optional in-memory delta.
pub async fn merge_segments(
    index_store: &IndexStore,
    segments: &[SegmentRef],
    pending: Option<(&PartitionedPostings, &[u32])>,
    num_partitions: usize,
    shape: PostingShape,
) -> Result<MergeOutcome> {
    let mut seen = RoaringTreemap::new();
    let mut duplicates = 0usize;
    let mut lists = Vec::with_capacity(num_partitions);

    for partition in 0..num_partitions {
        let stored = futures::future::try_join_all(
            segments
                .iter()
                .map(|s| index_store.load_partition(&s.id, partition)),
        )
        .await?;
        let mut inputs: Vec<&PostingList> = stored.iter().collect();
        if let Some((postings, _)) = pending {
            let list = postings.lists().get(partition).ok_or_else(|| {
                QuiverError::CorruptIndex(format!("pending delta lacks partition {partition}"))
            })?;
            inputs.push(list);
        }
        let (merged, dups) = merge_lists(shape, &inputs, &mut seen)?;
        duplicates += dups;
        lists.push(merged);
    }

    if duplicates > 0 {
        warn!(duplicates, "dropped duplicate row ids during compaction");
    }

    let mut fragment_ids: BTreeSet<u32> = segments
        .iter()
        .flat_map(|s| s.fragment_ids.iter().copied())
        .collect();
    if let Some((_, ids)) = pending {
        fragment_ids.extend(ids.iter().copied());
    }
    let postings = PartitionedPostings::from_lists(lists)?;
    debug!(
        rows = postings.num_rows(),
        segments = segments.len(),
        "merged segments"
    );
    Ok(MergeOutcome {
        postings,
        duplicates,
        fragment_ids: fragment_ids.into_iter().collect(),
    })
}
